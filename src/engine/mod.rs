//! Secure-transport engine abstraction.
//!
//! An engine performs handshake and record processing over caller-owned
//! buffers and never touches a socket itself. `wrap()` turns plaintext into
//! ciphertext, `unwrap()` turns ciphertext into plaintext, and both report a
//! record [`Status`] plus the [`HandshakeStatus`] that tells the caller what
//! to do next. CPU-heavy handshake steps may be handed out as delegated tasks
//! instead of being run inline.

mod tls;

pub use tls::{TlsEngine, TlsEngineOptions};

use crate::error::EngineError;

/// Outcome of a single wrap or unwrap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The operation made progress.
    Ok,
    /// The source did not hold a complete record.
    BufferUnderflow,
    /// The destination was too small for the result.
    BufferOverflow,
    /// The engine has been closed in this direction.
    Closed,
}

/// What the handshake needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// No handshake is in progress (not yet begun, or long complete).
    NotHandshaking,
    /// Waiting for data from the peer.
    NeedUnwrap,
    /// Has data to send to the peer.
    NeedWrap,
    /// Waiting for delegated tasks to run.
    NeedTask,
    /// The handshake just completed.
    Finished,
}

/// Result of a wrap or unwrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    pub status: Status,
    pub handshake_status: HandshakeStatus,
    /// Bytes consumed from the source
    pub consumed: usize,
    /// Bytes written to the destination
    pub produced: usize,
}

impl EngineResult {
    pub fn new(
        status: Status,
        handshake_status: HandshakeStatus,
        consumed: usize,
        produced: usize,
    ) -> Self {
        Self {
            status,
            handshake_status,
            consumed,
            produced,
        }
    }
}

/// A unit of handshake work the engine defers to the caller.
pub type DelegatedTask = Box<dyn FnOnce() + Send + 'static>;

/// Handshake and record processing over caller-supplied buffers.
pub trait SecureEngine: Send {
    /// Start the handshake. Before this the status is `NotHandshaking`.
    fn begin_handshake(&mut self) -> Result<(), EngineError>;

    /// Poll the current handshake status.
    fn handshake_status(&mut self) -> HandshakeStatus;

    /// Encrypt plaintext from `src` into `dst`.
    ///
    /// Pending handshake or alert output is always emitted first.
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError>;

    /// Decrypt at most one record from `src` into `dst`.
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError>;

    /// Take the next pending delegated task, if any.
    fn delegated_task(&mut self) -> Option<DelegatedTask>;

    /// Begin an orderly outbound close.
    fn close_outbound(&mut self);

    /// True once the outbound close has been fully emitted.
    fn is_outbound_done(&self) -> bool;

    /// True once the peer's close has been received.
    fn is_inbound_done(&self) -> bool;

    /// Largest plaintext a single unwrap can produce.
    fn application_buffer_size(&self) -> usize;

    /// Largest record a single wrap can produce.
    fn packet_buffer_size(&self) -> usize;
}
