//! Error types.
//!
//! Transport errors are scoped to one connection. Only credential loading at
//! startup is fatal to the whole process.

use std::io;

/// Errors raised by a secure-transport engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Why a handshake did not complete.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("peer closed the connection during handshake")]
    PeerClosed,
    #[error("engine reported closed during handshake")]
    Closed,
    #[error("handshake timed out")]
    TimedOut,
    #[error("engine reported {0} during handshake")]
    Unexpected(&'static str),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Failures while exchanging application records.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("engine reported closed during {0}")]
    Closed(&'static str),
    #[error("engine reported buffer underflow during write")]
    WriteUnderflow,
    #[error("{0} buffer exhausted at {1} bytes")]
    BufferExhausted(&'static str, usize),
    #[error("engine made no progress during {0}")]
    Stalled(&'static str),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Errors surfaced by [`SecureSession`](crate::session::SecureSession).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("record error: {0}")]
    Record(#[from] RecordError),
    #[error("session is not established")]
    NotEstablished,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors loading certificates, keys or trust anchors.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },
    #[error("no certificates found in {0}")]
    NoCertificates(String),
    #[error("invalid trust store: {0}")]
    Trust(String),
    #[error("invalid credentials: {0}")]
    Tls(#[from] rustls::Error),
}

/// Errors loading the server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors raised while loading or running a request processor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessorError {
    #[error("invalid processor definition: {0}")]
    Load(String),
    #[error("processing failed: {0}")]
    Process(String),
}

/// Errors refreshing the processor definition from disk.
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("processor definition {0} not found")]
    Missing(String),
    #[error("failed to read processor definition: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Processor(#[from] ProcessorError),
}

/// Errors that stop the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error(transparent)]
    Reload(#[from] ReloadError),
}
