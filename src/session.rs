//! Secure transport session over a non-blocking stream.
//!
//! A session owns one raw stream, one engine and four buffers:
//!
//! ```text
//!   out_plain --wrap--> out_net --write--> stream
//!   in_plain <--unwrap-- in_net <--read--- stream
//! ```
//!
//! All buffers start small and grow on demand, up to the engine's
//! application and packet sizes. Incomplete records stay in `in_net` across
//! calls so records split over several socket reads reassemble losslessly.
//!
//! No call ever waits on the stream. When the socket reports `WouldBlock`
//! mid-handshake or mid-write, the session keeps its buffered state and
//! reports [`HandshakeProgress::Pending`] or [`WriteProgress::Pending`]; the
//! caller resumes it once the stream is ready again. Deadlines are the
//! caller's to enforce.

use crate::buffer::SessionBuffer;
use crate::engine::{HandshakeStatus, SecureEngine, Status};
use crate::error::{HandshakeError, RecordError, SessionError};
use crate::tasks::{self, TaskExecutor};
use bytes::{Bytes, BytesMut};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::Arc;

/// A byte stream a session can run over.
pub trait RawStream: Read + Write {
    /// Shut down both directions of the stream.
    fn shutdown(&self) -> io::Result<()>;
}

impl RawStream for mio::net::TcpStream {
    fn shutdown(&self) -> io::Result<()> {
        mio::net::TcpStream::shutdown(self, Shutdown::Both)
    }
}

impl RawStream for std::net::TcpStream {
    fn shutdown(&self) -> io::Result<()> {
        std::net::TcpStream::shutdown(self, Shutdown::Both)
    }
}

/// Session tuning.
#[derive(Clone)]
pub struct SessionOptions {
    /// Starting capacity of each of the four buffers.
    pub initial_buffer_capacity: usize,
    /// Runs delegated handshake tasks. `None` runs them inline.
    pub executor: Option<Arc<TaskExecutor>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            initial_buffer_capacity: 4096,
            executor: None,
        }
    }
}

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    NotStarted,
    Handshaking(HandshakeStatus),
    Finished,
    Closed,
}

/// Result of a [`SecureSession::handshake`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeProgress {
    Finished,
    /// The stream would block; call again once it is ready.
    Pending,
    /// The handshake ended without finishing (the engine was never
    /// handshaking, or the peer closed cleanly with both directions done).
    Closed,
}

/// Result of a [`SecureSession::write`] or [`SecureSession::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProgress {
    /// Every queued byte reached the stream.
    Flushed,
    /// Output is still buffered; call `flush()` once the stream is writable.
    Pending,
}

/// Result of a [`SecureSession::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Decoded application bytes.
    Data(Bytes),
    /// Nothing available right now.
    NoData,
    /// The peer reached end of stream and nothing was decoded.
    PeerClosed,
}

/// A TLS session over a raw stream.
pub struct SecureSession<E, S> {
    engine: E,
    stream: S,
    state: HandshakeState,
    out_plain: SessionBuffer,
    out_net: SessionBuffer,
    in_net: SessionBuffer,
    in_plain: SessionBuffer,
    /// Plaintext decoded during the handshake that no longer fit `in_plain`.
    early_plain: BytesMut,
    options: SessionOptions,
}

impl<E: SecureEngine, S: RawStream> SecureSession<E, S> {
    pub fn new(engine: E, stream: S, options: SessionOptions) -> Self {
        let capacity = options.initial_buffer_capacity;
        Self {
            engine,
            stream,
            state: HandshakeState::NotStarted,
            out_plain: SessionBuffer::new(capacity),
            out_net: SessionBuffer::new(capacity),
            in_net: SessionBuffer::new(capacity),
            in_plain: SessionBuffer::new(capacity),
            early_plain: BytesMut::new(),
            options,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Advance the handshake as far as the stream allows.
    ///
    /// Returns `Pending` when the stream would block. Calling again resumes
    /// from where the previous call stopped.
    pub fn handshake(&mut self) -> Result<HandshakeProgress, SessionError> {
        match self.state {
            HandshakeState::Finished => return Ok(HandshakeProgress::Finished),
            HandshakeState::Closed => return Err(SessionError::NotEstablished),
            HandshakeState::NotStarted => {
                self.engine
                    .begin_handshake()
                    .map_err(HandshakeError::from)?;
                self.state = HandshakeState::Handshaking(self.engine.handshake_status());
            }
            HandshakeState::Handshaking(_) => {}
        }

        match self.drive_handshake() {
            Ok(true) => {
                self.state = HandshakeState::Finished;
                Ok(HandshakeProgress::Finished)
            }
            Ok(false) => {
                self.state = HandshakeState::Closed;
                Ok(HandshakeProgress::Closed)
            }
            Err(HandshakeError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                Ok(HandshakeProgress::Pending)
            }
            Err(e) => {
                self.state = HandshakeState::Closed;
                Err(e.into())
            }
        }
    }

    /// Run handshake steps until the handshake ends or the stream blocks.
    ///
    /// The engine reports `Finished` only once, so the last status seen is
    /// kept in `state` and a resumed call continues from it.
    fn drive_handshake(&mut self) -> Result<bool, HandshakeError> {
        // ciphertext left over from a blocked write goes first
        self.flush_net()?;

        let mut status = match self.state {
            HandshakeState::Handshaking(status) => status,
            _ => self.engine.handshake_status(),
        };

        loop {
            self.state = HandshakeState::Handshaking(status);
            status = match status {
                HandshakeStatus::NeedUnwrap => match self.handshake_unwrap()? {
                    Some(next) => next,
                    None => return Ok(false),
                },
                HandshakeStatus::NeedWrap => self.handshake_wrap()?,
                HandshakeStatus::NeedTask => {
                    self.run_delegated_tasks();
                    self.engine.handshake_status()
                }
                HandshakeStatus::Finished => return Ok(true),
                HandshakeStatus::NotHandshaking => return Ok(false),
            };
        }
    }

    /// Unwrap one handshake record, reading from the stream as needed.
    ///
    /// `None` means the peer closed after both engine directions were done.
    fn handshake_unwrap(&mut self) -> Result<Option<HandshakeStatus>, HandshakeError> {
        loop {
            let res = self
                .engine
                .unwrap(self.in_net.as_slice(), self.in_plain.spare_mut())?;
            self.in_net.consume(res.consumed);
            self.in_plain.commit(res.produced);

            match res.status {
                Status::Ok => return Ok(Some(res.handshake_status)),
                Status::Closed => return Err(HandshakeError::Closed),
                Status::BufferOverflow => {
                    let size = self.engine.application_buffer_size();
                    if self.in_plain.grow_to(size) {
                        continue;
                    }
                    if self.in_plain.is_empty() {
                        return Err(HandshakeError::Unexpected("plaintext overflow"));
                    }
                    // reset: park the plaintext for the first read()
                    self.early_plain.extend_from_slice(self.in_plain.as_slice());
                    self.in_plain.clear();
                    continue;
                }
                Status::BufferUnderflow => self.make_room_in_net(),
            }

            match self.fill_net() {
                Ok(0) => {
                    if self.engine.is_inbound_done() && self.engine.is_outbound_done() {
                        return Ok(None);
                    }
                    return Err(HandshakeError::PeerClosed);
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Wrap pending handshake output and write all of it.
    fn handshake_wrap(&mut self) -> Result<HandshakeStatus, HandshakeError> {
        loop {
            let res = self.engine.wrap(&[], self.out_net.spare_mut())?;
            self.out_net.commit(res.produced);

            match res.status {
                Status::Ok => {
                    self.state = HandshakeState::Handshaking(res.handshake_status);
                    self.flush_net()?;
                    return Ok(res.handshake_status);
                }
                Status::BufferOverflow => {
                    if !self.out_net.is_empty() {
                        self.flush_net()?;
                    } else if !self.out_net.grow_to(self.engine.packet_buffer_size()) {
                        return Err(HandshakeError::Unexpected("ciphertext overflow"));
                    }
                }
                Status::BufferUnderflow => {
                    return Err(HandshakeError::Unexpected("underflow on wrap"));
                }
                Status::Closed => {
                    // the alert is sent if the stream takes it
                    let _ = self.flush_net();
                    return Err(HandshakeError::Closed);
                }
            }
        }
    }

    fn run_delegated_tasks(&mut self) {
        let mut pending = Vec::new();
        while let Some(task) = self.engine.delegated_task() {
            pending.push(task);
        }
        if pending.is_empty() {
            return;
        }

        match &self.options.executor {
            Some(executor) => executor.submit(pending).wait(),
            None => tasks::run_inline(pending),
        }
    }

    /// Read and decode whatever application data is available.
    pub fn read(&mut self) -> Result<ReadOutcome, SessionError> {
        self.ensure_established()?;
        Ok(self.read_records()?)
    }

    fn read_records(&mut self) -> Result<ReadOutcome, RecordError> {
        // plaintext decoded during the handshake
        let mut plaintext = std::mem::take(&mut self.early_plain);
        if !self.in_plain.is_empty() {
            plaintext.extend_from_slice(self.in_plain.as_slice());
            self.in_plain.clear();
        }

        // complete records already buffered are decoded before touching the
        // stream again
        self.decode_buffered(&mut plaintext)?;
        if !plaintext.is_empty() {
            return Ok(ReadOutcome::Data(plaintext.freeze()));
        }

        loop {
            match self.fill_net() {
                Ok(0) => return Ok(ReadOutcome::PeerClosed),
                Ok(_) => {
                    self.decode_buffered(&mut plaintext)?;
                    if !plaintext.is_empty() {
                        return Ok(ReadOutcome::Data(plaintext.freeze()));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::NoData);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Unwrap every complete record in `in_net`, appending plaintext to `out`.
    ///
    /// `in_plain` is drained into `out` after every unwrap, so an overflow
    /// always meets an empty buffer: it grows to the application size, and
    /// once it is that large there is nothing left to reset.
    fn decode_buffered(&mut self, out: &mut BytesMut) -> Result<(), RecordError> {
        loop {
            let res = self
                .engine
                .unwrap(self.in_net.as_slice(), self.in_plain.spare_mut())?;
            self.in_net.consume(res.consumed);
            self.in_plain.commit(res.produced);

            if !self.in_plain.is_empty() {
                out.extend_from_slice(self.in_plain.as_slice());
                self.in_plain.clear();
            }

            match res.status {
                Status::Ok => {
                    if res.consumed == 0 && res.produced == 0 {
                        return Err(RecordError::Stalled("read"));
                    }
                }
                Status::BufferUnderflow => {
                    self.make_room_in_net();
                    return Ok(());
                }
                Status::BufferOverflow => {
                    if res.produced > 0 {
                        continue;
                    }
                    let size = self.engine.application_buffer_size();
                    if !self.in_plain.grow_to(size) {
                        return Err(RecordError::BufferExhausted(
                            "incoming plaintext",
                            self.in_plain.capacity(),
                        ));
                    }
                }
                Status::Closed => {
                    if out.is_empty() {
                        return Err(RecordError::Closed("read"));
                    }
                    // deliver what was decoded, fail on the next read
                    return Ok(());
                }
            }
        }
    }

    /// Queue `payload` for encryption and write as much as the stream takes.
    pub fn write(&mut self, payload: &[u8]) -> Result<WriteProgress, SessionError> {
        self.ensure_established()?;
        self.out_plain.extend_from_slice(payload);
        self.flush()
    }

    /// Resume writing output queued by an earlier `write()`.
    pub fn flush(&mut self) -> Result<WriteProgress, SessionError> {
        self.ensure_established()?;
        match self.write_records() {
            Ok(()) => Ok(WriteProgress::Flushed),
            Err(RecordError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                Ok(WriteProgress::Pending)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// True while plaintext or ciphertext is waiting for the stream.
    pub fn has_pending_output(&self) -> bool {
        !self.out_plain.is_empty() || !self.out_net.is_empty()
    }

    fn write_records(&mut self) -> Result<(), RecordError> {
        self.flush_net()?;

        while !self.out_plain.is_empty() {
            let res = self
                .engine
                .wrap(self.out_plain.as_slice(), self.out_net.spare_mut())?;
            self.out_plain.consume(res.consumed);
            self.out_net.commit(res.produced);

            match res.status {
                Status::Ok => {
                    if res.consumed == 0 && res.produced == 0 {
                        return Err(RecordError::Stalled("write"));
                    }
                }
                Status::BufferOverflow => {
                    if self.out_net.is_empty()
                        && !self.out_net.grow_to(self.engine.packet_buffer_size())
                    {
                        return Err(RecordError::BufferExhausted(
                            "outgoing ciphertext",
                            self.out_net.capacity(),
                        ));
                    }
                }
                Status::BufferUnderflow => return Err(RecordError::WriteUnderflow),
                Status::Closed => {
                    let _ = self.flush_net();
                    return Err(RecordError::Closed("write"));
                }
            }

            self.flush_net()?;
        }

        Ok(())
    }

    /// Send close_notify, flush what the stream takes and close the stream.
    ///
    /// Closing an already closed session is a no-op.
    pub fn close(&mut self) -> Result<(), SessionError> {
        if self.state == HandshakeState::Closed && self.engine.is_outbound_done() {
            return Ok(());
        }
        self.state = HandshakeState::Closed;

        self.engine.close_outbound();
        let result = match self.flush_close() {
            Err(RecordError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::debug!("close_notify not fully flushed");
                Ok(())
            }
            other => other,
        };

        if let Err(e) = self.stream.shutdown() {
            if e.kind() != io::ErrorKind::NotConnected {
                tracing::debug!("shutdown error: {e}");
            }
        }
        self.release_buffers();
        result.map_err(SessionError::from)
    }

    fn flush_close(&mut self) -> Result<(), RecordError> {
        while !self.engine.is_outbound_done() {
            let res = self.engine.wrap(&[], self.out_net.spare_mut())?;
            self.out_net.commit(res.produced);

            // shutdown ciphertext is flushed whatever the status
            self.flush_net()?;

            if res.produced == 0 {
                if res.status == Status::BufferOverflow
                    && self.out_net.grow_to(self.engine.packet_buffer_size())
                {
                    continue;
                }
                break;
            }
        }
        Ok(())
    }

    fn release_buffers(&mut self) {
        for buf in [
            &mut self.out_plain,
            &mut self.out_net,
            &mut self.in_net,
            &mut self.in_plain,
        ] {
            *buf = SessionBuffer::new(0);
        }
    }

    fn ensure_established(&self) -> Result<(), SessionError> {
        if self.state == HandshakeState::Finished {
            Ok(())
        } else {
            Err(SessionError::NotEstablished)
        }
    }

    /// Grow `in_net` to the packet size, or compact it once it is that big.
    fn make_room_in_net(&mut self) {
        let size = self.engine.packet_buffer_size();
        if !self.in_net.grow_to(size) {
            self.in_net.compact();
        }
    }

    fn fill_net(&mut self) -> io::Result<usize> {
        if self.in_net.spare_capacity() == 0 {
            self.make_room_in_net();
        }
        if self.in_net.spare_capacity() == 0 {
            return Err(io::Error::other("incoming ciphertext buffer exhausted"));
        }

        let n = self.stream.read(self.in_net.spare_mut())?;
        self.in_net.commit(n);
        Ok(n)
    }

    /// Write `out_net` to the stream until it is empty or the stream blocks.
    ///
    /// Unsent bytes stay in `out_net`.
    fn flush_net(&mut self) -> io::Result<()> {
        while !self.out_net.is_empty() {
            match self.stream.write(self.out_net.as_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.out_net.consume(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.stream.flush()
    }
}
