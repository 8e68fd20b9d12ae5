//! Engine implementation backed by rustls.
//!
//! rustls is stream oriented: ciphertext goes in through `read_tls()` and
//! comes out through `write_tls()`. This adapter gives it record-at-a-time
//! wrap/unwrap semantics so the session can drive it over explicit buffers:
//!
//! - `unwrap()` feeds exactly one complete record. A partial record is a
//!   `BufferUnderflow`; a destination smaller than the record payload is a
//!   `BufferOverflow`. Nothing is consumed in either case.
//! - `wrap()` flushes pending handshake/alert output first, then encrypts at
//!   most one fragment of application data.
//! - While handshaking, record processing (key exchange, signature and
//!   certificate checks) is handed out as a delegated task instead of being
//!   run inline.

use super::{DelegatedTask, EngineResult, HandshakeStatus, SecureEngine, Status};
use crate::error::EngineError;
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use std::io::{self, Read, Write};
use std::sync::Arc;

const RECORD_HEADER_LEN: usize = 5;

/// Largest plaintext fragment carried by one record.
const MAX_FRAGMENT_LEN: usize = 16 * 1024;

/// Largest expansion of a record payload over its plaintext (TLS 1.2 bound).
const MAX_CIPHERTEXT_EXPANSION: usize = 2048;

const MAX_RECORD_PAYLOAD: usize = MAX_FRAGMENT_LEN + MAX_CIPHERTEXT_EXPANSION;
const MAX_RECORD_LEN: usize = RECORD_HEADER_LEN + MAX_RECORD_PAYLOAD;

/// Space reserved past the plaintext when wrapping one fragment.
const WRAP_OVERHEAD: usize = RECORD_HEADER_LEN + 256;

/// Options for a [`TlsEngine`].
#[derive(Debug, Clone, Copy)]
pub struct TlsEngineOptions {
    /// Hand handshake record processing out as delegated tasks.
    pub delegate_handshake: bool,
}

impl Default for TlsEngineOptions {
    fn default() -> Self {
        Self {
            delegate_handshake: true,
        }
    }
}

/// rustls-backed [`SecureEngine`].
pub struct TlsEngine {
    /// Shared with delegated tasks, which run `process_new_packets()`.
    conn: Arc<Mutex<rustls::Connection>>,
    /// Error raised by the last delegated task, reported on the next call.
    task_failure: Arc<Mutex<Option<rustls::Error>>>,
    delegate_handshake: bool,
    started: bool,
    /// A record has been fed but not yet processed.
    unprocessed: bool,
    finished_reported: bool,
    inbound_done: bool,
    outbound_closed: bool,
}

impl TlsEngine {
    /// Create a server-side engine.
    pub fn server(
        config: Arc<rustls::ServerConfig>,
        options: TlsEngineOptions,
    ) -> Result<Self, EngineError> {
        let conn = rustls::ServerConnection::new(config)?;
        Ok(Self::from_connection(conn.into(), options))
    }

    /// Create a client-side engine for the given server name.
    pub fn client(
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
        options: TlsEngineOptions,
    ) -> Result<Self, EngineError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let conn = rustls::ClientConnection::new(config, name)?;
        Ok(Self::from_connection(conn.into(), options))
    }

    fn from_connection(conn: rustls::Connection, options: TlsEngineOptions) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            task_failure: Arc::new(Mutex::new(None)),
            delegate_handshake: options.delegate_handshake,
            started: false,
            unprocessed: false,
            finished_reported: false,
            inbound_done: false,
            outbound_closed: false,
        }
    }

    fn check_task_failure(&self) -> Result<(), EngineError> {
        match self.task_failure.lock().take() {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// `Finished` is reported exactly once; afterwards the engine is
    /// `NotHandshaking` again.
    fn status_of(&mut self, conn: &rustls::Connection) -> HandshakeStatus {
        if !self.started {
            return HandshakeStatus::NotHandshaking;
        }
        if self.unprocessed {
            return HandshakeStatus::NeedTask;
        }
        if conn.is_handshaking() {
            return if conn.wants_write() {
                HandshakeStatus::NeedWrap
            } else {
                HandshakeStatus::NeedUnwrap
            };
        }
        if self.finished_reported {
            return HandshakeStatus::NotHandshaking;
        }
        if conn.wants_write() {
            return HandshakeStatus::NeedWrap;
        }
        self.finished_reported = true;
        HandshakeStatus::Finished
    }
}

impl SecureEngine for TlsEngine {
    fn begin_handshake(&mut self) -> Result<(), EngineError> {
        self.started = true;
        Ok(())
    }

    fn handshake_status(&mut self) -> HandshakeStatus {
        let shared = Arc::clone(&self.conn);
        let conn = shared.lock();
        self.status_of(&conn)
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError> {
        self.check_task_failure()?;
        let shared = Arc::clone(&self.conn);
        let mut conn = shared.lock();

        let mut produced = write_ciphertext(&mut conn, dst)?;
        if conn.wants_write() {
            // pending output did not fit
            let status = if produced == 0 {
                Status::BufferOverflow
            } else {
                Status::Ok
            };
            return Ok(EngineResult::new(status, self.status_of(&conn), 0, produced));
        }

        if self.outbound_closed {
            return Ok(EngineResult::new(
                Status::Closed,
                self.status_of(&conn),
                0,
                produced,
            ));
        }

        let mut consumed = 0;
        if !src.is_empty() && !conn.is_handshaking() {
            let room = (dst.len() - produced).saturating_sub(WRAP_OVERHEAD);
            let take = src.len().min(MAX_FRAGMENT_LEN).min(room);
            if take == 0 {
                let status = if produced == 0 {
                    Status::BufferOverflow
                } else {
                    Status::Ok
                };
                return Ok(EngineResult::new(status, self.status_of(&conn), 0, produced));
            }
            consumed = conn.writer().write(&src[..take])?;
            produced += write_ciphertext(&mut conn, &mut dst[produced..])?;
        }

        Ok(EngineResult::new(
            Status::Ok,
            self.status_of(&conn),
            consumed,
            produced,
        ))
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError> {
        self.check_task_failure()?;
        let shared = Arc::clone(&self.conn);
        let mut conn = shared.lock();

        // plaintext left behind by a delegated task
        let leftover = read_plaintext(&mut conn, dst)?;
        if leftover > 0 {
            return Ok(EngineResult::new(
                Status::Ok,
                self.status_of(&conn),
                0,
                leftover,
            ));
        }

        if self.inbound_done {
            return Ok(EngineResult::new(
                Status::Closed,
                self.status_of(&conn),
                0,
                0,
            ));
        }

        let record_len = match record_len(src) {
            Some(len) if len > MAX_RECORD_LEN => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("record length {len} exceeds maximum"),
                )
                .into());
            }
            Some(len) if len <= src.len() => len,
            _ => {
                return Ok(EngineResult::new(
                    Status::BufferUnderflow,
                    self.status_of(&conn),
                    0,
                    0,
                ));
            }
        };

        if dst.len() < record_len - RECORD_HEADER_LEN {
            return Ok(EngineResult::new(
                Status::BufferOverflow,
                self.status_of(&conn),
                0,
                0,
            ));
        }

        let mut record = &src[..record_len];
        while !record.is_empty() {
            if conn.read_tls(&mut record)? == 0 {
                break;
            }
        }
        let consumed = record_len - record.len();

        if self.delegate_handshake && conn.is_handshaking() {
            self.unprocessed = true;
            return Ok(EngineResult::new(
                Status::Ok,
                HandshakeStatus::NeedTask,
                consumed,
                0,
            ));
        }

        let state = conn.process_new_packets()?;
        let produced = read_plaintext(&mut conn, dst)?;
        if state.peer_has_closed() {
            self.inbound_done = true;
        }

        let status = if self.inbound_done && produced == 0 {
            Status::Closed
        } else {
            Status::Ok
        };
        Ok(EngineResult::new(
            status,
            self.status_of(&conn),
            consumed,
            produced,
        ))
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        if !self.unprocessed {
            return None;
        }
        self.unprocessed = false;

        let conn = Arc::clone(&self.conn);
        let failure = Arc::clone(&self.task_failure);
        Some(Box::new(move || {
            if let Err(e) = conn.lock().process_new_packets() {
                *failure.lock() = Some(e);
            }
        }))
    }

    fn close_outbound(&mut self) {
        self.conn.lock().send_close_notify();
        self.outbound_closed = true;
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_closed && !self.conn.lock().wants_write()
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_done
    }

    fn application_buffer_size(&self) -> usize {
        MAX_RECORD_PAYLOAD
    }

    fn packet_buffer_size(&self) -> usize {
        MAX_RECORD_LEN
    }
}

/// Total length of the record at the front of `src`, if its header is present.
fn record_len(src: &[u8]) -> Option<usize> {
    if src.len() < RECORD_HEADER_LEN {
        return None;
    }
    let payload = u16::from_be_bytes([src[3], src[4]]) as usize;
    Some(RECORD_HEADER_LEN + payload)
}

fn write_ciphertext(conn: &mut rustls::Connection, dst: &mut [u8]) -> Result<usize, EngineError> {
    let total = dst.len();
    let mut out: &mut [u8] = dst;
    while conn.wants_write() && !out.is_empty() {
        if conn.write_tls(&mut out)? == 0 {
            break;
        }
    }
    Ok(total - out.len())
}

fn read_plaintext(conn: &mut rustls::Connection, dst: &mut [u8]) -> Result<usize, EngineError> {
    let mut produced = 0;
    while produced < dst.len() {
        match conn.reader().read(&mut dst[produced..]) {
            Ok(0) => break,
            Ok(n) => produced += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(produced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPki;

    /// Move bytes between two engines until both report `Finished`.
    fn complete_handshake(client: &mut TlsEngine, server: &mut TlsEngine) -> usize {
        let mut to_server = Vec::new();
        let mut to_client = Vec::new();
        let mut done = [false, false];
        let mut tasks_seen = 0;

        client.begin_handshake().unwrap();
        server.begin_handshake().unwrap();

        for _ in 0..200 {
            if done[0] && done[1] {
                break;
            }
            for i in 0..2 {
                let (engine, inbox, outbox) = if i == 0 {
                    (&mut *client, &mut to_client, &mut to_server)
                } else {
                    (&mut *server, &mut to_server, &mut to_client)
                };
                let mut scratch = vec![0u8; MAX_RECORD_LEN];
                match engine.handshake_status() {
                    HandshakeStatus::NeedWrap => {
                        let res = engine.wrap(&[], &mut scratch).unwrap();
                        outbox.extend_from_slice(&scratch[..res.produced]);
                        done[i] |= res.handshake_status == HandshakeStatus::Finished;
                    }
                    HandshakeStatus::NeedUnwrap => {
                        let res = engine.unwrap(inbox, &mut scratch).unwrap();
                        inbox.drain(..res.consumed);
                        done[i] |= res.handshake_status == HandshakeStatus::Finished;
                    }
                    HandshakeStatus::NeedTask => {
                        while let Some(task) = engine.delegated_task() {
                            task();
                            tasks_seen += 1;
                        }
                    }
                    HandshakeStatus::Finished => done[i] = true,
                    HandshakeStatus::NotHandshaking => {}
                }
            }
        }

        assert!(done[0] && done[1], "handshake did not complete");
        tasks_seen
    }

    fn engine_pair(options: TlsEngineOptions) -> (TlsEngine, TlsEngine) {
        let pki = TestPki::new();
        let server = TlsEngine::server(pki.server_config(), options).unwrap();
        let client = TlsEngine::client(pki.client_config(), "localhost", options).unwrap();
        (client, server)
    }

    #[test]
    fn test_record_len() {
        assert_eq!(record_len(&[0x17, 0x03, 0x03]), None);
        assert_eq!(record_len(&[0x17, 0x03, 0x03, 0x00, 0x10]), Some(21));
        assert_eq!(record_len(&[0x16, 0x03, 0x01, 0x01, 0x00, 0xaa]), Some(261));
    }

    #[test]
    fn test_oversized_record_is_rejected() {
        let (_client, mut server) = engine_pair(TlsEngineOptions::default());
        server.begin_handshake().unwrap();

        let mut plain = vec![0u8; 1024];
        assert!(server.unwrap(&[0x17, 0x03, 0x03, 0xff, 0xff], &mut plain).is_err());
    }

    #[test]
    fn test_not_handshaking_before_begin() {
        let (mut client, mut server) = engine_pair(TlsEngineOptions::default());
        assert_eq!(client.handshake_status(), HandshakeStatus::NotHandshaking);
        assert_eq!(server.handshake_status(), HandshakeStatus::NotHandshaking);
    }

    #[test]
    fn test_initial_statuses() {
        let (mut client, mut server) = engine_pair(TlsEngineOptions::default());
        client.begin_handshake().unwrap();
        server.begin_handshake().unwrap();

        // client speaks first
        assert_eq!(client.handshake_status(), HandshakeStatus::NeedWrap);
        assert_eq!(server.handshake_status(), HandshakeStatus::NeedUnwrap);
    }

    #[test]
    fn test_client_hello_is_handshake_record() {
        let (mut client, _server) = engine_pair(TlsEngineOptions::default());
        client.begin_handshake().unwrap();

        let mut dst = vec![0u8; client.packet_buffer_size()];
        let res = client.wrap(&[], &mut dst).unwrap();
        assert_eq!(res.status, Status::Ok);
        assert!(res.produced > RECORD_HEADER_LEN);
        assert_eq!(dst[0], 0x16);
        assert_eq!(record_len(&dst[..res.produced]), Some(res.produced));
    }

    #[test]
    fn test_wrap_overflow_on_empty_destination() {
        let (mut client, _server) = engine_pair(TlsEngineOptions::default());
        client.begin_handshake().unwrap();

        let res = client.wrap(&[], &mut []).unwrap();
        assert_eq!(res.status, Status::BufferOverflow);
        assert_eq!(res.produced, 0);
    }

    #[test]
    fn test_unwrap_underflow_on_partial_record() {
        let (mut client, mut server) = engine_pair(TlsEngineOptions::default());
        client.begin_handshake().unwrap();
        server.begin_handshake().unwrap();

        let mut hello = vec![0u8; client.packet_buffer_size()];
        let n = client.wrap(&[], &mut hello).unwrap().produced;

        let mut plain = vec![0u8; server.application_buffer_size()];
        let res = server.unwrap(&hello[..3], &mut plain).unwrap();
        assert_eq!(res.status, Status::BufferUnderflow);
        assert_eq!(res.consumed, 0);

        let res = server.unwrap(&hello[..n - 1], &mut plain).unwrap();
        assert_eq!(res.status, Status::BufferUnderflow);
        assert_eq!(res.consumed, 0);

        let res = server.unwrap(&hello[..n], &mut plain).unwrap();
        assert_eq!(res.status, Status::Ok);
        assert_eq!(res.consumed, n);
    }

    #[test]
    fn test_unwrap_overflow_on_small_destination() {
        let (mut client, mut server) = engine_pair(TlsEngineOptions::default());
        client.begin_handshake().unwrap();
        server.begin_handshake().unwrap();

        let mut hello = vec![0u8; client.packet_buffer_size()];
        let n = client.wrap(&[], &mut hello).unwrap().produced;

        let mut tiny = [0u8; 16];
        let res = server.unwrap(&hello[..n], &mut tiny).unwrap();
        assert_eq!(res.status, Status::BufferOverflow);
        assert_eq!(res.consumed, 0);
    }

    #[test]
    fn test_unwrap_garbage_fails() {
        let (_client, mut server) = engine_pair(TlsEngineOptions {
            delegate_handshake: false,
        });
        server.begin_handshake().unwrap();

        let garbage = [0x16, 0x03, 0x01, 0x00, 0x04, 0xde, 0xad, 0xbe, 0xef];
        let mut plain = vec![0u8; 1024];
        assert!(server.unwrap(&garbage, &mut plain).is_err());
    }

    #[test]
    fn test_delegated_task_failure_surfaces_on_next_call() {
        let (_client, mut server) = engine_pair(TlsEngineOptions::default());
        server.begin_handshake().unwrap();

        let garbage = [0x16, 0x03, 0x01, 0x00, 0x04, 0xde, 0xad, 0xbe, 0xef];
        let mut plain = vec![0u8; 1024];
        let res = server.unwrap(&garbage, &mut plain).unwrap();
        assert_eq!(res.handshake_status, HandshakeStatus::NeedTask);

        let task = server.delegated_task().unwrap();
        assert!(server.delegated_task().is_none());
        task();

        let mut out = vec![0u8; 1024];
        assert!(server.wrap(&[], &mut out).is_err());
    }

    #[test]
    fn test_handshake_with_delegated_tasks() {
        let (mut client, mut server) = engine_pair(TlsEngineOptions::default());
        let tasks = complete_handshake(&mut client, &mut server);
        assert!(tasks > 0);
    }

    #[test]
    fn test_handshake_inline_and_application_data() {
        let (mut client, mut server) = engine_pair(TlsEngineOptions {
            delegate_handshake: false,
        });
        assert_eq!(complete_handshake(&mut client, &mut server), 0);

        let mut wire = vec![0u8; client.packet_buffer_size()];
        let res = client.wrap(b"hello", &mut wire).unwrap();
        assert_eq!(res.status, Status::Ok);
        assert_eq!(res.consumed, 5);

        let mut plain = vec![0u8; server.application_buffer_size()];
        let res = server.unwrap(&wire[..res.produced], &mut plain).unwrap();
        assert_eq!(res.status, Status::Ok);
        assert_eq!(&plain[..res.produced], b"hello");
    }

    #[test]
    fn test_close_outbound_emits_close_notify() {
        let (mut client, mut server) = engine_pair(TlsEngineOptions::default());
        complete_handshake(&mut client, &mut server);

        client.close_outbound();
        assert!(!client.is_outbound_done());

        let mut wire = vec![0u8; client.packet_buffer_size()];
        let res = client.wrap(&[], &mut wire).unwrap();
        assert!(res.produced > 0);
        assert!(client.is_outbound_done());

        // the alert closes the server's inbound side
        let mut plain = vec![0u8; server.application_buffer_size()];
        let mut offset = 0;
        let mut last = Status::Ok;
        while offset < res.produced {
            let r = server.unwrap(&wire[offset..res.produced], &mut plain).unwrap();
            offset += r.consumed;
            last = r.status;
            if r.consumed == 0 {
                break;
            }
        }
        assert_eq!(last, Status::Closed);
        assert!(server.is_inbound_done());
    }
}
