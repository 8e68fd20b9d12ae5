//! Readiness reactor.
//!
//! One thread owns the listener and every session. Each iteration it:
//!
//! 1. waits for readiness (the configured timeout, or zero while output is
//!    waiting on a writable connection);
//! 2. accepts new streams and advances pending handshakes;
//! 3. decodes readable connections and dispatches payloads to the workers;
//! 4. applies worker completions;
//! 5. writes at most one queued response per writable connection;
//! 6. closes half-closed connections whose work has drained;
//! 7. drops handshakes and writes that have been stuck past their deadline.
//!
//! Events are edge-triggered, so readable connections are read until the
//! session reports no more data, and writability is remembered per
//! connection. A handshake in progress is polled under its own token range
//! and joins the registry only once it finishes.

use crate::dispatch::{Completion, ReadTask};
use crate::engine::{TlsEngine, TlsEngineOptions};
use crate::error::{HandshakeError, RecordError, SessionError};
use crate::processor::ConnectionContext;
use crate::registry::{OutboundQueue, PeerQueues};
use crate::session::{
    HandshakeProgress, ReadOutcome, SecureSession, SessionOptions, WriteProgress,
};
use crate::stats::ServerStats;
use crate::types::ConnId;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use rustls::ServerConfig;
use slab::Slab;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// First token of the range used by handshakes in progress.
const HANDSHAKE_TOKEN_BASE: usize = 1 << 29;

/// Token offset for the listener to avoid collision with connections.
const LISTENER_TOKEN: Token = Token(1 << 30);

/// Token for wakeups posted by dispatch workers.
const WAKER_TOKEN: Token = Token((1 << 30) + 1);

const LISTEN_BACKLOG: i32 = 1024;

type ServerSession = SecureSession<TlsEngine, TcpStream>;

/// Bind a non-blocking listener.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener))
}

/// Reactor tuning.
#[derive(Clone)]
pub struct ReactorConfig {
    /// Readiness wait timeout
    pub selector_timeout: Duration,
    /// Unfinished handshakes are dropped after this long
    pub handshake_timeout: Duration,
    /// A blocked write may wait this long for the socket to drain
    pub write_timeout: Duration,
    /// Keep at most one payload per connection in flight
    pub ordered_dispatch: bool,
    /// Held-back payloads per connection before reading pauses
    pub backlog_capacity: usize,
    pub engine: TlsEngineOptions,
    pub session: SessionOptions,
}

/// Channels between the reactor and the dispatch pool.
pub struct ReactorChannels {
    pub read_tx: Sender<ReadTask>,
    pub completions: Receiver<Completion>,
}

/// A stream whose handshake has not finished yet.
struct PendingHandshake {
    session: ServerSession,
    context: ConnectionContext,
    deadline: Instant,
}

/// State of one established connection.
struct Connection {
    session: ServerSession,
    generation: u32,
    peer: String,
    context: ConnectionContext,
    outbound: OutboundQueue,
    writable: bool,
    /// When a write last blocked with no writable event since
    write_blocked_since: Option<Instant>,
    /// Payloads handed to workers and not yet acknowledged
    in_flight: usize,
    /// Payloads held back while an earlier one is in flight
    backlog: VecDeque<Bytes>,
    /// Reading stops while the backlog is full
    read_paused: bool,
    /// The peer reached end of stream
    read_closed: bool,
}

impl Connection {
    fn id(&self, slot: usize) -> ConnId {
        ConnId::with_generation(slot, self.generation)
    }

    fn has_output(&self) -> bool {
        !self.outbound.is_empty() || self.session.has_pending_output()
    }

    fn is_drained(&self) -> bool {
        self.in_flight == 0 && self.backlog.is_empty() && !self.has_output()
    }
}

/// Single-threaded readiness loop over the listener and all sessions.
pub struct Reactor {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,
    handshakes: Slab<PendingHandshake>,
    connections: Slab<Connection>,
    /// Registry key to the connection that owns it
    peers: HashMap<String, ConnId>,
    next_generation: u32,
    tls: Arc<ServerConfig>,
    config: ReactorConfig,
    queues: Arc<PeerQueues>,
    stats: Arc<ServerStats>,
    read_tx: Option<Sender<ReadTask>>,
    completions: Receiver<Completion>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
}

impl Reactor {
    pub fn new(
        mut listener: TcpListener,
        tls: Arc<ServerConfig>,
        config: ReactorConfig,
        channels: ReactorChannels,
        queues: Arc<PeerQueues>,
        stats: Arc<ServerStats>,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let local_addr = listener.local_addr()?;

        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            listener,
            local_addr,
            handshakes: Slab::with_capacity(64),
            connections: Slab::with_capacity(1024),
            peers: HashMap::new(),
            next_generation: 0,
            tls,
            config,
            queues,
            stats,
            read_tx: Some(channels.read_tx),
            completions: channels.completions,
            waker,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waker that interrupts the readiness wait.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Established connections; handshakes in progress are not counted.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run until the shutdown flag is set, then close every connection.
    pub fn run(&mut self) -> io::Result<()> {
        tracing::info!(addr = %self.local_addr, "reactor started");

        while !self.shutdown.load(Ordering::SeqCst) {
            self.run_once()?;
        }

        self.close_all();
        tracing::info!("reactor stopped");
        Ok(())
    }

    /// One wait-and-handle cycle.
    pub fn run_once(&mut self) -> io::Result<()> {
        let timeout = if self.has_pending_writes() {
            Duration::ZERO
        } else {
            self.config.selector_timeout
        };

        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }

        // collect event info first to avoid borrow issues
        let events: Vec<_> = self
            .events
            .iter()
            .map(|e| {
                (
                    e.token(),
                    e.is_readable() || e.is_read_closed() || e.is_error(),
                    e.is_writable(),
                )
            })
            .collect();

        for (token, readable, writable) in events {
            match token {
                LISTENER_TOKEN => self.accept_pending(),
                WAKER_TOKEN => {}
                Token(t) if t >= HANDSHAKE_TOKEN_BASE => {
                    self.advance_handshake(t - HANDSHAKE_TOKEN_BASE);
                }
                Token(slot) => {
                    if writable && let Some(conn) = self.connections.get_mut(slot) {
                        conn.writable = true;
                        conn.write_blocked_since = None;
                    }
                    if readable {
                        self.on_readable(slot);
                    }
                }
            }
        }

        self.apply_completions();
        self.flush_writes();
        self.close_drained();
        self.expire_stalled(Instant::now());
        Ok(())
    }

    fn has_pending_writes(&self) -> bool {
        self.connections
            .iter()
            .any(|(_, conn)| conn.writable && conn.has_output())
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.accept(stream, addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    /// Start the handshake of a new stream.
    fn accept(&mut self, mut stream: TcpStream, peer_addr: SocketAddr) {
        self.stats.inc_accepts();

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer_addr, "failed to set TCP_NODELAY: {e}");
        }
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!(peer = %peer_addr, "failed to read local address: {e}");
                return;
            }
        };

        let engine = match TlsEngine::server(Arc::clone(&self.tls), self.config.engine) {
            Ok(engine) => engine,
            Err(e) => {
                self.stats.inc_handshake_failures();
                tracing::warn!(peer = %peer_addr, "failed to create tls engine: {e}");
                return;
            }
        };

        let key = self.handshakes.vacant_key();
        if let Err(e) = self.poll.registry().register(
            &mut stream,
            Token(HANDSHAKE_TOKEN_BASE + key),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            tracing::warn!(peer = %peer_addr, "failed to register stream: {e}");
            return;
        }

        self.handshakes.insert(PendingHandshake {
            session: SecureSession::new(engine, stream, self.config.session.clone()),
            context: ConnectionContext {
                local_addr,
                peer_addr,
            },
            deadline: Instant::now() + self.config.handshake_timeout,
        });

        // the ClientHello may already be buffered
        self.advance_handshake(key);
    }

    /// Run the handshake of `key` as far as its stream allows.
    fn advance_handshake(&mut self, key: usize) {
        let Some(pending) = self.handshakes.get_mut(key) else {
            return;
        };

        match pending.session.handshake() {
            Ok(HandshakeProgress::Pending) => {}
            Ok(HandshakeProgress::Finished) => {
                let pending = self.handshakes.remove(key);
                self.establish(pending);
            }
            Ok(HandshakeProgress::Closed) => {
                tracing::debug!(
                    peer = %pending.context.peer_addr,
                    "peer closed before handshake finished"
                );
                self.abandon_handshake(key);
            }
            Err(e) => {
                tracing::info!(peer = %pending.context.peer_addr, "handshake failed: {e}");
                self.abandon_handshake(key);
            }
        }
    }

    fn abandon_handshake(&mut self, key: usize) {
        let Some(mut pending) = self.handshakes.try_remove(key) else {
            return;
        };
        self.stats.inc_handshake_failures();
        if let Err(e) = self.poll.registry().deregister(pending.session.stream_mut()) {
            tracing::debug!(peer = %pending.context.peer_addr, "failed to deregister: {e}");
        }
    }

    /// Register a connection whose handshake finished.
    fn establish(&mut self, pending: PendingHandshake) {
        let PendingHandshake {
            mut session,
            context,
            ..
        } = pending;
        let peer_addr = context.peer_addr;

        let slot = self.connections.vacant_key();
        if let Err(e) = self.poll.registry().reregister(
            session.stream_mut(),
            Token(slot),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            tracing::warn!(peer = %peer_addr, "failed to register connection: {e}");
            let _ = self.poll.registry().deregister(session.stream_mut());
            let _ = session.close();
            return;
        }

        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let id = ConnId::with_generation(slot, generation);

        let peer = peer_addr.to_string();
        let outbound = self.queues.register(&peer);
        self.peers.insert(peer.clone(), id);

        self.connections.insert(Connection {
            session,
            generation,
            peer,
            context,
            outbound,
            // a blocked write clears this until the next writable event
            writable: true,
            write_blocked_since: None,
            in_flight: 0,
            backlog: VecDeque::new(),
            read_paused: false,
            read_closed: false,
        });
        self.stats.connection_opened();
        tracing::debug!(peer = %peer_addr, conn = id.as_u64(), "connection established");

        // application data may have arrived with the last handshake flight
        self.on_readable(slot);
    }

    /// Decode everything readable on `slot` and dispatch it.
    fn on_readable(&mut self, slot: usize) {
        loop {
            let Some(conn) = self.connections.get_mut(slot) else {
                return;
            };
            if conn.read_closed || conn.read_paused {
                return;
            }

            match conn.session.read() {
                Ok(ReadOutcome::Data(payload)) => self.dispatch(slot, payload),
                Ok(ReadOutcome::NoData) => return,
                Ok(ReadOutcome::PeerClosed) => {
                    tracing::debug!(peer = %conn.peer, "peer reached end of stream");
                    conn.read_closed = true;
                    return;
                }
                Err(e) => {
                    self.close_on_error(slot, e);
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, slot: usize, payload: Bytes) {
        let Some(conn) = self.connections.get_mut(slot) else {
            return;
        };

        if self.config.ordered_dispatch && conn.in_flight > 0 {
            conn.backlog.push_back(payload);
            if conn.backlog.len() >= self.config.backlog_capacity {
                tracing::debug!(peer = %conn.peer, "backlog full, pausing reads");
                conn.read_paused = true;
            }
            return;
        }

        conn.in_flight += 1;
        let task = ReadTask {
            conn: conn.id(slot),
            peer: conn.peer.clone(),
            context: conn.context,
            payload,
        };
        self.submit(task);
    }

    fn submit(&mut self, task: ReadTask) {
        let Some(read_tx) = &self.read_tx else {
            return;
        };
        // blocks while the read queue is full
        if read_tx.send(task).is_err() {
            tracing::error!("dispatch pool is gone, dropping payload");
        }
    }

    fn apply_completions(&mut self) {
        let mut resumed = Vec::new();

        while let Ok(done) = self.completions.try_recv() {
            let slot = done.conn.slot();
            match self.connections.get_mut(slot) {
                Some(conn) if conn.generation == done.conn.generation() => {
                    conn.in_flight = conn.in_flight.saturating_sub(1);
                    let next = if conn.in_flight == 0 {
                        conn.backlog.pop_front()
                    } else {
                        None
                    };
                    if conn.read_paused && conn.backlog.len() < self.config.backlog_capacity {
                        conn.read_paused = false;
                        resumed.push(slot);
                    }
                    if let Some(payload) = next {
                        self.dispatch(slot, payload);
                    }
                }
                _ => {
                    // the worker may have recreated the queue of a closed
                    // connection
                    if !self.peers.contains_key(&done.peer) {
                        self.queues.remove(&done.peer);
                    }
                }
            }
        }

        // no new edge arrives for data that sat unread while paused
        for slot in resumed {
            self.on_readable(slot);
        }
    }

    /// Make write progress on every writable connection: finish a blocked
    /// response, or start at most one queued response.
    fn flush_writes(&mut self) {
        let now = Instant::now();
        let mut failed = Vec::new();

        for (slot, conn) in self.connections.iter_mut() {
            if !conn.writable {
                continue;
            }
            let progress = if conn.session.has_pending_output() {
                conn.session.flush()
            } else {
                let Some(response) = conn.outbound.pop() else {
                    continue;
                };
                conn.session.write(&response)
            };

            match progress {
                Ok(WriteProgress::Flushed) => {
                    conn.write_blocked_since = None;
                    self.stats.inc_responses_written();
                }
                Ok(WriteProgress::Pending) => {
                    conn.writable = false;
                    conn.write_blocked_since.get_or_insert(now);
                }
                Err(e) => failed.push((slot, e)),
            }
        }

        for (slot, e) in failed {
            self.close_on_error(slot, e);
        }
    }

    /// Close half-closed connections with nothing left to do.
    fn close_drained(&mut self) {
        let drained: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.read_closed && conn.is_drained())
            .map(|(slot, _)| slot)
            .collect();

        for slot in drained {
            self.close(slot);
        }
    }

    /// Drop handshakes and blocked writes that outlived their deadline.
    fn expire_stalled(&mut self, now: Instant) {
        let expired: Vec<usize> = self
            .handshakes
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(key, _)| key)
            .collect();
        for key in expired {
            if let Some(pending) = self.handshakes.get(key) {
                tracing::info!(
                    peer = %pending.context.peer_addr,
                    "handshake failed: {}",
                    HandshakeError::TimedOut
                );
            }
            self.abandon_handshake(key);
        }

        let write_timeout = self.config.write_timeout;
        let stalled: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, conn)| {
                conn.write_blocked_since
                    .is_some_and(|since| now.duration_since(since) >= write_timeout)
            })
            .map(|(slot, _)| slot)
            .collect();
        for slot in stalled {
            if let Some(conn) = self.connections.get(slot) {
                tracing::warn!(peer = %conn.peer, "response write timed out");
            }
            self.close(slot);
        }
    }

    fn close_on_error(&mut self, slot: usize, e: SessionError) {
        if let Some(conn) = self.connections.get(slot) {
            match &e {
                SessionError::Record(RecordError::Closed(_)) => {
                    tracing::debug!(peer = %conn.peer, "peer closed the session");
                }
                _ => tracing::warn!(peer = %conn.peer, "closing connection: {e}"),
            }
        }
        self.close(slot);
    }

    fn close(&mut self, slot: usize) {
        let Some(mut conn) = self.connections.try_remove(slot) else {
            return;
        };
        let id = conn.id(slot);

        if let Err(e) = self.poll.registry().deregister(conn.session.stream_mut()) {
            tracing::debug!(peer = %conn.peer, "failed to deregister: {e}");
        }
        if let Err(e) = conn.session.close() {
            tracing::debug!(peer = %conn.peer, "error during close: {e}");
        }

        if self.peers.get(&conn.peer) == Some(&id) {
            self.peers.remove(&conn.peer);
            self.queues.remove(&conn.peer);
        }

        self.stats.connection_closed();
        tracing::debug!(peer = %conn.peer, conn = id.as_u64(), "connection closed");
    }

    /// Close every session and release the dispatch pool.
    fn close_all(&mut self) {
        for mut pending in self.handshakes.drain() {
            let _ = self.poll.registry().deregister(pending.session.stream_mut());
        }

        let slots: Vec<usize> = self.connections.iter().map(|(slot, _)| slot).collect();
        for slot in slots {
            self.close(slot);
        }
        // workers exit once the queue drains
        self.read_tx.take();

        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            tracing::debug!("failed to deregister listener: {e}");
        }
    }
}
