//! Server assembly.
//!
//! Binds the listener up front so the address is known before [`Server::run`]
//! starts the thread pools and hands the calling thread to the reactor.

use crate::config::Config;
use crate::credentials::{self, CredentialProvider, PemFileCredentials};
use crate::dispatch::{DispatchPool, Dispatcher};
use crate::engine::TlsEngineOptions;
use crate::error::ServerError;
use crate::processor::ProcessorHandle;
use crate::reactor::{Reactor, ReactorChannels, ReactorConfig, bind_listener};
use crate::registry::PeerQueues;
use crate::reload::ProcessorRefresher;
use crate::session::SessionOptions;
use crate::stats::ServerStats;
use crate::tasks::TaskExecutor;
use crate::template::TemplateLoader;
use mio::net::TcpListener;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Server {
    config: Config,
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: Arc<rustls::ServerConfig>,
    processor: Arc<ProcessorHandle>,
    refresher: Option<ProcessorRefresher>,
    queues: Arc<PeerQueues>,
    stats: Arc<ServerStats>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Bind the configured address.
    pub fn bind(
        config: Config,
        tls: Arc<rustls::ServerConfig>,
        processor: Arc<ProcessorHandle>,
    ) -> Result<Self, ServerError> {
        let addr = config.listen_addr()?;
        let listener = bind_listener(addr)?;
        let local_addr = listener.local_addr()?;
        let queues = Arc::new(PeerQueues::new(config.server.write_queue_capacity));

        Ok(Self {
            config,
            listener,
            local_addr,
            tls,
            processor,
            refresher: None,
            queues,
            stats: Arc::new(ServerStats::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Load credentials and the processor definition named by `config`,
    /// then bind. Any failure here is fatal.
    pub fn from_config(config: Config) -> Result<Self, ServerError> {
        let credentials = PemFileCredentials::from_config(&config.tls).credentials()?;
        let tls = credentials::server_config(credentials)?;
        let refresher =
            ProcessorRefresher::load(&config.processor.path, Arc::new(TemplateLoader))?;
        tracing::info!(path = %refresher.path().display(), "processor loaded");

        let server = Self::bind(config, tls, refresher.handle())?;
        Ok(server.with_refresher(refresher))
    }

    /// Poll the processor definition for changes while running.
    pub fn with_refresher(mut self, refresher: ProcessorRefresher) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Flag that stops [`run()`](Self::run) when set.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Serve until the shutdown flag is set.
    pub fn run(self) -> Result<(), ServerError> {
        let config = &self.config;

        let executor = if config.tls.delegate_handshake {
            Some(Arc::new(TaskExecutor::new(config.workers.task_threads)?))
        } else {
            None
        };

        let reactor_config = ReactorConfig {
            selector_timeout: config.selector_timeout(),
            handshake_timeout: config.handshake_timeout(),
            write_timeout: config.io_timeout(),
            ordered_dispatch: config.server.ordered_dispatch,
            backlog_capacity: config.server.backlog_capacity,
            engine: TlsEngineOptions {
                delegate_handshake: config.tls.delegate_handshake,
            },
            session: SessionOptions {
                executor,
                ..SessionOptions::default()
            },
        };

        let (read_tx, read_rx) = crossbeam_channel::bounded(config.server.read_queue_capacity);
        let (done_tx, done_rx) = crossbeam_channel::unbounded();

        let mut reactor = Reactor::new(
            self.listener,
            self.tls,
            reactor_config,
            ReactorChannels {
                read_tx,
                completions: done_rx,
            },
            Arc::clone(&self.queues),
            Arc::clone(&self.stats),
            Arc::clone(&self.shutdown),
        )?;

        let dispatcher = Dispatcher::new(
            self.processor,
            Arc::clone(&self.queues),
            Arc::clone(&self.stats),
            done_tx,
        )
        .with_waker(reactor.waker());
        let pool = DispatchPool::start(config.threads(), read_rx, dispatcher)?;

        let refresher = match self.refresher {
            Some(refresher) => Some(
                refresher.spawn(config.refresh_interval(), Arc::clone(&self.shutdown))?,
            ),
            None => None,
        };

        tracing::info!(
            addr = %self.local_addr,
            dispatch_threads = pool.threads(),
            ordered_dispatch = config.server.ordered_dispatch,
            delegate_handshake = config.tls.delegate_handshake,
            "server started"
        );

        let result = reactor.run();

        // stop the refresher too if the reactor failed
        self.shutdown.store(true, Ordering::SeqCst);
        drop(reactor);
        pool.join();
        if let Some(handle) = refresher
            && handle.join().is_err()
        {
            tracing::error!("processor refresh thread panicked");
        }

        let snapshot = self.stats.snapshot();
        tracing::info!(
            accepts = snapshot.accepts,
            handshake_failures = snapshot.handshake_failures,
            requests = snapshot.requests,
            responses = snapshot.responses_written,
            "server stopped"
        );

        result.map_err(ServerError::from)
    }
}
