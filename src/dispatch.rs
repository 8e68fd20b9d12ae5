//! Read dispatch pool.
//!
//! Workers take decoded payloads off the global read queue, run them through
//! the active processor and push the response onto the peer's outbound
//! queue. Every task, successful or not, is acknowledged to the reactor with
//! a [`Completion`] so it can release the connection's dispatch slot.

use crate::processor::{ConnectionContext, ProcessorHandle};
use crate::registry::PeerQueues;
use crate::stats::ServerStats;
use crate::types::ConnId;
use crate::workers::{WorkerHandle, join_workers, spawn_workers};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// A decoded payload waiting for a worker.
#[derive(Debug, Clone)]
pub struct ReadTask {
    pub conn: ConnId,
    /// Registry key of the connection (`host:port`)
    pub peer: String,
    pub context: ConnectionContext,
    pub payload: Bytes,
}

/// Sent back to the reactor once a task has been handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub conn: ConnId,
    pub peer: String,
}

/// Per-worker state for handling read tasks.
#[derive(Clone)]
pub struct Dispatcher {
    processor: Arc<ProcessorHandle>,
    queues: Arc<PeerQueues>,
    stats: Arc<ServerStats>,
    completions: Sender<Completion>,
    waker: Option<Arc<mio::Waker>>,
}

impl Dispatcher {
    pub fn new(
        processor: Arc<ProcessorHandle>,
        queues: Arc<PeerQueues>,
        stats: Arc<ServerStats>,
        completions: Sender<Completion>,
    ) -> Self {
        Self {
            processor,
            queues,
            stats,
            completions,
            waker: None,
        }
    }

    /// Wake the reactor's poll after each completion.
    pub fn with_waker(mut self, waker: Arc<mio::Waker>) -> Self {
        self.waker = Some(waker);
        self
    }

    /// Process one task and acknowledge it.
    pub fn handle(&self, task: ReadTask) {
        let queue = self.queues.outbound(&task.peer);
        self.stats.inc_requests();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.processor.process(&task.payload, &task.context)
        }));

        match result {
            Ok(Ok(response)) => {
                if !response.is_empty() {
                    queue.push(response);
                }
            }
            Ok(Err(e)) => {
                self.stats.inc_processor_errors();
                tracing::warn!(peer = %task.peer, "processor failed: {e}");
            }
            Err(_) => {
                self.stats.inc_processor_errors();
                tracing::error!(peer = %task.peer, "processor panicked");
            }
        }

        let completion = Completion {
            conn: task.conn,
            peer: task.peer,
        };
        if self.completions.send(completion).is_err() {
            // reactor already gone
            return;
        }
        if let Some(waker) = &self.waker
            && let Err(e) = waker.wake()
        {
            tracing::debug!("failed to wake reactor: {e}");
        }
    }

    fn run(&self, tasks: Receiver<ReadTask>) {
        for task in tasks.iter() {
            self.handle(task);
        }
    }
}

/// Fixed-size pool of dispatch workers.
pub struct DispatchPool {
    workers: Vec<WorkerHandle<()>>,
}

impl DispatchPool {
    /// Start `threads` workers consuming `tasks`. Workers exit once every
    /// sender of `tasks` is dropped and the queue has drained.
    pub fn start(
        threads: usize,
        tasks: Receiver<ReadTask>,
        dispatcher: Dispatcher,
    ) -> io::Result<Self> {
        let workers = spawn_workers(threads.max(1), "dispatch", move |_| {
            dispatcher.run(tasks.clone());
        })?;
        Ok(Self { workers })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    pub fn join(self) {
        join_workers(self.workers);
    }
}
