//! Executor for delegated handshake tasks.
//!
//! Handshake record processing (key exchange and certificate verification)
//! can be handed to a small pool of worker threads instead of running on the
//! thread driving the session. The session submits a [`TaskBatch`] and waits
//! for every task in it to complete before polling the engine again.

use crate::engine::DelegatedTask;
use crate::workers::{WorkerHandle, join_workers, spawn_workers};
use crossbeam_channel::{Receiver, Sender};
use std::io;
use std::panic::{self, AssertUnwindSafe};

struct Job {
    task: DelegatedTask,
    done: Sender<()>,
}

/// Signals completion even if the task panics.
struct DoneGuard(Sender<()>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

/// Fixed-size pool running delegated tasks.
pub struct TaskExecutor {
    jobs: Option<Sender<Job>>,
    workers: Vec<WorkerHandle<()>>,
}

impl TaskExecutor {
    /// Start `threads` worker threads (at least one).
    pub fn new(threads: usize) -> io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let workers = spawn_workers(threads.max(1), "handshake-task", move |_| {
            run_jobs(rx.clone());
        })?;

        Ok(Self {
            jobs: Some(tx),
            workers,
        })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Submit tasks, returning a batch that can be waited on.
    pub fn submit(&self, tasks: Vec<DelegatedTask>) -> TaskBatch {
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let expected = tasks.len();

        for task in tasks {
            let job = Job {
                task,
                done: done_tx.clone(),
            };
            let Some(jobs) = &self.jobs else {
                run_job(job);
                continue;
            };
            if let Err(e) = jobs.send(job) {
                // pool is shutting down, run it here
                run_job(e.into_inner());
            }
        }

        TaskBatch {
            remaining: expected,
            done: done_rx,
        }
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        // workers exit once the job channel disconnects
        self.jobs.take();
        join_workers(std::mem::take(&mut self.workers));
    }
}

/// A set of submitted tasks.
pub struct TaskBatch {
    remaining: usize,
    done: Receiver<()>,
}

impl TaskBatch {
    /// Block until every task in the batch has completed.
    pub fn wait(mut self) {
        while self.remaining > 0 {
            if self.done.recv().is_err() {
                break;
            }
            self.remaining -= 1;
        }
    }

    /// Number of tasks not yet known to be complete.
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

/// Run tasks on the current thread.
pub fn run_inline(tasks: Vec<DelegatedTask>) {
    for task in tasks {
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::error!("delegated task panicked");
        }
    }
}

fn run_jobs(rx: Receiver<Job>) {
    for job in rx.iter() {
        run_job(job);
    }
}

fn run_job(job: Job) {
    let _guard = DoneGuard(job.done);
    if panic::catch_unwind(AssertUnwindSafe(job.task)).is_err() {
        tracing::error!("delegated task panicked");
    }
}
