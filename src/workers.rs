//! Worker thread management.

use std::io;
use std::thread::{self, JoinHandle};

/// Handle to a spawned worker thread.
pub struct WorkerHandle<R> {
    pub handle: JoinHandle<R>,
    /// The worker ID (0-indexed)
    pub worker_id: usize,
}

/// Spawn `num_workers` named threads running `worker_fn(worker_id)`.
///
/// Threads are named `{name_prefix}-{worker_id}`.
pub fn spawn_workers<F, R>(
    num_workers: usize,
    name_prefix: &str,
    worker_fn: F,
) -> io::Result<Vec<WorkerHandle<R>>>
where
    F: Fn(usize) -> R + Send + Clone + 'static,
    R: Send + 'static,
{
    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let worker_fn = worker_fn.clone();
        let handle = thread::Builder::new()
            .name(format!("{name_prefix}-{worker_id}"))
            .spawn(move || worker_fn(worker_id))?;

        handles.push(WorkerHandle { handle, worker_id });
    }

    Ok(handles)
}

/// Wait for all worker threads, logging any that panicked.
pub fn join_workers<R>(handles: Vec<WorkerHandle<R>>) -> Vec<R> {
    handles
        .into_iter()
        .filter_map(|h| match h.handle.join() {
            Ok(r) => Some(r),
            Err(_) => {
                tracing::error!(worker_id = h.worker_id, "worker thread panicked");
                None
            }
        })
        .collect()
}
