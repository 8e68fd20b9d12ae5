//! Periodic refresh of the processor definition.
//!
//! The definition file is polled on a fixed interval and reloaded only when
//! its modification time changes. A failed reload is logged and the current
//! processor stays installed.

use crate::error::ReloadError;
use crate::processor::{ProcessorHandle, ProcessorLoader};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

/// Longest sleep between shutdown checks in the refresh thread.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Reloads a file-backed processor into a [`ProcessorHandle`].
pub struct ProcessorRefresher {
    path: PathBuf,
    loader: Arc<dyn ProcessorLoader>,
    handle: Arc<ProcessorHandle>,
    last_modified: SystemTime,
}

impl ProcessorRefresher {
    /// Load the definition at `path` and create a handle serving it.
    ///
    /// Unlike later refreshes, a failure here is returned to the caller.
    pub fn load(
        path: impl Into<PathBuf>,
        loader: Arc<dyn ProcessorLoader>,
    ) -> Result<Self, ReloadError> {
        let path = path.into();
        let modified = modified_time(&path)?;
        let processor = loader.load(&read_source(&path)?)?;

        Ok(Self {
            path,
            loader,
            handle: Arc::new(ProcessorHandle::from_boxed(processor)),
            last_modified: modified,
        })
    }

    pub fn handle(&self) -> Arc<ProcessorHandle> {
        Arc::clone(&self.handle)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reload if the file changed since the last attempt.
    ///
    /// Returns `Ok(true)` if a new processor was installed. The modification
    /// time is recorded even when loading fails, so a broken definition is
    /// not retried until it changes again.
    pub fn refresh(&mut self) -> Result<bool, ReloadError> {
        let modified = modified_time(&self.path)?;
        if self.last_modified == modified {
            return Ok(false);
        }
        self.last_modified = modified;

        let processor = self.loader.load(&read_source(&self.path)?)?;
        self.handle.replace(processor);
        Ok(true)
    }

    /// Poll every `interval` on a background thread until `shutdown` is set.
    pub fn spawn(
        mut self,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("processor-refresh".to_string())
            .spawn(move || {
                tracing::debug!(path = %self.path.display(), "processor refresh started");
                while sleep_unless_shutdown(interval, &shutdown) {
                    match self.refresh() {
                        Ok(true) => {
                            tracing::info!(path = %self.path.display(), "processor reloaded");
                        }
                        Ok(false) => {}
                        Err(e) => {
                            tracing::warn!(
                                path = %self.path.display(),
                                "processor reload failed, keeping previous: {e}"
                            );
                        }
                    }
                }
                tracing::debug!("processor refresh stopped");
            })
    }
}

/// Sleep for `duration` in short slices. Returns false if shutdown was
/// requested.
fn sleep_unless_shutdown(duration: Duration, shutdown: &AtomicBool) -> bool {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let slice = remaining.min(SLEEP_SLICE);
        std::thread::sleep(slice);
        remaining -= slice;
    }
    !shutdown.load(Ordering::SeqCst)
}

fn modified_time(path: &Path) -> Result<SystemTime, ReloadError> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.modified()?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(ReloadError::Missing(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

fn read_source(path: &Path) -> Result<String, ReloadError> {
    match fs::read_to_string(path) {
        Ok(source) => Ok(source),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(ReloadError::Missing(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}
