//! Signal handling for graceful shutdown.
//!
//! SIGINT and SIGTERM set the shared stop flag. A second signal exits
//! immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Install signal handlers that set `shutdown`.
pub fn install_signal_handler(shutdown: Arc<AtomicBool>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        if shutdown.swap(true, Ordering::SeqCst) {
            tracing::warn!("received second signal, forcing immediate exit");
            std::process::exit(1);
        }
        tracing::info!("received shutdown signal, closing connections");
    })
}
