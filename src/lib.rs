//! shroud: a non-blocking TLS request server.
//!
//! A single [`reactor`] thread accepts TCP connections, drives each one
//! through a TLS handshake and decodes application records. Decoded payloads
//! go to a pool of [`dispatch`] workers, which run them through a
//! hot-reloadable [`processor`] and queue the responses per peer. The
//! reactor writes queued responses back as the sockets become writable.
//!
//! The TLS state machine sits behind the [`engine::SecureEngine`] trait, a
//! wrap/unwrap interface over ciphertext and plaintext buffers. The
//! [`session::SecureSession`] layers buffer management and the handshake
//! loop on top of an engine and a non-blocking stream.

pub mod buffer;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod logging;
pub mod processor;
pub mod reactor;
pub mod registry;
pub mod reload;
pub mod server;
pub mod session;
pub mod signal;
pub mod stats;
pub mod tasks;
pub mod template;
pub mod types;
pub mod workers;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{ServerError, SessionError};
pub use processor::{ConnectionContext, ProcessorHandle, RequestProcessor};
pub use server::Server;
pub use session::{HandshakeProgress, ReadOutcome, SecureSession, WriteProgress};
pub use template::TemplateProcessor;
