//! Request processing interface.
//!
//! A [`RequestProcessor`] turns one decoded payload into one response. The
//! active processor lives behind a [`ProcessorHandle`] so it can be replaced
//! at runtime without pausing the workers: a swap only becomes visible to
//! requests that start after it.

use crate::error::ProcessorError;
use arc_swap::ArcSwap;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

/// Addresses of the connection a payload arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionContext {
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

/// Application logic invoked for each decoded payload.
pub trait RequestProcessor: Send + Sync {
    fn process(&self, payload: &[u8], ctx: &ConnectionContext) -> Result<Bytes, ProcessorError>;
}

impl<F> RequestProcessor for F
where
    F: Fn(&[u8], &ConnectionContext) -> Result<Bytes, ProcessorError> + Send + Sync,
{
    fn process(&self, payload: &[u8], ctx: &ConnectionContext) -> Result<Bytes, ProcessorError> {
        self(payload, ctx)
    }
}

/// Builds a processor from its textual definition.
pub trait ProcessorLoader: Send + Sync {
    fn load(&self, source: &str) -> Result<Box<dyn RequestProcessor>, ProcessorError>;
}

/// Hot-swappable reference to the active processor.
pub struct ProcessorHandle {
    current: ArcSwap<Box<dyn RequestProcessor>>,
}

impl ProcessorHandle {
    pub fn new(processor: impl RequestProcessor + 'static) -> Self {
        Self::from_boxed(Box::new(processor))
    }

    pub fn from_boxed(processor: Box<dyn RequestProcessor>) -> Self {
        Self {
            current: ArcSwap::from_pointee(processor),
        }
    }

    /// Install a new processor. In-flight requests finish on the old one.
    pub fn replace(&self, processor: Box<dyn RequestProcessor>) {
        self.current.store(Arc::new(processor));
    }

    /// Run `payload` through the active processor.
    pub fn process(&self, payload: &[u8], ctx: &ConnectionContext) -> Result<Bytes, ProcessorError> {
        self.current.load().process(payload, ctx)
    }
}
