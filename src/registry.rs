//! Per-peer outbound queues.
//!
//! Each connected peer, keyed by its `host:port`, owns one bounded queue of
//! pending responses. Workers push into it and the reactor pops from it when
//! the connection is writable. The table is shared between threads and its
//! create-if-absent path runs under a single lock, so concurrent first
//! lookups for a peer always resolve to the same queue.

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;

/// A bounded queue of pending responses for one peer.
#[derive(Clone)]
pub struct OutboundQueue {
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Push a response, blocking while the queue is full.
    pub fn push(&self, response: Bytes) {
        // both ends live in self, so the channel cannot be disconnected
        let _ = self.tx.send(response);
    }

    pub fn pop(&self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Table of outbound queues keyed by peer address.
pub struct PeerQueues {
    queues: Mutex<HashMap<String, OutboundQueue>>,
    capacity: usize,
}

impl PeerQueues {
    /// Create an empty table whose queues hold up to `capacity` responses.
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Queue for `peer`, creating it if absent.
    pub fn outbound(&self, peer: &str) -> OutboundQueue {
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get(peer) {
            return queue.clone();
        }

        let queue = OutboundQueue::new(self.capacity);
        queues.insert(peer.to_string(), queue.clone());
        queue
    }

    /// Install a fresh queue for a newly accepted peer, replacing any stale
    /// entry left under the same key.
    pub fn register(&self, peer: &str) -> OutboundQueue {
        let queue = OutboundQueue::new(self.capacity);
        self.queues.lock().insert(peer.to_string(), queue.clone());
        queue
    }

    pub fn get(&self, peer: &str) -> Option<OutboundQueue> {
        self.queues.lock().get(peer).cloned()
    }

    pub fn remove(&self, peer: &str) -> Option<OutboundQueue> {
        self.queues.lock().remove(peer)
    }

    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().is_empty()
    }
}
