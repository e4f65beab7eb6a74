//! Bounded history of gossip messages sent and received
//!
//! Diagnostics only: nothing in the merge protocol reads it.

use gossipkv_core::ValueDescriptor;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// Which way a message travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

/// One logged message
#[derive(Debug, Clone)]
pub struct Message {
    /// Sequential identifier, shared by both directions
    pub id: u64,
    pub direction: Direction,
    pub key: String,
    pub descriptor: ValueDescriptor,
    /// Unix millis
    pub timestamp: u64,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    sent: VecDeque<Message>,
    received: VecDeque<Message>,
}

/// FIFO-bounded message log
pub struct MessageLog {
    /// Entries kept per direction
    capacity: usize,
    inner: Mutex<Inner>,
}

impl MessageLog {
    /// Create a log keeping at most `capacity` messages per direction
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Append a message, evicting the oldest of the same direction when full.
    /// Returns the assigned id, or `None` if history is disabled.
    pub fn record(&self, direction: Direction, key: &str, descriptor: &ValueDescriptor) -> Option<u64> {
        if self.capacity == 0 {
            return None;
        }

        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let message = Message {
            id: inner.next_id,
            direction,
            key: key.to_string(),
            descriptor: descriptor.clone(),
            timestamp: now_millis(),
        };

        let queue = match direction {
            Direction::Sent => &mut inner.sent,
            Direction::Received => &mut inner.received,
        };
        queue.push_back(message);
        while queue.len() > self.capacity {
            queue.pop_front();
        }
        Some(inner.next_id)
    }

    /// Copies of the retained (sent, received) messages, oldest first
    pub fn list(&self) -> (Vec<Message>, Vec<Message>) {
        let inner = self.inner.lock();
        (
            inner.sent.iter().cloned().collect(),
            inner.received.iter().cloned().collect(),
        )
    }

    /// Look up a retained message by id
    pub fn get(&self, id: u64) -> Option<Message> {
        let inner = self.inner.lock();
        inner
            .sent
            .iter()
            .chain(inner.received.iter())
            .find(|m| m.id == id)
            .cloned()
    }

    /// Drop all retained messages. Ids keep increasing afterwards.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.sent.clear();
        inner.received.clear();
    }

    /// Total retained messages
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.sent.len() + inner.received.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
