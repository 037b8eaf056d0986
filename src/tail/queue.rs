//! Bounded queue of extracted agent messages.
//!
//! The tailer must never block on a slow reader, so a full queue drops its
//! oldest entry to make room.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

/// Messages kept per tail session.
pub const OUTPUT_QUEUE_CAPACITY: usize = 8;

/// Single-consumer, drop-oldest message queue.
#[derive(Debug)]
pub struct OutputQueue {
    entries: Mutex<VecDeque<String>>,
    ready: Notify,
    capacity: usize,
}

impl Default for OutputQueue {
    fn default() -> Self {
        Self::new(OUTPUT_QUEUE_CAPACITY)
    }
}

impl OutputQueue {
    /// Queue holding at most `capacity` messages (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Notify::new(),
            capacity,
        }
    }

    /// Append `message`, discarding the oldest entry if full.
    ///
    /// Returns the dropped entry, if any.
    pub async fn push(&self, message: String) -> Option<String> {
        let dropped = {
            let mut entries = self.entries.lock().await;
            let dropped = if entries.len() >= self.capacity {
                entries.pop_front()
            } else {
                None
            };
            entries.push_back(message);
            dropped
        };
        self.ready.notify_one();
        dropped
    }

    /// Wait for and remove the oldest message.
    pub async fn recv(&self) -> String {
        loop {
            if let Some(message) = self.entries.lock().await.pop_front() {
                return message;
            }
            self.ready.notified().await;
        }
    }

    /// Remove and return everything queued.
    pub async fn drain(&self) -> Vec<String> {
        self.entries.lock().await.drain(..).collect()
    }

    /// Number of queued messages.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether nothing is queued.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
