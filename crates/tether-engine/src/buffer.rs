use std::collections::VecDeque;

use tether_common::protocol::{BufferedItem, OutboundEntry};
use tokio::sync::broadcast;
use tracing::trace;

use crate::registry::unix_millis;

/// Result of reading the buffer after a sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferRead {
    pub items: Vec<BufferedItem>,
    pub next: u64,
    pub oldest: Option<u64>,
    pub gap: bool,
}

/// Bounded per-session outbound buffer.
///
/// Every entry gets the next sequence number and the oldest entry is evicted
/// when full. Pollers that fall behind see a jump in sequence numbers and
/// `gap = true`. Push subscribers are fed from the same append.
#[derive(Debug)]
pub struct OutboundBuffer {
    capacity: usize,
    items: VecDeque<BufferedItem>,
    next_seq: u64,
    evicted: u64,
    live: broadcast::Sender<BufferedItem>,
}

impl OutboundBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (live, _) = broadcast::channel(capacity);
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
            next_seq: 1,
            evicted: 0,
            live,
        }
    }

    /// Append an entry and return its sequence number.
    pub fn push(&mut self, entry: OutboundEntry) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        if self.items.len() == self.capacity
            && let Some(old) = self.items.pop_front()
        {
            self.evicted += 1;
            trace!(seq = old.seq, "Evicted buffered entry");
        }

        let item = BufferedItem {
            seq,
            at: unix_millis(),
            entry,
        };
        // No subscribers is fine; the entry is still buffered for polling.
        let _ = self.live.send(item.clone());
        self.items.push_back(item);
        seq
    }

    /// Entries with a sequence number strictly greater than `since`, at most
    /// `limit` of them.
    pub fn read_since(&self, since: u64, limit: usize) -> BufferRead {
        let oldest = self.items.front().map(|i| i.seq);
        let items: Vec<BufferedItem> = self
            .items
            .iter()
            .filter(|i| i.seq > since)
            .take(limit)
            .cloned()
            .collect();
        let next = items.last().map(|i| i.seq).unwrap_or(since);
        BufferRead {
            gap: oldest.is_some_and(|o| o > since.saturating_add(1)),
            items,
            next,
            oldest,
        }
    }

    /// Backlog after `since` plus a receiver for everything appended later.
    /// Taken together under `&self`, so nothing falls between the two.
    pub fn subscribe(&self, since: u64) -> (Vec<BufferedItem>, broadcast::Receiver<BufferedItem>) {
        let backlog = self
            .items
            .iter()
            .filter(|i| i.seq > since)
            .cloned()
            .collect();
        (backlog, self.live.subscribe())
    }

    /// Sequence number of the newest entry, or 0 when nothing was ever pushed.
    pub fn latest_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
