use crate::message::CanonicalMessage;
use std::collections::VecDeque;

/// How many messages the rolling view retains.
pub const MESSAGE_BUFFER_CAPACITY: usize = 50;

/// Bounded, arrival-ordered store of canonical messages. Oldest entry
/// is evicted first once the capacity is reached.
#[derive(Debug)]
pub struct MessageBuffer {
    capacity: usize,
    entries: VecDeque<CanonicalMessage>,
}

impl MessageBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, message: CanonicalMessage) {
        self.entries.push_back(message);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Full ordered contents, oldest first.
    pub fn snapshot(&self) -> Vec<CanonicalMessage> {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new(MESSAGE_BUFFER_CAPACITY)
    }
}

/// Next offset to request from the upstream long-poll feed. Advances
/// monotonically; only an explicit reset (active-token switch) rewinds
/// it to the initial value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateCursor {
    next: i64,
}

impl UpdateCursor {
    pub const INITIAL: i64 = 0;

    pub fn new() -> Self {
        Self {
            next: Self::INITIAL,
        }
    }

    pub fn next_offset(&self) -> i64 {
        self.next
    }

    /// Defensive re-check against stale or replayed updates.
    pub fn accepts(&self, update_id: i64) -> bool {
        update_id >= self.next
    }

    pub fn advance_past(&mut self, update_id: i64) {
        self.next = self.next.max(update_id + 1);
    }

    pub fn reset(&mut self) {
        self.next = Self::INITIAL;
    }
}

impl Default for UpdateCursor {
    fn default() -> Self {
        Self::new()
    }
}
