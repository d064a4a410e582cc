//! Fixed-capacity ring buffer for recent log entries.

use std::sync::{Mutex, MutexGuard, PoisonError};

use super::model::{LogEntry, LogFilter};

/// Default number of log entries retained.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

struct Slots<T> {
    items: Vec<Option<T>>,
    head: usize,
    len: usize,
}

/// Bounded circular store. Adding past capacity overwrites the oldest entry.
pub struct RingBuffer<T> {
    slots: Mutex<Slots<T>>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    /// Create a buffer holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Mutex::new(Slots {
                items: vec![None; capacity],
                head: 0,
                len: 0,
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an entry, overwriting the oldest when full.
    pub fn add(&self, item: T) {
        let mut slots = self.lock();
        let head = slots.head;
        slots.items[head] = Some(item);
        slots.head = (head + 1) % self.capacity;
        if slots.len < self.capacity {
            slots.len += 1;
        }
    }

    /// Every retained entry, oldest first.
    pub fn all(&self) -> Vec<T> {
        let slots = self.lock();
        let start = (slots.head + self.capacity - slots.len) % self.capacity;
        (0..slots.len)
            .filter_map(|i| slots.items[(start + i) % self.capacity].clone())
            .collect()
    }

    /// Up to `n` entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<T> {
        let slots = self.lock();
        let n = n.min(slots.len);
        (0..n)
            .filter_map(|i| {
                let idx = (slots.head + self.capacity - 1 - i) % self.capacity;
                slots.items[idx].clone()
            })
            .collect()
    }
}

impl RingBuffer<LogEntry> {
    /// Entries matching `filter`, oldest first, keeping only the most recent
    /// `filter.limit` matches when set.
    pub fn filter(&self, filter: &LogFilter) -> Vec<LogEntry> {
        let mut matched: Vec<LogEntry> = self
            .all()
            .into_iter()
            .filter(|entry| filter.matches(entry))
            .collect();

        if let Some(limit) = filter.limit.filter(|l| *l > 0) {
            if matched.len() > limit {
                matched.drain(..matched.len() - limit);
            }
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::model::LogLevel;

    #[test]
    fn len_is_capped_at_capacity() {
        let ring = RingBuffer::new(3);
        assert!(ring.is_empty());
        for i in 0..5 {
            ring.add(i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.all(), vec![2, 3, 4]);
    }

    #[test]
    fn recent_is_newest_first_after_wrap() {
        let ring = RingBuffer::new(3);
        for i in 1..=5 {
            ring.add(i);
        }
        assert_eq!(ring.recent(2), vec![5, 4]);
        assert_eq!(ring.recent(10), vec![5, 4, 3]);
    }

    #[test]
    fn all_before_wrap_is_insertion_order() {
        let ring = RingBuffer::new(4);
        ring.add("a");
        ring.add("b");
        assert_eq!(ring.all(), vec!["a", "b"]);
        assert_eq!(ring.recent(1), vec!["b"]);
    }

    #[test]
    fn filter_keeps_most_recent_matches() {
        let ring = RingBuffer::new(DEFAULT_LOG_CAPACITY);
        for i in 0..10 {
            let level = if i % 2 == 0 { LogLevel::Error } else { LogLevel::Info };
            ring.add(LogEntry::new(level, "worker", format!("line {i}")));
        }

        let filter = LogFilter {
            level: Some(LogLevel::Error),
            limit: Some(2),
            ..Default::default()
        };
        let messages: Vec<String> = ring.filter(&filter).into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["line 6", "line 8"]);
    }
}
