//! Bounded multi-level priority queue with deterministic overflow eviction.
//!
//! One FIFO per [`MessagePriority`] level. [`BoundedPriorityQueue::dequeue`]
//! pops the head of the most urgent non-empty level, so order is strict across
//! levels and stable within a level.
//!
//! Overflow policy: enqueuing into a full queue never fails. Exactly one entry
//! is evicted first, the oldest entry of the least urgent non-empty level, and
//! then the new entry is inserted at its own level. This holds even when the
//! incoming entry is itself `Low`: a new low-priority entry displaces the
//! oldest low-priority entry instead of being rejected.
//!
//! The queue is a plain data structure; owners wrap it in whatever lock or
//! actor suits them (the router uses a `tokio::sync::Mutex`, the outbound
//! writer owns one inside its task).

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Instant;

use crate::errors::QueueError;
use crate::message::MessagePriority;

const LEVELS: usize = 4;

/// A queued payload plus gateway routing hints.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry<T> {
    pub payload: T,
    pub priority: MessagePriority,
    pub enqueue_time: Instant,
    /// Gateway routing key (target interface for outbound traffic).
    pub topic: Option<String>,
    /// Gateway delivery hint (hop limit for outbound traffic).
    pub qos: u8,
}

impl<T> QueueEntry<T> {
    pub fn new(payload: T, priority: MessagePriority) -> Self {
        Self {
            payload,
            priority,
            enqueue_time: Instant::now(),
            topic: None,
            qos: 0,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }
}

/// Counters exposed by [`BoundedPriorityQueue::statistics`].
///
/// `enqueued`, `dequeued`, `dropped`, and `cleared` only ever grow. Between
/// them they account for every entry: `enqueued - dequeued - dropped - cleared == size`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    /// Overflow evictions.
    pub dropped: u64,
    /// Entries discarded by [`BoundedPriorityQueue::clear`].
    pub cleared: u64,
    pub size: usize,
    pub max_size: usize,
    pub emergency: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl QueueStats {
    /// Live count for one priority level.
    pub fn level(&self, priority: MessagePriority) -> usize {
        match priority {
            MessagePriority::Emergency => self.emergency,
            MessagePriority::High => self.high,
            MessagePriority::Normal => self.normal,
            MessagePriority::Low => self.low,
        }
    }
}

#[derive(Debug)]
pub struct BoundedPriorityQueue<T> {
    levels: [VecDeque<QueueEntry<T>>; LEVELS],
    max_size: usize,
    size: usize,
    enqueued: u64,
    dequeued: u64,
    dropped: u64,
    cleared: u64,
}

impl<T> BoundedPriorityQueue<T> {
    /// Create a queue holding at most `max_size` entries.
    pub fn new(max_size: usize) -> Result<Self, QueueError> {
        if max_size == 0 {
            return Err(QueueError::InvalidCapacity(max_size));
        }
        Ok(Self {
            levels: Default::default(),
            max_size,
            size: 0,
            enqueued: 0,
            dequeued: 0,
            dropped: 0,
            cleared: 0,
        })
    }

    /// Admit `entry` at `priority`, evicting one entry first if the queue is full.
    ///
    /// Always returns `true`: a full queue makes room instead of refusing.
    pub fn enqueue(&mut self, entry: QueueEntry<T>, priority: MessagePriority) -> bool {
        let _ = self.enqueue_evicting(entry, priority);
        true
    }

    /// Like [`enqueue`](Self::enqueue) but hands back the evicted entry, if any.
    pub fn enqueue_evicting(
        &mut self,
        mut entry: QueueEntry<T>,
        priority: MessagePriority,
    ) -> Option<QueueEntry<T>> {
        let evicted = if self.is_full() { self.evict_one() } else { None };
        entry.priority = priority;
        self.levels[priority.index()].push_back(entry);
        self.size += 1;
        self.enqueued += 1;
        evicted
    }

    /// Convenience wrapper that builds the entry from a bare payload.
    pub fn push(&mut self, payload: T, priority: MessagePriority) -> bool {
        self.enqueue(QueueEntry::new(payload, priority), priority)
    }

    /// Pop the oldest entry of the most urgent non-empty level.
    pub fn dequeue(&mut self) -> Option<QueueEntry<T>> {
        for priority in MessagePriority::DESCENDING {
            if let Some(entry) = self.levels[priority.index()].pop_front() {
                self.size -= 1;
                self.dequeued += 1;
                return Some(entry);
            }
        }
        None
    }

    /// Priority of the entry the next `dequeue` would return.
    pub fn peek_priority(&self) -> Option<MessagePriority> {
        MessagePriority::DESCENDING
            .into_iter()
            .find(|p| !self.levels[p.index()].is_empty())
    }

    fn evict_one(&mut self) -> Option<QueueEntry<T>> {
        // Least urgent level first (index 0 = Low).
        for level in self.levels.iter_mut() {
            if let Some(victim) = level.pop_front() {
                self.size -= 1;
                self.dropped += 1;
                return Some(victim);
            }
        }
        None
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_full(&self) -> bool {
        self.size >= self.max_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Discard every queued entry. Cumulative counters are kept.
    pub fn clear(&mut self) {
        for level in self.levels.iter_mut() {
            level.clear();
        }
        self.cleared += self.size as u64;
        self.size = 0;
    }

    pub fn statistics(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued,
            dequeued: self.dequeued,
            dropped: self.dropped,
            cleared: self.cleared,
            size: self.size,
            max_size: self.max_size,
            emergency: self.levels[MessagePriority::Emergency.index()].len(),
            high: self.levels[MessagePriority::High.index()].len(),
            normal: self.levels[MessagePriority::Normal.index()].len(),
            low: self.levels[MessagePriority::Low.index()].len(),
        }
    }
}
