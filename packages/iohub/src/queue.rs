// Bounded per-device native event queue
//
// One producer (the device's poller) and one drainer (the hub merge tick).
// When full, the oldest queued event is evicted to admit the new one.

use crate::event::NativeEvent;
use crossbeam::queue::ArrayQueue;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters for one device queue
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueMetrics {
    pub total_pushed: u64,
    pub total_drained: u64,
    pub total_dropped: u64,
    pub current_size: usize,
    pub peak_size: usize,
    pub capacity: usize,
}

pub struct EventQueue {
    queue: ArrayQueue<NativeEvent>,
    total_pushed: AtomicU64,
    total_drained: AtomicU64,
    total_dropped: AtomicU64,
    peak_size: AtomicUsize,
}

impl EventQueue {
    /// `capacity` must be non-zero; configuration validation enforces this.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            total_pushed: AtomicU64::new(0),
            total_drained: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
            peak_size: AtomicUsize::new(0),
        }
    }

    /// Append an event, evicting the oldest one when full.
    ///
    /// Returns the evicted event, if any.
    pub fn push(&self, event: NativeEvent) -> Option<NativeEvent> {
        let evicted = self.queue.force_push(event);
        if evicted.is_some() {
            self.total_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.total_pushed.fetch_add(1, Ordering::Relaxed);
        self.peak_size.fetch_max(self.queue.len(), Ordering::Relaxed);
        evicted
    }

    /// Take every queued event, oldest first.
    pub fn drain(&self) -> Vec<NativeEvent> {
        let mut events = Vec::with_capacity(self.queue.len());
        while let Some(event) = self.queue.pop() {
            events.push(event);
        }
        self.total_drained
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        events
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            total_drained: self.total_drained.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            current_size: self.queue.len(),
            peak_size: self.peak_size.load(Ordering::Relaxed),
            capacity: self.queue.capacity(),
        }
    }
}
