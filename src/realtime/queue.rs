//! Outbound envelopes buffered while no usable connection exists.

use std::collections::VecDeque;

use tracing::warn;

use crate::realtime::proto::Envelope;

/// What to discard when a bounded pending queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the head of the queue to make room for the new envelope.
    #[default]
    DropOldest,
    /// Discard the envelope being queued.
    DropNewest,
}

/// FIFO queue of envelopes waiting for the next successful open.
#[derive(Debug)]
pub(crate) struct PendingQueue {
    items: VecDeque<Envelope>,
    capacity: Option<usize>,
    overflow: OverflowPolicy,
}

impl PendingQueue {
    pub(crate) fn new(capacity: Option<usize>, overflow: OverflowPolicy) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
            overflow,
        }
    }

    /// Appends to the tail. Returns the envelope dropped to honor the
    /// capacity, if any.
    pub(crate) fn push(&mut self, envelope: Envelope) -> Option<Envelope> {
        let full = self
            .capacity
            .is_some_and(|capacity| self.items.len() >= capacity);
        if !full {
            self.items.push_back(envelope);
            return None;
        }

        let dropped = match self.overflow {
            OverflowPolicy::DropOldest => {
                let oldest = self.items.pop_front();
                self.items.push_back(envelope);
                oldest
            }
            OverflowPolicy::DropNewest => Some(envelope),
        };
        if let Some(dropped) = &dropped {
            warn!(
                event = "pending_queue_overflow",
                kind = %dropped.kind,
                policy = ?self.overflow,
                queued = self.items.len()
            );
        }
        dropped
    }

    /// Returns an envelope that failed to transmit to the head of the queue.
    ///
    /// Ignores the capacity: the envelope was already admitted once.
    pub(crate) fn requeue_front(&mut self, envelope: Envelope) {
        self.items.push_front(envelope);
    }

    pub(crate) fn pop(&mut self) -> Option<Envelope> {
        self.items.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}
