//! Priority queue of pending messages
//!
//! Ready messages are ordered by `(priority desc, created_at asc, sequence
//! asc)`. Messages re-enqueued with a delay wait in a deferred list until
//! [`DeliveryQueue::promote_due`] moves them back into the ordered heap.

use std::{cmp::Ordering, collections::BinaryHeap, time::Instant};

use herald_common::tracing;
use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    error::DeliveryError,
    message::{Message, MessageId, MessageSummary},
};

/// Heap entry ordering messages by priority, then admission order.
#[derive(Debug)]
struct Ranked(Message);

impl Ranked {
    fn key(&self) -> (i32, std::cmp::Reverse<Instant>, std::cmp::Reverse<u64>) {
        (
            self.0.priority(),
            std::cmp::Reverse(self.0.created_at()),
            std::cmp::Reverse(self.0.sequence()),
        )
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Pending messages, ready and deferred
    pub size: usize,
    /// Messages waiting for their retry delay
    pub deferred: usize,
    /// Largest `size` observed
    pub max_size: usize,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_cleared: u64,
}

#[derive(Debug, Default)]
struct Inner {
    ready: BinaryHeap<Ranked>,
    deferred: Vec<(Instant, Message)>,
    max_size: usize,
    total_enqueued: u64,
    total_dequeued: u64,
    total_cleared: u64,
}

impl Inner {
    fn size(&self) -> usize {
        self.ready.len() + self.deferred.len()
    }

    fn note_enqueue(&mut self) {
        self.total_enqueued += 1;
        self.max_size = self.max_size.max(self.size());
    }
}

/// Holding area for pending messages. No operation blocks beyond a short
/// internal lock.
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    inner: Mutex<Inner>,
}

impl DeliveryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message, keeping the ordering invariant.
    pub fn enqueue(&self, message: Message) {
        tracing::trace!(
            message_id = %message.id(),
            priority = message.priority(),
            "Enqueued message"
        );

        let mut inner = self.inner.lock();
        inner.ready.push(Ranked(message));
        inner.note_enqueue();
    }

    /// Insert a message that must not be dequeued before `ready_at`.
    pub fn enqueue_deferred(&self, message: Message, ready_at: Instant) {
        tracing::trace!(
            message_id = %message.id(),
            priority = message.priority(),
            "Deferred message"
        );

        let mut inner = self.inner.lock();
        inner.deferred.push((ready_at, message));
        inner.note_enqueue();
    }

    /// Move every deferred message whose time has come into the ready heap.
    ///
    /// Returns the number of promoted messages.
    pub fn promote_due(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        if inner.deferred.is_empty() {
            return 0;
        }

        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.deferred)
            .into_iter()
            .partition(|(ready_at, _)| *ready_at <= now);

        inner.deferred = waiting;
        let promoted = due.len();
        inner
            .ready
            .extend(due.into_iter().map(|(_, message)| Ranked(message)));

        promoted
    }

    /// Remove and return the highest-ranked ready message.
    pub fn dequeue(&self) -> Option<Message> {
        let mut inner = self.inner.lock();
        let message = inner.ready.pop().map(|Ranked(message)| message)?;
        inner.total_dequeued += 1;
        drop(inner);

        tracing::trace!(message_id = %message.id(), "Dequeued message");
        Some(message)
    }

    /// Remove up to `limit` ready messages in rank order.
    pub fn dequeue_batch(&self, limit: usize) -> Vec<Message> {
        let mut inner = self.inner.lock();
        let mut batch = Vec::with_capacity(limit.min(inner.ready.len()));

        while batch.len() < limit {
            let Some(Ranked(message)) = inner.ready.pop() else {
                break;
            };
            batch.push(message);
        }

        inner.total_dequeued += batch.len() as u64;
        batch
    }

    /// The message `dequeue` would return next.
    pub fn peek(&self) -> Option<MessageSummary> {
        self.inner.lock().ready.peek().map(|ranked| ranked.0.summary())
    }

    /// Pending messages, ready and deferred.
    pub fn size(&self) -> usize {
        self.inner.lock().size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Messages that can be dequeued right now.
    pub fn ready_len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    pub fn deferred_len(&self) -> usize {
        self.inner.lock().deferred.len()
    }

    /// Earliest instant a deferred message becomes ready.
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.inner
            .lock()
            .deferred
            .iter()
            .map(|(ready_at, _)| *ready_at)
            .min()
    }

    /// Remove every pending message, rejecting each with an error whose
    /// message is `reason`. Returns the ids of the rejected messages.
    pub fn clear(&self, reason: &str, now: Instant) -> Vec<MessageId> {
        let (ready, deferred) = {
            let mut inner = self.inner.lock();
            let ready = std::mem::take(&mut inner.ready);
            let deferred = std::mem::take(&mut inner.deferred);
            inner.total_cleared += (ready.len() + deferred.len()) as u64;
            (ready, deferred)
        };

        // Settle outside the lock; handles may wake their producers.
        let cleared: Vec<MessageId> = ready
            .into_iter()
            .map(|Ranked(message)| message)
            .chain(deferred.into_iter().map(|(_, message)| message))
            .map(|mut message| {
                message.mark_failed(
                    DeliveryError::Cleared {
                        reason: reason.to_string(),
                    },
                    now,
                );
                message.id()
            })
            .collect();

        if !cleared.is_empty() {
            tracing::debug!(count = cleared.len(), reason, "Cleared delivery queue");
        }

        cleared
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            size: inner.size(),
            deferred: inner.deferred.len(),
            max_size: inner.max_size,
            total_enqueued: inner.total_enqueued,
            total_dequeued: inner.total_dequeued,
            total_cleared: inner.total_cleared,
        }
    }

    /// Oldest admission instant among pending messages.
    pub fn oldest_created_at(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        inner
            .ready
            .iter()
            .map(|ranked| ranked.0.created_at())
            .chain(inner.deferred.iter().map(|(_, message)| message.created_at()))
            .min()
    }
}
