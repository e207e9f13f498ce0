//! # Task Queue
//!
//! Bounded work channel from the gateway to the workers.
//!
//! ## Delivery Semantics:
//! - Each pulled item is handed to exactly one worker as a [`Delivery`]
//! - The worker calls [`Delivery::ack`] once the job is terminal
//! - A delivery dropped without an ack (the worker panicked mid-job) goes back to
//!   the head of the queue, so delivery is at-least-once
//!
//! Ordering across jobs is FIFO in practice but callers must not rely on it.
//! Redelivery of a job that already started is *not* made safe here; the worker
//! skips such items because the store refuses a second PROCESSING entry.

use crate::jobs::model::JobId;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full ({0} items)")]
    Full(usize),

    #[error("queue is closed")]
    Closed,
}

/// One unit of work: everything a worker needs to run a job.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub job_id: JobId,
    pub file_path: String,
    pub options: Value,
    /// How many times this item has been handed out before
    pub redeliveries: u32,
}

impl WorkItem {
    pub fn new(job_id: JobId, file_path: impl Into<String>, options: Value) -> Self {
        Self {
            job_id,
            file_path: file_path.into(),
            options,
            redeliveries: 0,
        }
    }
}

/// Queue counters for the health endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub in_flight: usize,
    pub capacity: usize,
    /// Slots held by submissions that have not enqueued yet
    pub reserved: usize,
    pub delivered_total: u64,
    pub redelivered_total: u64,
    pub closed: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<WorkItem>,
    in_flight: usize,
    reserved: usize,
    closed: bool,
    delivered_total: u64,
    redelivered_total: u64,
}

#[derive(Debug)]
struct QueueInner {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

/// Cloneable handle to a shared queue.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                available: Condvar::new(),
                capacity,
            }),
        }
    }

    /// Enqueue without blocking. Fails when full or closed.
    pub fn push(&self, item: WorkItem) -> Result<(), QueueError> {
        self.reserve()?.push(item);
        Ok(())
    }

    /// Hold one slot of capacity without enqueuing anything yet.
    ///
    /// Dropping the reservation unused gives the slot back. Queued items plus
    /// open reservations never exceed the capacity.
    pub fn reserve(&self) -> Result<Reservation, QueueError> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.items.len() + state.reserved >= self.inner.capacity {
            return Err(QueueError::Full(self.inner.capacity));
        }
        state.reserved += 1;
        Ok(Reservation {
            queue: Arc::clone(&self.inner),
            used: false,
        })
    }

    /// Block until an item is available, the timeout elapses, or the queue closes.
    ///
    /// Returns `None` on timeout and on a closed queue; callers loop and check
    /// their own shutdown signal in between.
    pub fn pull(&self, timeout: Duration) -> Option<Delivery> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                state.in_flight += 1;
                state.delivered_total += 1;
                return Some(Delivery {
                    item,
                    settled: false,
                    queue: Arc::clone(&self.inner),
                });
            }
            if self
                .inner
                .available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return None;
            }
        }
    }

    /// Stop accepting work and wake every blocked worker.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        QueueStats {
            queued: state.items.len(),
            in_flight: state.in_flight,
            capacity: self.inner.capacity,
            reserved: state.reserved,
            delivered_total: state.delivered_total,
            redelivered_total: state.redelivered_total,
            closed: state.closed,
        }
    }
}

/// One slot of queue capacity held for a submission.
#[derive(Debug)]
pub struct Reservation {
    queue: Arc<QueueInner>,
    used: bool,
}

impl Reservation {
    /// Enqueue into the held slot. There is always room.
    pub fn push(mut self, item: WorkItem) {
        self.used = true;
        let mut state = self.queue.state.lock();
        state.reserved -= 1;
        tracing::debug!(job_id = %item.job_id, queued = state.items.len() + 1, "Work item enqueued");
        state.items.push_back(item);
        drop(state);
        self.queue.available.notify_one();
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.used {
            self.queue.state.lock().reserved -= 1;
        }
    }
}

/// An item checked out by one worker.
///
/// Dropping it without [`Delivery::ack`] puts the item back at the head of the
/// queue.
#[derive(Debug)]
pub struct Delivery {
    item: WorkItem,
    settled: bool,
    queue: Arc<QueueInner>,
}

impl Delivery {
    pub fn item(&self) -> &WorkItem {
        &self.item
    }

    /// Mark the item as fully handled; it will not be redelivered.
    pub fn ack(mut self) {
        self.settled = true;
        self.queue.state.lock().in_flight -= 1;
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut item = self.item.clone();
        item.redeliveries += 1;
        tracing::warn!(
            job_id = %item.job_id,
            redeliveries = item.redeliveries,
            "Delivery dropped without ack, returning item to queue"
        );
        let mut state = self.queue.state.lock();
        state.in_flight -= 1;
        state.redelivered_total += 1;
        state.items.push_front(item);
        drop(state);
        self.queue.available.notify_one();
    }
}
