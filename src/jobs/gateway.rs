//! # Job Gateway
//!
//! Submission and status reads. The gateway assigns job identity, records the
//! PENDING job and hands a work item to the queue; it never talks to a worker.
//! Queue capacity is reserved before the record exists, so a refused
//! submission leaves no job behind.
//! `options` is carried opaquely and the file path is not checked here: both
//! are validated by the worker that executes the job.

use crate::jobs::model::{Job, JobId, JobStatus, JobStatusView};
use crate::jobs::queue::{QueueError, TaskQueue, WorkItem};
use crate::jobs::store::{JobStore, StoreError};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("task queue rejected submission: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of an accepted submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub job_id: JobId,
    pub status: JobStatus,
}

#[derive(Clone)]
pub struct Gateway {
    store: Arc<dyn JobStore>,
    queue: TaskQueue,
    unknown_job_as_pending: Arc<AtomicBool>,
}

impl Gateway {
    pub fn new(store: Arc<dyn JobStore>, queue: TaskQueue, unknown_job_as_pending: bool) -> Self {
        Self {
            store,
            queue,
            unknown_job_as_pending: Arc::new(AtomicBool::new(unknown_job_as_pending)),
        }
    }

    /// Switch the unknown-ID answer at runtime (config updates).
    pub fn set_unknown_job_as_pending(&self, enabled: bool) {
        self.unknown_job_as_pending.store(enabled, Ordering::Relaxed);
    }

    /// Create the PENDING record and enqueue its work item.
    ///
    /// A full or closed queue refuses the submission before any record is
    /// written. Once the slot is held the enqueue cannot fail, so every
    /// PENDING job has a work item behind it.
    pub fn submit(&self, file_path: &str, options: Value) -> Result<Submission, SubmitError> {
        let reservation = self.queue.reserve().map_err(|e| {
            tracing::warn!(file = %file_path, error = %e, "Submission refused by task queue");
            e
        })?;

        let job_id = JobId::generate();
        self.store
            .create(Job::pending(job_id.clone(), file_path, options.clone()))?;
        reservation.push(WorkItem::new(job_id.clone(), file_path, options));

        tracing::info!(job_id = %job_id, file = %file_path, "Job submitted");
        Ok(Submission {
            job_id,
            status: JobStatus::Pending,
        })
    }

    /// Current view of a job. `None` means the ID is unknown, unless the
    /// gateway is configured to report unknown IDs as PENDING.
    pub fn get_status(&self, job_id: &str) -> Option<JobStatusView> {
        match self.store.get(&JobId::from(job_id)) {
            Some(job) => Some(JobStatusView::from(&job)),
            None if self.unknown_job_as_pending.load(Ordering::Relaxed) => {
                Some(JobStatusView::unknown_as_pending(job_id))
            }
            None => None,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }
}
