//! # Job Record Store
//!
//! Keyed job state shared between the gateway (reads, creates) and the workers
//! (lifecycle writes). This is the only mutable state that crosses the
//! gateway/worker boundary.
//!
//! ## State Machine Enforcement:
//! Every write goes through a transition check, so a buggy caller cannot move a
//! job backwards:
//! - `mark_processing` only from PENDING
//! - `update_progress` only while PROCESSING, and never lower than before
//! - `complete` / `fail` only from PROCESSING, so every terminal job passed
//!   through exactly one PROCESSING entry
//!
//! Records are never deleted here; retention is someone else's job.

use crate::jobs::model::{ErrorRecord, Job, JobId, JobStatus, Segment};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("job {id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {id}: progress may not decrease ({current} -> {requested})")]
    ProgressRegression {
        id: JobId,
        current: f64,
        requested: f64,
    },
}

/// Per-status job counts, reported by the health endpoint.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct StoreCounts {
    pub pending: usize,
    pub processing: usize,
    pub success: usize,
    pub failure: usize,
}

/// Create/read/update operations over job records.
pub trait JobStore: Send + Sync {
    fn create(&self, job: Job) -> Result<(), StoreError>;

    /// `None` means the ID was never submitted.
    fn get(&self, id: &JobId) -> Option<Job>;

    /// PENDING → PROCESSING with progress 0.
    fn mark_processing(&self, id: &JobId) -> Result<(), StoreError>;

    fn update_progress(&self, id: &JobId, progress: f64) -> Result<(), StoreError>;

    /// → SUCCESS with progress 100 and the result attached.
    fn complete(&self, id: &JobId, result: Vec<Segment>) -> Result<(), StoreError>;

    /// → FAILURE with the error attached.
    fn fail(&self, id: &JobId, error: ErrorRecord) -> Result<(), StoreError>;

    fn counts(&self) -> StoreCounts;
}

/// Process-local store backed by a hash map.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_job<F>(&self, id: &JobId, update: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), StoreError>,
    {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        update(job)
    }
}

fn illegal(job: &Job, to: JobStatus) -> StoreError {
    StoreError::IllegalTransition {
        id: job.id.clone(),
        from: job.status,
        to,
    }
}

impl JobStore for InMemoryJobStore {
    fn create(&self, job: Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    fn get(&self, id: &JobId) -> Option<Job> {
        self.jobs.read().get(id).cloned()
    }

    fn mark_processing(&self, id: &JobId) -> Result<(), StoreError> {
        self.with_job(id, |job| {
            if job.status != JobStatus::Pending {
                return Err(illegal(job, JobStatus::Processing));
            }
            job.status = JobStatus::Processing;
            job.progress = 0.0;
            job.started_at = Some(Utc::now());
            Ok(())
        })
    }

    fn update_progress(&self, id: &JobId, progress: f64) -> Result<(), StoreError> {
        self.with_job(id, |job| {
            if job.status != JobStatus::Processing {
                return Err(illegal(job, JobStatus::Processing));
            }
            let progress = progress.clamp(0.0, 100.0);
            if progress < job.progress {
                return Err(StoreError::ProgressRegression {
                    id: job.id.clone(),
                    current: job.progress,
                    requested: progress,
                });
            }
            job.progress = progress;
            Ok(())
        })
    }

    fn complete(&self, id: &JobId, result: Vec<Segment>) -> Result<(), StoreError> {
        self.with_job(id, |job| {
            if job.status != JobStatus::Processing {
                return Err(illegal(job, JobStatus::Success));
            }
            job.status = JobStatus::Success;
            job.progress = 100.0;
            job.result = Some(result);
            job.finished_at = Some(Utc::now());
            Ok(())
        })
    }

    fn fail(&self, id: &JobId, error: ErrorRecord) -> Result<(), StoreError> {
        self.with_job(id, |job| {
            if job.status != JobStatus::Processing {
                return Err(illegal(job, JobStatus::Failure));
            }
            job.status = JobStatus::Failure;
            job.result = None;
            job.error = Some(error);
            job.finished_at = Some(Utc::now());
            Ok(())
        })
    }

    fn counts(&self) -> StoreCounts {
        let jobs = self.jobs.read();
        let mut counts = StoreCounts::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Success => counts.success += 1,
                JobStatus::Failure => counts.failure += 1,
            }
        }
        counts
    }
}
