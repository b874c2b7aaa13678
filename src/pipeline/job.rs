//! The processing job record and its guarded mutators.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;
use crate::model::{DateRange, JobRequest, JobResult, MergeMode};
use crate::pipeline::state::JobStage;

/// One end-to-end execution of the pipeline.
///
/// Only the orchestrator mutates a job, and every mutator refuses to touch a
/// job that has reached a terminal stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: Uuid,
    pub user_id: String,
    pub start_date: NaiveDate,
    /// End date as requested; `None` means the job ran up to `range_end`.
    pub end_date: Option<NaiveDate>,
    /// Resolved window actually searched.
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub output_target: String,
    pub merge_mode: MergeMode,
    pub stage: JobStage,
    /// 0..=100, never decreases.
    pub progress: u8,
    pub found: u32,
    pub processed: u32,
    /// Non-fatal errors in the order they were recorded.
    pub errors: Vec<String>,
    /// Terminal outcome message (fatal reason on `error`).
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessingJob {
    /// Create a job in `initializing` for an already-validated request.
    pub fn new(request: &JobRequest, range: DateRange, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: request.user_id.clone(),
            start_date: request.start_date,
            end_date: request.end_date,
            range_start: range.start,
            range_end: range.end,
            output_target: request.output_target.clone(),
            merge_mode: request.merge_mode,
            stage: JobStage::Initializing,
            progress: 0,
            found: 0,
            processed: 0,
            errors: Vec::new(),
            message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn range(&self) -> DateRange {
        DateRange {
            start: self.range_start,
            end: self.range_end,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    fn ensure_mutable(&self) -> Result<(), JobError> {
        if self.is_terminal() {
            Err(JobError::Immutable { id: self.id })
        } else {
            Ok(())
        }
    }

    /// Move to `target`, raising progress to the start of its band.
    pub fn transition_to(&mut self, target: JobStage) -> Result<(), JobError> {
        self.ensure_mutable()?;
        if !self.stage.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                id: self.id,
                stage: self.stage.to_string(),
                target: target.to_string(),
            });
        }

        let now = Utc::now();
        self.stage = target;
        if target != JobStage::Error {
            self.progress = self.progress.max(target.progress_band().0);
        }
        if target.is_terminal() {
            self.completed_at = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }

    /// Advance progress inside the current stage's band to `done / total`.
    ///
    /// Returns `true` when the stored progress actually increased.
    pub fn advance_within_stage(&mut self, done: usize, total: usize) -> Result<bool, JobError> {
        self.ensure_mutable()?;
        let (start, end) = self.stage.progress_band();
        let target = if total == 0 {
            end
        } else {
            let span = u64::from(end - start);
            let frac = (span * done.min(total) as u64) / total as u64;
            start + frac as u8
        };
        if target > self.progress {
            self.progress = target;
            self.updated_at = Utc::now();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Append a non-fatal error.
    pub fn record_error(&mut self, error: impl Into<String>) -> Result<(), JobError> {
        self.ensure_mutable()?;
        self.errors.push(error.into());
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn add_found(&mut self, n: u32) -> Result<(), JobError> {
        self.ensure_mutable()?;
        self.found = self.found.saturating_add(n);
        Ok(())
    }

    /// Counts a candidate that completed enrichment. Never exceeds `found`.
    pub fn add_processed(&mut self, n: u32) -> Result<(), JobError> {
        self.ensure_mutable()?;
        self.processed = self.processed.saturating_add(n).min(self.found);
        Ok(())
    }

    /// Mark the job completed with a final message.
    pub fn complete(&mut self, message: impl Into<String>) -> Result<(), JobError> {
        self.transition_to(JobStage::Completed)?;
        self.message = Some(message.into());
        Ok(())
    }

    /// Abort on a fatal condition. Counters and errors are preserved.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), JobError> {
        self.transition_to(JobStage::Error)?;
        self.message = Some(reason.into());
        Ok(())
    }

    /// Caller-facing outcome.
    pub fn to_result(&self) -> JobResult {
        let success = self.stage == JobStage::Completed;
        let message = self.message.clone().unwrap_or_else(|| {
            if success {
                "Job completed".to_string()
            } else {
                format!("Job is in stage {}", self.stage)
            }
        });
        JobResult {
            job_id: self.id,
            success,
            message,
            applications_found: self.found,
            applications_processed: self.processed,
            errors: self.errors.clone(),
            output_target: self.output_target.clone(),
        }
    }
}
