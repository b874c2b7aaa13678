//! Unified `Database` trait, the single async interface for all persistence.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::Application;
use crate::pipeline::job::ProcessingJob;
use crate::relevance::RelevanceCacheEntry;

/// Outcome of an application upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Backend-agnostic database trait covering jobs, the relevance cache and
/// merged applications.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new job.
    ///
    /// Fails with `DatabaseError::Constraint` when another non-terminal job
    /// already exists for the same `(user_id, output_target)`.
    async fn insert_job(&self, job: &ProcessingJob) -> Result<(), DatabaseError>;

    /// Persist the full current state of a job.
    async fn update_job(&self, job: &ProcessingJob) -> Result<(), DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<ProcessingJob>, DatabaseError>;

    /// Most recent jobs for a user, newest first.
    async fn list_jobs(&self, user_id: &str, limit: usize)
    -> Result<Vec<ProcessingJob>, DatabaseError>;

    /// The non-terminal job holding `(user_id, output_target)`, if any.
    async fn find_active_job(
        &self,
        user_id: &str,
        output_target: &str,
    ) -> Result<Option<ProcessingJob>, DatabaseError>;

    /// All jobs in a non-terminal stage, across users.
    async fn list_active_jobs(&self) -> Result<Vec<ProcessingJob>, DatabaseError>;

    // ── Relevance cache ─────────────────────────────────────────────

    /// Look up the cached classification for one of a user's messages.
    /// Message ids are only unique within a mailbox.
    async fn get_relevance(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Option<RelevanceCacheEntry>, DatabaseError>;

    /// Write an entry in one statement; a later write for the same
    /// `(user, message)` wins.
    async fn upsert_relevance(&self, entry: &RelevanceCacheEntry) -> Result<(), DatabaseError>;

    /// Number of cached entries owned by a user.
    async fn count_relevance(&self, user_id: &str) -> Result<u64, DatabaseError>;

    // ── Applications ────────────────────────────────────────────────

    /// Insert or refresh an application keyed by
    /// `(user, company, position, applied date)`. With `per_message`, the
    /// source message joins the key so one application may have several rows.
    async fn upsert_application(
        &self,
        app: &Application,
        per_message: bool,
    ) -> Result<UpsertOutcome, DatabaseError>;

    /// All applications for a user, ordered by applied date, company, position.
    async fn list_applications(&self, user_id: &str) -> Result<Vec<Application>, DatabaseError>;
}
