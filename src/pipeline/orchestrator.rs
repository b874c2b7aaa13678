//! Job orchestrator: owns a job's lifecycle and sequences the stages.
//!
//! One task drives each job. Per-message work inside a stage fans out to at
//! most `concurrency` futures and joins before the next stage starts, so the
//! job record itself is only ever touched from the driving task.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::enrich::EnrichmentStage;
use crate::error::{DatabaseError, JobError};
use crate::extract::ExtractionStage;
use crate::model::{CandidateApplication, JobRequest, JobResult};
use crate::output::{OutputRow, OutputStage};
use crate::pipeline::job::ProcessingJob;
use crate::pipeline::progress::{ProgressPublisher, ProgressSnapshot};
use crate::pipeline::state::JobStage;
use crate::relevance::{RelevanceCache, RelevanceError};
use crate::source::{RawMessage, SourceReader};
use crate::store::Database;

/// The stage implementations a job runs through.
pub struct Stages {
    pub reader: SourceReader,
    pub relevance: RelevanceCache,
    pub extraction: ExtractionStage,
    pub enrichment: EnrichmentStage,
    pub output: OutputStage,
}

/// Why a run stopped early.
enum Abort {
    Cancelled,
    Fatal(String),
    Store(DatabaseError),
}

impl From<DatabaseError> for Abort {
    fn from(e: DatabaseError) -> Self {
        Self::Store(e)
    }
}

impl From<JobError> for Abort {
    fn from(e: JobError) -> Self {
        match e {
            JobError::Store(db) => Self::Store(db),
            other => Self::Fatal(other.to_string()),
        }
    }
}

type ActiveKey = (String, String);
type ActiveJobs = Arc<Mutex<HashMap<ActiveKey, Uuid>>>;

/// Releases the in-process `(user, target)` reservation when dropped.
struct Reservation {
    active: ActiveJobs,
    key: Option<ActiveKey>,
}

impl Reservation {
    /// Keep the reservation past this guard's lifetime.
    fn keep(mut self) {
        self.key = None;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(key) = self.key.take()
            && let Ok(mut active) = self.active.lock()
        {
            active.remove(&key);
        }
    }
}

/// A job running in the background.
pub struct JobHandle {
    pub job_id: Uuid,
    pub cancel: CancellationToken,
    pub task: JoinHandle<Result<JobResult, JobError>>,
}

pub struct Orchestrator {
    db: Arc<dyn Database>,
    stages: Stages,
    publisher: Arc<dyn ProgressPublisher>,
    concurrency: usize,
    active: ActiveJobs,
}

impl Orchestrator {
    pub fn new(
        db: Arc<dyn Database>,
        stages: Stages,
        publisher: Arc<dyn ProgressPublisher>,
        concurrency: usize,
    ) -> Self {
        Self {
            db,
            stages,
            publisher,
            concurrency: concurrency.max(1),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn get_job(&self, id: Uuid) -> Result<ProcessingJob, JobError> {
        self.db
            .get_job(id)
            .await?
            .ok_or(JobError::NotFound { id })
    }

    pub async fn list_jobs(&self, user_id: &str, limit: usize) -> Result<Vec<ProcessingJob>, JobError> {
        Ok(self.db.list_jobs(user_id, limit).await?)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Validate `request` and persist a new job in `initializing`.
    ///
    /// Rejects the request when another job is still running for the same
    /// user and output target. The returned job must be passed to [`run`].
    ///
    /// [`run`]: Orchestrator::run
    pub async fn create_job(&self, request: JobRequest) -> Result<ProcessingJob, JobError> {
        let now = Utc::now();
        let range = request.resolve_range(now)?;
        let job = ProcessingJob::new(&request, range, now);
        let key = (job.user_id.clone(), job.output_target.clone());

        {
            let mut active = self
                .active
                .lock()
                .map_err(|_| JobError::InvalidRequest("job registry poisoned".into()))?;
            if let Some(existing) = active.get(&key) {
                return Err(JobError::AlreadyRunning {
                    existing: *existing,
                    output_target: job.output_target.clone(),
                });
            }
            active.insert(key.clone(), job.id);
        }
        let reservation = Reservation {
            active: Arc::clone(&self.active),
            key: Some(key),
        };

        match self.db.insert_job(&job).await {
            Ok(()) => {}
            Err(DatabaseError::Constraint(_)) => {
                let existing = self
                    .db
                    .find_active_job(&job.user_id, &job.output_target)
                    .await?
                    .map(|j| j.id)
                    .unwrap_or(Uuid::nil());
                return Err(JobError::AlreadyRunning {
                    existing,
                    output_target: job.output_target.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        // Released when `run` finishes with the job.
        reservation.keep();

        info!(
            job_id = %job.id,
            user_id = %job.user_id,
            output_target = %job.output_target,
            merge_mode = job.merge_mode.as_str(),
            "Job created"
        );
        self.publisher.publish(&ProgressSnapshot::from(&job));
        Ok(job)
    }

    /// Drive `job` to a terminal stage.
    ///
    /// Returns the caller-facing result; a job that ended in `error` is still
    /// `Ok` with `success == false`. `Err` means even the failure could not be
    /// recorded.
    pub async fn run(
        &self,
        mut job: ProcessingJob,
        cancel: CancellationToken,
    ) -> Result<JobResult, JobError> {
        let _reservation = Reservation {
            active: Arc::clone(&self.active),
            key: Some((job.user_id.clone(), job.output_target.clone())),
        };

        match self.execute(&mut job, &cancel).await {
            Ok(()) => {
                info!(
                    job_id = %job.id,
                    found = job.found,
                    processed = job.processed,
                    errors = job.errors.len(),
                    "Job completed"
                );
                Ok(job.to_result())
            }
            Err(abort) => {
                let reason = match abort {
                    Abort::Cancelled => "cancelled".to_string(),
                    Abort::Fatal(reason) => reason,
                    Abort::Store(e) => format!("durable store unavailable: {e}"),
                };
                error!(job_id = %job.id, stage = %job.stage, reason = %reason, "Job failed");
                if !job.is_terminal() {
                    job.fail(reason)?;
                }
                self.checkpoint(&mut job).await?;
                Ok(job.to_result())
            }
        }
    }

    /// Create and run a job on the current task.
    pub async fn process(
        &self,
        request: JobRequest,
        cancel: CancellationToken,
    ) -> Result<JobResult, JobError> {
        let job = self.create_job(request).await?;
        self.run(job, cancel).await
    }

    /// Create a job and run it on a background task.
    pub async fn submit(self: &Arc<Self>, request: JobRequest) -> Result<JobHandle, JobError> {
        let job = self.create_job(request).await?;
        let job_id = job.id;
        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move { this.run(job, token).await });
        Ok(JobHandle {
            job_id,
            cancel,
            task,
        })
    }

    /// Fail jobs a previous process left in a non-terminal stage, releasing
    /// their output targets. Returns the ids that were recovered.
    pub async fn recover_interrupted(&self) -> Result<Vec<Uuid>, JobError> {
        let running: Vec<Uuid> = self
            .active
            .lock()
            .map(|active| active.values().copied().collect())
            .unwrap_or_default();

        let mut recovered = Vec::new();
        for mut job in self.db.list_active_jobs().await? {
            if running.contains(&job.id) {
                continue;
            }
            warn!(job_id = %job.id, stage = %job.stage, "Recovering interrupted job");
            job.fail(format!("interrupted during {}", job.stage))?;
            self.db.update_job(&job).await?;
            self.publisher.publish(&ProgressSnapshot::from(&job));
            recovered.push(job.id);
        }
        Ok(recovered)
    }

    // ── Stage sequencing ────────────────────────────────────────────

    /// Persist the job, then publish it. The publish happens even when the
    /// write fails.
    async fn checkpoint(&self, job: &mut ProcessingJob) -> Result<(), DatabaseError> {
        job.updated_at = Utc::now();
        let saved = self.db.update_job(job).await;
        self.publisher.publish(&ProgressSnapshot::from(&*job));
        saved
    }

    async fn enter(
        &self,
        job: &mut ProcessingJob,
        stage: JobStage,
        cancel: &CancellationToken,
    ) -> Result<(), Abort> {
        if cancel.is_cancelled() {
            return Err(Abort::Cancelled);
        }
        job.transition_to(stage)?;
        info!(job_id = %job.id, stage = %stage, progress = job.progress, "Stage started");
        self.checkpoint(job).await?;
        Ok(())
    }

    async fn advance(&self, job: &mut ProcessingJob, done: usize, total: usize) -> Result<(), Abort> {
        if job.advance_within_stage(done, total)? {
            self.checkpoint(job).await?;
        }
        Ok(())
    }

    async fn execute(&self, job: &mut ProcessingJob, cancel: &CancellationToken) -> Result<(), Abort> {
        self.enter(job, JobStage::FindingEmails, cancel).await?;
        let relevant = self.find_emails(job, cancel).await?;

        self.enter(job, JobStage::ParsingEmails, cancel).await?;
        let candidates = self.parse_emails(job, relevant).await?;

        self.enter(job, JobStage::Summarizing, cancel).await?;
        let candidates = self.summarize(job, candidates).await?;

        self.enter(job, JobStage::TrackingStatus, cancel).await?;
        let candidates = self.track_status(job, candidates).await?;

        self.enter(job, JobStage::WritingExcel, cancel).await?;
        let message = self.write_output(job, candidates).await?;

        job.complete(message)?;
        self.checkpoint(job).await?;
        Ok(())
    }

    /// Fetch pages and keep the messages the relevance cache forwards.
    async fn find_emails(
        &self,
        job: &mut ProcessingJob,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawMessage>, Abort> {
        let user_id = job.user_id.clone();
        debug!(
            job_id = %job.id,
            source = self.stages.reader.source_name(),
            "Fetching messages"
        );
        let mut pages = self.stages.reader.fetch(&user_id, job.range());
        let mut relevant = Vec::new();
        let mut seen = 0usize;
        let mut classified = 0usize;
        let mut page_no = 0usize;

        while let Some(page) = pages.next().await {
            page_no += 1;
            let page = match page {
                Ok(page) => page,
                Err(e) if page_no == 1 => {
                    return Err(Abort::Fatal(format!("first page fetch failed: {e}")));
                }
                Err(e) => {
                    warn!(job_id = %job.id, page = page_no, error = %e, "Page fetch failed, continuing with fetched messages");
                    job.record_error(format!("page {page_no}: fetch failed: {e}"))?;
                    break;
                }
            };

            for (id, e) in &page.failures {
                job.record_error(format!("{id}: fetch failed: {e}"))?;
            }
            seen += page.messages.len();
            let total = page
                .total_estimate
                .map(|t| t as usize)
                .unwrap_or(seen)
                .max(seen);

            let relevance = &self.stages.relevance;
            let user = user_id.as_str();
            let mut decisions = stream::iter(page.messages)
                .map(|message| async move {
                    let decision = relevance.resolve(user, &message).await;
                    (message, decision)
                })
                .buffer_unordered(self.concurrency);

            let mut store_failure = None;
            while let Some((message, decision)) = decisions.next().await {
                classified += 1;
                match decision {
                    Ok(d) if d.forward => {
                        job.add_found(1)?;
                        relevant.push(message);
                    }
                    Ok(d) => {
                        debug!(message_id = %message.id, cached = d.cached, "Not job-related, skipping");
                    }
                    Err(RelevanceError::Classify(e)) => {
                        warn!(message_id = %message.id, error = %e, "Classification failed");
                        job.add_found(1)?;
                        job.record_error(format!("{}: classification failed: {e}", message.id))?;
                    }
                    // Drain the in-flight work before giving up.
                    Err(RelevanceError::Store(e)) => {
                        if store_failure.is_none() {
                            store_failure = Some(e);
                        }
                    }
                }
                if store_failure.is_none() {
                    self.advance(job, classified, total).await?;
                }
            }
            if let Some(e) = store_failure {
                return Err(Abort::Store(e));
            }
            if cancel.is_cancelled() {
                return Err(Abort::Cancelled);
            }
        }

        info!(
            job_id = %job.id,
            fetched = seen,
            found = job.found,
            "Relevant messages collected"
        );
        Ok(relevant)
    }

    async fn parse_emails(
        &self,
        job: &mut ProcessingJob,
        messages: Vec<RawMessage>,
    ) -> Result<Vec<CandidateApplication>, Abort> {
        let total = messages.len();
        let extraction = &self.stages.extraction;
        let mut results = stream::iter(messages)
            .map(|message| async move {
                let result = extraction.extract(&message).await;
                (message.id, result)
            })
            .buffer_unordered(self.concurrency);

        let mut candidates = Vec::with_capacity(total);
        let mut done = 0;
        while let Some((id, result)) = results.next().await {
            done += 1;
            match result {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => {
                    warn!(message_id = %id, error = %e, "Extraction failed");
                    job.record_error(format!("{id}: {e}"))?;
                }
            }
            self.advance(job, done, total).await?;
        }
        Ok(candidates)
    }

    async fn summarize(
        &self,
        job: &mut ProcessingJob,
        candidates: Vec<CandidateApplication>,
    ) -> Result<Vec<CandidateApplication>, Abort> {
        let total = candidates.len();
        let enrichment = &self.stages.enrichment;
        let mut results = stream::iter(candidates)
            .map(|mut candidate| async move {
                let result = enrichment.summarize(&mut candidate).await;
                (candidate, result)
            })
            .buffer_unordered(self.concurrency);

        let mut summarized = Vec::with_capacity(total);
        let mut done = 0;
        while let Some((candidate, result)) = results.next().await {
            done += 1;
            match result {
                Ok(()) => summarized.push(candidate),
                Err(e) => {
                    warn!(message_id = %candidate.message_id, error = %e, "Summary failed");
                    job.record_error(format!("{}: summary failed: {e}", candidate.message_id))?;
                }
            }
            self.advance(job, done, total).await?;
        }
        Ok(summarized)
    }

    async fn track_status(
        &self,
        job: &mut ProcessingJob,
        candidates: Vec<CandidateApplication>,
    ) -> Result<Vec<CandidateApplication>, Abort> {
        let total = candidates.len();
        let enrichment = &self.stages.enrichment;
        let mut results = stream::iter(candidates)
            .map(|mut candidate| async move {
                let result = enrichment.infer_status(&mut candidate).await;
                (candidate, result)
            })
            .buffer_unordered(self.concurrency);

        let mut tracked = Vec::with_capacity(total);
        let mut done = 0;
        while let Some((candidate, result)) = results.next().await {
            done += 1;
            match result {
                Ok(_) => {
                    job.add_processed(1)?;
                    tracked.push(candidate);
                }
                Err(e) => {
                    warn!(message_id = %candidate.message_id, error = %e, "Status inference failed");
                    job.record_error(format!(
                        "{}: status inference failed: {e}",
                        candidate.message_id
                    ))?;
                }
            }
            self.advance(job, done, total).await?;
        }
        Ok(tracked)
    }

    /// Merge into the artifact and record the merged applications.
    async fn write_output(
        &self,
        job: &mut ProcessingJob,
        mut candidates: Vec<CandidateApplication>,
    ) -> Result<String, Abort> {
        // Oldest first, so the newest message wins a shared key.
        candidates.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        let rows: Vec<OutputRow> = candidates.iter().map(OutputRow::from_candidate).collect();
        let produced: HashSet<&str> = candidates.iter().map(|c| c.message_id.as_str()).collect();

        let report = self
            .stages
            .output
            .write(&job.output_target, rows, job.merge_mode)
            .await
            .map_err(|e| Abort::Fatal(format!("output artifact unwritable: {e}")))?;
        if let Some(note) = report.recovered {
            job.record_error(note)?;
        }

        // Record the rows that survived the merge, not every candidate, so
        // a key shared by several messages keeps only the newest.
        let now = Utc::now();
        let per_message = self.stages.output.allow_duplicates();
        for row in report
            .merge
            .rows
            .iter()
            .filter(|r| produced.contains(r.message_id.as_str()))
        {
            let app = row.to_application(&job.user_id, now);
            self.db.upsert_application(&app, per_message).await?;
        }

        let merge = report.merge;
        Ok(format!(
            "Processed {} of {} applications; wrote {} rows to {} ({} new, {} updated)",
            job.processed,
            job.found,
            merge.rows.len(),
            job.output_target,
            merge.inserted,
            merge.updated
        ))
    }
}
