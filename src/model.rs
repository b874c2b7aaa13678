//! Shared data model: application status, job requests/results, candidates.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

// ── Application status ──────────────────────────────────────────────

/// Closed set of application statuses.
///
/// The display strings are used verbatim in persisted state and in the
/// artifact's status column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ApplicationStatus {
    #[serde(rename = "Applied")]
    Applied,
    #[serde(rename = "Under Review")]
    UnderReview,
    #[serde(rename = "Interview Scheduled")]
    InterviewScheduled,
    #[serde(rename = "Interview Completed")]
    InterviewCompleted,
    #[serde(rename = "Offer")]
    Offer,
    #[serde(rename = "Rejected")]
    Rejected,
    #[serde(rename = "Withdrawn")]
    Withdrawn,
    #[serde(rename = "Accepted")]
    Accepted,
}

/// How a free-text status was resolved to an enum value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMatch {
    /// The text named a status exactly (case-insensitive).
    Exact,
    /// The text was mapped to the closest status by keyword.
    Nearest,
    /// Nothing recognisable; fell back to `Applied`.
    Default,
}

impl ApplicationStatus {
    pub const ALL: [ApplicationStatus; 8] = [
        Self::Applied,
        Self::UnderReview,
        Self::InterviewScheduled,
        Self::InterviewCompleted,
        Self::Offer,
        Self::Rejected,
        Self::Withdrawn,
        Self::Accepted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "Applied",
            Self::UnderReview => "Under Review",
            Self::InterviewScheduled => "Interview Scheduled",
            Self::InterviewCompleted => "Interview Completed",
            Self::Offer => "Offer",
            Self::Rejected => "Rejected",
            Self::Withdrawn => "Withdrawn",
            Self::Accepted => "Accepted",
        }
    }

    /// Exact, case-insensitive parse. Also accepts snake_case and the
    /// legacy "Interview Complete" spelling.
    pub fn parse_exact(s: &str) -> Option<Self> {
        let norm = s.trim().to_lowercase().replace(['_', '-'], " ");
        if norm == "interview complete" {
            return Some(Self::InterviewCompleted);
        }
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().to_lowercase() == norm)
    }

    /// Resolve arbitrary text to exactly one status. Never fails.
    pub fn resolve(text: &str) -> (Self, StatusMatch) {
        let cleaned = text.trim().trim_matches(|c: char| c == '"' || c == '\'' || c == '.');
        if let Some(status) = Self::parse_exact(cleaned) {
            return (status, StatusMatch::Exact);
        }

        let lower = cleaned.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        // Order matters: "offer accepted" is Accepted, "interview completed" beats "interview".
        let nearest = if has(&["withdr"]) {
            Some(Self::Withdrawn)
        } else if has(&["accepted", "hired", "onboard"]) {
            Some(Self::Accepted)
        } else if has(&["reject", "declin", "not selected", "unfortunately", "regret", "not moving forward"]) {
            Some(Self::Rejected)
        } else if has(&["offer", "congratulations"]) {
            Some(Self::Offer)
        } else if has(&["interview", "screen"]) && has(&["complete", "done", "finished", "thank you for interviewing"]) {
            Some(Self::InterviewCompleted)
        } else if has(&["interview", "screen", "schedul", "next step"]) {
            Some(Self::InterviewScheduled)
        } else if has(&["review", "pending", "in progress", "consideration"]) {
            Some(Self::UnderReview)
        } else if has(&["appl", "received", "submitted", "thank you for"]) {
            Some(Self::Applied)
        } else {
            None
        };

        match nearest {
            Some(status) => (status, StatusMatch::Nearest),
            None => (Self::Applied, StatusMatch::Default),
        }
    }
}

impl std::fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Job request / result ────────────────────────────────────────────

/// How new rows are combined with an existing artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Load existing rows and merge new ones in (newest wins per key).
    Append,
    /// Rebuild the artifact solely from this job's rows.
    #[default]
    Overwrite,
}

impl MergeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::Overwrite => "overwrite",
        }
    }
}

impl std::str::FromStr for MergeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "append" => Ok(Self::Append),
            "overwrite" => Ok(Self::Overwrite),
            other => Err(format!("unknown merge mode '{other}'")),
        }
    }
}

/// Half-open time window `[start, end)` to pull messages from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// A request to run the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub user_id: String,
    pub start_date: NaiveDate,
    /// Exclusive end day. Defaults to "now" at job creation.
    pub end_date: Option<NaiveDate>,
    pub output_target: String,
    pub merge_mode: MergeMode,
}

impl JobRequest {
    /// Validate and resolve the request into a concrete date range.
    pub fn resolve_range(&self, now: DateTime<Utc>) -> Result<DateRange, JobError> {
        if self.user_id.trim().is_empty() {
            return Err(JobError::InvalidRequest("user id is empty".into()));
        }
        if self.output_target.trim().is_empty() {
            return Err(JobError::InvalidRequest("output target is empty".into()));
        }

        let start = self.start_date.and_time(NaiveTime::MIN).and_utc();
        let end = match self.end_date {
            Some(day) => day.and_time(NaiveTime::MIN).and_utc(),
            None => now,
        };
        if start > end {
            return Err(JobError::InvalidRequest(format!(
                "start date {} is after end date {}",
                start.date_naive(),
                end.date_naive()
            )));
        }
        Ok(DateRange { start, end })
    }
}

/// Final outcome reported to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    /// True iff the job reached `completed`, even with non-empty `errors`.
    pub success: bool,
    pub message: String,
    pub applications_found: u32,
    pub applications_processed: u32,
    pub errors: Vec<String>,
    pub output_target: String,
}

impl JobResult {
    /// Human-readable multi-line summary for terminal output.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        if self.success {
            out.push_str("Job application processing completed\n");
        } else {
            out.push_str("Job application processing failed\n");
        }
        out.push_str(&format!("  Job: {}\n", self.job_id));
        out.push_str(&format!("  {}\n", self.message));
        out.push_str(&format!(
            "  Applications found: {}\n  Applications processed: {}\n  Output: {}\n",
            self.applications_found, self.applications_processed, self.output_target
        ));
        if !self.errors.is_empty() {
            out.push_str(&format!("  Errors ({}):\n", self.errors.len()));
            for e in &self.errors {
                out.push_str(&format!("  - {e}\n"));
            }
        }
        out
    }
}

// ── Candidates and applications ─────────────────────────────────────

/// In-flight application record produced by extraction and enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateApplication {
    pub message_id: String,
    pub company: String,
    pub position: String,
    pub applied_date: NaiveDate,
    pub source: String,
    pub location: Option<String>,
    pub job_id: Option<String>,
    pub status_link: Option<String>,
    /// Enrichment summary (artifact "Notes" column).
    pub notes: Option<String>,
    /// Status resolved by enrichment.
    pub status: Option<ApplicationStatus>,
    /// Raw status phrase seen during extraction, if any.
    pub status_hint: Option<String>,
    /// Message text handed to the summarizer (already trimmed).
    pub source_text: String,
    pub received_at: DateTime<Utc>,
    pub extraction_confidence: f32,
    pub enrichment_confidence: f32,
}

/// A merged, persisted application record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    pub user_id: String,
    pub company: String,
    pub position: String,
    pub applied_date: NaiveDate,
    pub status: ApplicationStatus,
    pub source: String,
    pub location: Option<String>,
    pub job_id: Option<String>,
    pub status_link: Option<String>,
    pub notes: Option<String>,
    pub message_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
