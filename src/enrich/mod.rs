//! Enrichment Stage: bounded summary and normalized status for a candidate.
//!
//! Whatever the capability returns, the stage guarantees a summary of at most
//! `max_words` whole words and a status from the closed [`ApplicationStatus`]
//! set.

pub mod llm;
pub mod rules;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::CapabilityError;
use crate::model::{ApplicationStatus, CandidateApplication, StatusMatch};
use crate::retry::CallPolicy;

pub use llm::LlmEnricher;
pub use rules::RuleEnricher;

/// Enrichment capability.
#[async_trait]
pub trait Enricher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Free-text summary of the candidate. May be empty or too long.
    async fn summarize(&self, candidate: &CandidateApplication) -> Result<String, CapabilityError>;

    /// Free-text status. May fall outside the status set.
    async fn infer_status(&self, candidate: &CandidateApplication)
    -> Result<String, CapabilityError>;
}

/// Enrichment stage.
pub struct EnrichmentStage {
    enricher: Arc<dyn Enricher>,
    calls: CallPolicy,
    max_words: usize,
}

impl EnrichmentStage {
    pub fn new(enricher: Arc<dyn Enricher>, calls: CallPolicy, max_words: usize) -> Self {
        Self {
            enricher,
            calls,
            max_words: max_words.max(1),
        }
    }

    /// Fill `candidate.notes`. An empty summary falls back to a template.
    pub async fn summarize(&self, candidate: &mut CandidateApplication) -> Result<(), CapabilityError> {
        let enricher = Arc::clone(&self.enricher);
        let snapshot = &*candidate;
        let raw = self
            .calls
            .run("summarize", || {
                let enricher = Arc::clone(&enricher);
                async move { enricher.summarize(snapshot).await }
            })
            .await?;

        let (summary, confidence) = match clean_summary(&raw, self.max_words) {
            Some(summary) => (summary, 1.0),
            None => {
                debug!(message_id = %candidate.message_id, "Empty summary, using fallback");
                let fallback = fallback_summary(candidate);
                let summary = clean_summary(&fallback, self.max_words).unwrap_or(fallback);
                (summary, 0.5)
            }
        };
        candidate.notes = Some(summary);
        candidate.enrichment_confidence = confidence;
        Ok(())
    }

    /// Fill `candidate.status`, resolving free text to the status set.
    pub async fn infer_status(
        &self,
        candidate: &mut CandidateApplication,
    ) -> Result<StatusMatch, CapabilityError> {
        let enricher = Arc::clone(&self.enricher);
        let snapshot = &*candidate;
        let raw = self
            .calls
            .run("infer_status", || {
                let enricher = Arc::clone(&enricher);
                async move { enricher.infer_status(snapshot).await }
            })
            .await?;

        let (status, matched) = ApplicationStatus::resolve(&raw);
        if matched != StatusMatch::Exact {
            debug!(
                message_id = %candidate.message_id,
                raw = %raw,
                status = %status,
                "Status mapped to nearest value"
            );
        }
        candidate.status = Some(status);
        candidate.enrichment_confidence *= match matched {
            StatusMatch::Exact => 1.0,
            StatusMatch::Nearest => 0.7,
            StatusMatch::Default => 0.4,
        };
        Ok(matched)
    }

    /// Summary then status.
    pub async fn enrich(
        &self,
        mut candidate: CandidateApplication,
    ) -> Result<CandidateApplication, CapabilityError> {
        self.summarize(&mut candidate).await?;
        self.infer_status(&mut candidate).await?;
        Ok(candidate)
    }
}

/// Normalize a raw summary: strip quotes, collapse whitespace, keep at most
/// `max_words` whole words, end with terminal punctuation.
///
/// Returns `None` when nothing is left.
pub fn clean_summary(raw: &str, max_words: usize) -> Option<String> {
    const QUOTES: &[char] = &['"', '\'', '\u{201c}', '\u{201d}', '\u{2018}', '\u{2019}', '`'];

    let stripped = raw.trim().trim_matches(QUOTES).trim();
    let words: Vec<&str> = stripped.split_whitespace().collect();
    if words.is_empty() {
        return None;
    }

    let truncated = words.len() > max_words;
    let mut summary = words[..words.len().min(max_words)].join(" ");
    if truncated {
        let keep = summary.trim_end_matches([',', ';', ':', '-']).len();
        summary.truncate(keep);
    }
    if !summary.ends_with(['.', '!', '?']) {
        summary.push('.');
    }
    Some(summary)
}

/// Template summary built from the candidate's own fields.
pub fn fallback_summary(candidate: &CandidateApplication) -> String {
    let company = &candidate.company;
    let position = &candidate.position;
    let source = if candidate.source.is_empty() {
        "email"
    } else {
        candidate.source.as_str()
    };
    let status = candidate.status.unwrap_or_else(|| {
        candidate
            .status_hint
            .as_deref()
            .map(|hint| ApplicationStatus::resolve(hint).0)
            .unwrap_or(ApplicationStatus::Applied)
    });

    match status {
        ApplicationStatus::Applied => {
            format!("Applied to {company} via {source}. Application confirmation received.")
        }
        ApplicationStatus::Rejected => {
            format!("{company} application status: Not selected for {position}.")
        }
        ApplicationStatus::InterviewScheduled => {
            format!("{company} interview scheduled for {position}.")
        }
        ApplicationStatus::InterviewCompleted => {
            format!("{company} interview completed for {position}.")
        }
        ApplicationStatus::Offer => format!("Job offer received from {company} for {position}."),
        other => format!("{company} application for {position} via {source}: {other}."),
    }
}
