//! Extractive enrichment: no network, built from the message text itself.

use async_trait::async_trait;

use super::Enricher;
use crate::error::CapabilityError;
use crate::model::CandidateApplication;

/// A sentence containing one of these is worth keeping as the summary.
const KEY_TERMS: &[&str] = &[
    "application",
    "applying",
    "interview",
    "offer",
    "unfortunately",
    "next step",
    "assessment",
    "schedule",
    "review",
];

/// Characters of message text handed to status resolution when no hint exists.
const STATUS_TEXT_CHARS: usize = 500;

/// Picks the first informative sentence as the summary and reuses the
/// extraction status hint.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleEnricher;

fn sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[async_trait]
impl Enricher for RuleEnricher {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn summarize(&self, candidate: &CandidateApplication) -> Result<String, CapabilityError> {
        let summary = sentences(&candidate.source_text)
            .find(|s| {
                let lower = s.to_lowercase();
                KEY_TERMS.iter().any(|t| lower.contains(t))
            })
            .unwrap_or_default();
        Ok(summary.to_string())
    }

    async fn infer_status(
        &self,
        candidate: &CandidateApplication,
    ) -> Result<String, CapabilityError> {
        Ok(match &candidate.status_hint {
            Some(hint) => hint.clone(),
            None => candidate.source_text.chars().take(STATUS_TEXT_CHARS).collect(),
        })
    }
}
