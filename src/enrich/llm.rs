//! LLM-backed summary and status capability.

use std::sync::Arc;

use async_trait::async_trait;

use super::Enricher;
use crate::error::CapabilityError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::model::{ApplicationStatus, CandidateApplication};

const SUMMARY_PROMPT: &str = "\
Write a very concise summary (maximum 30 words) of a job application email. \
Focus on the key application details, the current status, any important next \
steps and the platform used. Reply with the summary text only.";

const STATUS_PROMPT_HEAD: &str = "\
Classify the current status of this job application. Reply with exactly one \
of the following values and nothing else:";

/// Enricher backed by an LLM provider.
pub struct LlmEnricher {
    llm: Arc<dyn LlmProvider>,
}

impl LlmEnricher {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    fn describe(candidate: &CandidateApplication) -> String {
        format!(
            "Company: {}\nPosition: {}\nSource: {}\nStatus hint: {}\n\nEmail content:\n{}",
            candidate.company,
            candidate.position,
            candidate.source,
            candidate.status_hint.as_deref().unwrap_or("unknown"),
            candidate.source_text
        )
    }
}

#[async_trait]
impl Enricher for LlmEnricher {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn summarize(&self, candidate: &CandidateApplication) -> Result<String, CapabilityError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(SUMMARY_PROMPT),
            ChatMessage::user(Self::describe(candidate)),
        ])
        .with_temperature(0.3)
        .with_max_tokens(100);
        Ok(self.llm.complete(request).await?.content)
    }

    async fn infer_status(
        &self,
        candidate: &CandidateApplication,
    ) -> Result<String, CapabilityError> {
        let options = ApplicationStatus::ALL
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let request = CompletionRequest::new(vec![
            ChatMessage::system(format!("{STATUS_PROMPT_HEAD} {options}.")),
            ChatMessage::user(Self::describe(candidate)),
        ])
        .with_temperature(0.0)
        .with_max_tokens(20);
        Ok(self.llm.complete(request).await?.content)
    }
}
