//! LLM-backed extraction capability.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;

use super::{ExtractedFields, Extraction, Extractor};
use crate::error::CapabilityError;
use crate::llm::json::parse_json_reply;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::source::RawMessage;

const EXTRACT_PROMPT: &str = "\
You extract job-application details from an email the user received about \
one of their own applications.

Respond with ONLY a JSON object:
{
  \"is_application\": true|false,
  \"company\": \"employer name\" | null,
  \"position\": \"job title\" | null,
  \"applied_date\": \"YYYY-MM-DD\" | null,
  \"source\": \"platform the application went through (LinkedIn, Greenhouse, Lever, ...)\" | null,
  \"location\": \"city, region or Remote\" | null,
  \"job_id\": \"requisition or job id\" | null,
  \"status_link\": \"URL where the application status can be checked\" | null,
  \"status\": \"short phrase describing the application status\" | null,
  \"confidence\": <0.0-1.0>
}

Use null for anything the email does not state. The company is the employer, \
never the applicant tracking system that sent the email. If the email is not \
about a specific application, set is_application to false.";

const MAX_INPUT_CHARS: usize = 6000;

#[derive(Debug, Deserialize)]
struct ExtractReply {
    #[serde(default = "default_true")]
    is_application: bool,
    company: Option<String>,
    position: Option<String>,
    applied_date: Option<String>,
    source: Option<String>,
    location: Option<String>,
    job_id: Option<String>,
    status_link: Option<String>,
    status: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

fn default_true() -> bool {
    true
}

/// Extractor backed by an LLM provider.
pub struct LlmExtractor {
    llm: Arc<dyn LlmProvider>,
}

impl LlmExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn extract(&self, message: &RawMessage) -> Result<Option<Extraction>, CapabilityError> {
        let user = format!(
            "Received: {}\n{}",
            message.received_at.format("%Y-%m-%d"),
            message.text_for_analysis(MAX_INPUT_CHARS)
        );
        let request = CompletionRequest::new(vec![
            ChatMessage::system(EXTRACT_PROMPT),
            ChatMessage::user(user),
        ])
        .with_temperature(0.0)
        .with_max_tokens(400);

        let response = self.llm.complete(request).await?;
        let reply: ExtractReply =
            parse_json_reply(&response.content).map_err(|reason| CapabilityError::InvalidOutput {
                capability: "extract",
                reason,
            })?;

        if !reply.is_application {
            return Ok(None);
        }

        // Without a stated date the message date is the application date.
        let applied_date = reply
            .applied_date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok())
            .or_else(|| Some(message.received_at.date_naive()));

        Ok(Some(Extraction {
            fields: ExtractedFields {
                company: reply.company,
                position: reply.position,
                applied_date,
                source: reply.source,
                location: reply.location,
                job_id: reply.job_id,
                status_link: reply.status_link,
                status_hint: reply.status,
            },
            confidence: reply.confidence.unwrap_or(0.5),
        }))
    }
}
