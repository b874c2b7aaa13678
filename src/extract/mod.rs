//! Extraction Stage: turns a relevant message into at most one candidate
//! application.
//!
//! The capability behind it ([`Extractor`]) proposes fields and a confidence;
//! the stage enforces the required fields and the confidence floor.

pub mod llm;
pub mod rules;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::debug;

use crate::error::CapabilityError;
use crate::model::CandidateApplication;
use crate::retry::CallPolicy;
use crate::source::RawMessage;

pub use llm::LlmExtractor;
pub use rules::RuleExtractor;

/// Characters of message text kept on the candidate for summarization.
const SOURCE_TEXT_CHARS: usize = 2000;

/// Fields proposed by an extraction capability. Any may be missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedFields {
    pub company: Option<String>,
    pub position: Option<String>,
    pub applied_date: Option<NaiveDate>,
    pub source: Option<String>,
    pub location: Option<String>,
    pub job_id: Option<String>,
    pub status_link: Option<String>,
    pub status_hint: Option<String>,
}

/// Capability output: fields plus how sure the extractor is (0.0..=1.0).
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub fields: ExtractedFields,
    pub confidence: f32,
}

/// Extraction capability.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` means the message holds no application.
    async fn extract(&self, message: &RawMessage) -> Result<Option<Extraction>, CapabilityError>;
}

/// Why a message produced no candidate.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("no application found in message")]
    NoCandidate,

    #[error("missing required field(s): {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("confidence {confidence:.2} below minimum {minimum:.2}")]
    LowConfidence { confidence: f32, minimum: f32 },

    #[error("extraction failed: {0}")]
    Capability(#[from] CapabilityError),
}

/// Extraction stage: capability call plus validation.
pub struct ExtractionStage {
    extractor: Arc<dyn Extractor>,
    calls: CallPolicy,
    min_confidence: f32,
}

impl ExtractionStage {
    pub fn new(extractor: Arc<dyn Extractor>, calls: CallPolicy, min_confidence: f32) -> Self {
        Self {
            extractor,
            calls,
            min_confidence,
        }
    }

    /// Extract one candidate from `message`.
    pub async fn extract(
        &self,
        message: &RawMessage,
    ) -> Result<CandidateApplication, ExtractionError> {
        let extractor = Arc::clone(&self.extractor);
        let extraction = self
            .calls
            .run("extract", || {
                let extractor = Arc::clone(&extractor);
                async move { extractor.extract(message).await }
            })
            .await?
            .ok_or(ExtractionError::NoCandidate)?;

        let candidate = self.validate(message, extraction)?;
        debug!(
            message_id = %message.id,
            company = %candidate.company,
            position = %candidate.position,
            confidence = candidate.extraction_confidence,
            "Candidate extracted"
        );
        Ok(candidate)
    }

    fn validate(
        &self,
        message: &RawMessage,
        extraction: Extraction,
    ) -> Result<CandidateApplication, ExtractionError> {
        let Extraction { fields, confidence } = extraction;

        let company = non_blank(fields.company);
        let position = non_blank(fields.position);
        let mut missing = Vec::new();
        if company.is_none() {
            missing.push("company");
        }
        if position.is_none() {
            missing.push("position");
        }
        if fields.applied_date.is_none() {
            missing.push("applied date");
        }
        let (Some(company), Some(position), Some(applied_date)) =
            (company, position, fields.applied_date)
        else {
            return Err(ExtractionError::MissingFields(missing));
        };

        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        if confidence < self.min_confidence {
            return Err(ExtractionError::LowConfidence {
                confidence,
                minimum: self.min_confidence,
            });
        }

        Ok(CandidateApplication {
            message_id: message.id.clone(),
            company,
            position,
            applied_date,
            source: non_blank(fields.source).unwrap_or_else(|| "Email".to_string()),
            location: non_blank(fields.location),
            job_id: non_blank(fields.job_id),
            status_link: non_blank(fields.status_link),
            notes: None,
            status: None,
            status_hint: non_blank(fields.status_hint),
            source_text: source_text(message),
            received_at: message.received_at,
            extraction_confidence: confidence,
            enrichment_confidence: 0.0,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Subject and body with whitespace collapsed, capped for the summarizer.
fn source_text(message: &RawMessage) -> String {
    let joined = format!("{}\n{}", message.subject, message.body);
    let collapsed = joined.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(SOURCE_TEXT_CHARS).collect()
}
