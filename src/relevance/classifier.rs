//! Classification capability: is a message about a job application?

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::Deserialize;

use crate::error::CapabilityError;
use crate::llm::json::parse_json_reply;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::source::RawMessage;

/// Classifier verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub is_job_related: bool,
    /// 0.00..=1.00, two decimal places.
    pub score: Decimal,
}

impl Classification {
    pub fn new(is_job_related: bool, score: f64) -> Self {
        Self {
            is_job_related,
            score: normalize_score(score),
        }
    }
}

/// Clamp to `[0, 1]` and round to two places. NaN becomes zero.
pub fn normalize_score(score: f64) -> Decimal {
    let clamped = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
    Decimal::from_f64(clamped)
        .unwrap_or(Decimal::ZERO)
        .round_dp(2)
}

#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn classify(&self, message: &RawMessage) -> Result<Classification, CapabilityError>;
}

// ── Keyword classifier ──────────────────────────────────────────────

/// Phrases that almost always mean an application update.
const STRONG_PHRASES: &[&str] = &[
    "thank you for applying",
    "thanks for applying",
    "application received",
    "application status",
    "your application",
    "next steps",
    "phone screen",
    "technical interview",
    "final round",
];

/// Weaker single-word signals.
const KEYWORDS: &[&str] = &[
    "application",
    "interview",
    "position",
    "role",
    "job",
    "internship",
    "hiring",
    "recruit",
    "candidate",
    "resume",
    "opportunity",
    "opening",
    "career",
    "offer",
    "rejection",
    "unfortunately",
    "congratulations",
];

/// Applicant tracking systems and job boards.
pub const JOB_DOMAINS: &[&str] = &[
    "greenhouse.io",
    "lever.co",
    "workable.com",
    "bamboohr.com",
    "ashbyhq.com",
    "eightfold.ai",
    "icims.com",
    "smartrecruiters.com",
    "workday.com",
    "myworkday.com",
    "successfactors.com",
    "taleo.net",
    "breezy.hr",
    "recruitee.com",
    "jobvite.com",
    "indeed.com",
    "linkedin.com",
    "glassdoor.com",
    "angel.co",
    "wellfound.com",
    "workatastartup.com",
];

/// Deterministic keyword + sender-domain heuristic. Needs no network.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn score(message: &RawMessage) -> Classification {
        let text = format!("{} {} {}", message.subject, message.body, message.sender).to_lowercase();
        let sender = message.sender.to_lowercase();

        let strong = STRONG_PHRASES.iter().filter(|p| text.contains(*p)).count();
        let weak = KEYWORDS.iter().filter(|k| text.contains(*k)).count();
        let domain = JOB_DOMAINS.iter().any(|d| sender.contains(d));

        let mut score = 0.35 * strong as f64 + 0.1 * weak as f64;
        if domain {
            score += 0.6;
        }
        Classification::new(strong + weak > 0 || domain, score)
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    fn name(&self) -> &'static str {
        "keyword"
    }

    async fn classify(&self, message: &RawMessage) -> Result<Classification, CapabilityError> {
        Ok(Self::score(message))
    }
}

// ── LLM classifier ──────────────────────────────────────────────────

const CLASSIFY_PROMPT: &str = "\
You decide whether an email is about one of the recipient's own job \
applications: confirmations that an application was received, interview \
invitations or scheduling, assessments, offers, rejections, or status \
updates from a company or applicant tracking system. Newsletters, job-board \
recommendations and recruiter cold outreach are NOT job-application emails.

Respond with ONLY a JSON object:
{\"is_job_related\": true|false, \"score\": <confidence 0.0-1.0>}";

const MAX_INPUT_CHARS: usize = 4000;

#[derive(Debug, Deserialize)]
struct ClassifyReply {
    is_job_related: bool,
    #[serde(default)]
    score: Option<f64>,
}

/// Classifier backed by an LLM provider.
pub struct LlmClassifier {
    llm: Arc<dyn LlmProvider>,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn classify(&self, message: &RawMessage) -> Result<Classification, CapabilityError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(CLASSIFY_PROMPT),
            ChatMessage::user(message.text_for_analysis(MAX_INPUT_CHARS)),
        ])
        .with_temperature(0.0)
        .with_max_tokens(100);

        let response = self.llm.complete(request).await?;
        let reply: ClassifyReply =
            parse_json_reply(&response.content).map_err(|reason| CapabilityError::InvalidOutput {
                capability: "classify",
                reason,
            })?;

        let score = reply
            .score
            .unwrap_or(if reply.is_job_related { 1.0 } else { 0.0 });
        Ok(Classification::new(reply.is_job_related, score))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::error::LlmError;
    use crate::llm::{CompletionResponse, FinishReason};

    fn msg(sender: &str, subject: &str, body: &str) -> RawMessage {
        RawMessage {
            id: "m1".into(),
            thread_id: None,
            sender: sender.into(),
            recipient: "me@example.com".into(),
            subject: subject.into(),
            snippet: String::new(),
            body: body.into(),
            labels: vec![],
            received_at: Utc::now(),
        }
    }

    struct ScriptedLlm(String);

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse {
                content: self.0.clone(),
                input_tokens: 0,
                output_tokens: 0,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    #[test]
    fn score_is_clamped_and_rounded() {
        assert_eq!(normalize_score(0.876), dec!(0.88));
        assert_eq!(normalize_score(3.0), dec!(1.00));
        assert_eq!(normalize_score(-1.0), dec!(0));
        assert_eq!(normalize_score(f64::NAN), dec!(0));
    }

    #[test]
    fn ats_sender_scores_high() {
        let c = KeywordClassifier::score(&msg(
            "no-reply@greenhouse.io",
            "Thank you for applying to Acme",
            "We received your application.",
        ));
        assert!(c.is_job_related);
        assert_eq!(c.score, dec!(1.00));
    }

    #[test]
    fn unrelated_mail_scores_zero() {
        let c = KeywordClassifier::score(&msg("friend@example.com", "Dinner?", "Pizza at 7"));
        assert!(!c.is_job_related);
        assert_eq!(c.score, Decimal::ZERO);
    }

    #[tokio::test]
    async fn llm_reply_is_parsed() {
        let classifier = LlmClassifier::new(Arc::new(ScriptedLlm(
            "```json\n{\"is_job_related\": true, \"score\": 0.934}\n```".into(),
        )));
        let c = classifier.classify(&msg("a@b.com", "s", "b")).await.unwrap();
        assert!(c.is_job_related);
        assert_eq!(c.score, dec!(0.93));
    }

    #[tokio::test]
    async fn llm_garbage_is_invalid_output() {
        let classifier = LlmClassifier::new(Arc::new(ScriptedLlm("I think so?".into())));
        let err = classifier.classify(&msg("a@b.com", "s", "b")).await.unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidOutput { .. }));
        assert!(!err.is_transient());
    }
}
