//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::ConfigError;
use crate::llm::LlmConfig;
use crate::retry::RetryPolicy;
use crate::source::imap::ImapConfig;

/// Pipeline tuning knobs. Injected into the stages; nothing here is global.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Minimum relevance score for a job-related message to reach extraction.
    pub relevance_threshold: Decimal,
    /// Candidates below this extraction confidence are discarded.
    pub min_extraction_confidence: f32,
    /// Bounded worker pool size for per-message work.
    pub worker_concurrency: usize,
    /// Timeout applied to each external call attempt.
    pub call_timeout: Duration,
    /// Backoff policy for transient failures.
    pub retry: RetryPolicy,
    /// Process-wide mail provider budget (requests per second).
    pub mail_rate_per_sec: u32,
    /// Process-wide AI capability budget (requests per second).
    pub ai_rate_per_sec: u32,
    /// Keep rows sharing (company, position, date) when their messages differ.
    pub allow_duplicates: bool,
    /// Word cap for enrichment summaries.
    pub summary_max_words: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            relevance_threshold: dec!(0.50),
            min_extraction_confidence: 0.4,
            worker_concurrency: 4,
            call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            mail_rate_per_sec: 10,
            ai_rate_per_sec: 5,
            allow_duplicates: false,
            summary_max_words: 30,
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `JOBTRACKER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let retry = RetryPolicy {
            max_attempts: env_or("JOBTRACKER_RETRY_ATTEMPTS", d.retry.max_attempts)?,
            base_delay: Duration::from_millis(env_or(
                "JOBTRACKER_RETRY_BASE_MS",
                d.retry.base_delay.as_millis() as u64,
            )?),
            max_delay: d.retry.max_delay,
        };

        let config = Self {
            relevance_threshold: env_or("JOBTRACKER_RELEVANCE_THRESHOLD", d.relevance_threshold)?,
            min_extraction_confidence: env_or(
                "JOBTRACKER_MIN_CONFIDENCE",
                d.min_extraction_confidence,
            )?,
            worker_concurrency: env_or("JOBTRACKER_CONCURRENCY", d.worker_concurrency)?,
            call_timeout: Duration::from_secs(env_or(
                "JOBTRACKER_CALL_TIMEOUT_SECS",
                d.call_timeout.as_secs(),
            )?),
            retry,
            mail_rate_per_sec: env_or("JOBTRACKER_MAIL_RATE", d.mail_rate_per_sec)?,
            ai_rate_per_sec: env_or("JOBTRACKER_AI_RATE", d.ai_rate_per_sec)?,
            allow_duplicates: env_or("JOBTRACKER_ALLOW_DUPLICATES", d.allow_duplicates)?,
            summary_max_words: d.summary_max_words,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relevance_threshold < Decimal::ZERO || self.relevance_threshold > Decimal::ONE {
            return Err(ConfigError::InvalidValue {
                key: "relevance_threshold".into(),
                message: "must be within 0.0..=1.0".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.min_extraction_confidence) {
            return Err(ConfigError::InvalidValue {
                key: "min_extraction_confidence".into(),
                message: "must be within 0.0..=1.0".into(),
            });
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "worker_concurrency".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.mail_rate_per_sec == 0 || self.ai_rate_per_sec == 0 {
            return Err(ConfigError::InvalidValue {
                key: "rate_per_sec".into(),
                message: "rate budgets must be at least 1 per second".into(),
            });
        }
        Ok(())
    }
}

/// Everything the binary needs to wire the pipeline together.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    /// `None` means the keyword/rule capabilities are used instead of an LLM.
    pub llm: Option<LlmConfig>,
    pub imap: Option<ImapConfig>,
    pub log_dir: Option<PathBuf>,
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("JOBTRACKER_DB_PATH")
            .unwrap_or_else(|_| "./data/jobtracker.db".to_string())
            .into();
        Ok(Self {
            db_path,
            llm: LlmConfig::from_env()?,
            imap: ImapConfig::from_env(),
            log_dir: std::env::var("JOBTRACKER_LOG_DIR").ok().map(PathBuf::from),
            pipeline: PipelineConfig::from_env()?,
        })
    }
}

/// Parse an environment variable, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.summary_max_words, 30);
        assert_eq!(config.relevance_threshold, dec!(0.5));
    }

    #[test]
    fn zero_concurrency_rejected() {
        let config = PipelineConfig {
            worker_concurrency: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let config = PipelineConfig {
            relevance_threshold: dec!(1.5),
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_or_uses_default_when_unset() {
        let v: u32 = env_or("JOBTRACKER_TEST_DEFINITELY_UNSET_KEY", 7).unwrap();
        assert_eq!(v, 7);
    }
}
