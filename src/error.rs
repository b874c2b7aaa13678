//! Error types for the job tracker.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mail provider errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("Mail provider {provider} rate limited")]
    RateLimited { provider: String },

    #[error("Message {id} not found")]
    NotFound { id: String },

    #[error("Transient network error from {provider}: {reason}")]
    Network { provider: String, reason: String },

    #[error("Mail provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Mail provider {provider} rejected the request: {reason}")]
    Rejected { provider: String, reason: String },

    #[error("Malformed message {id}: {reason}")]
    Malformed { id: String, reason: String },
}

impl SourceError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Network { .. } | Self::Timeout(_)
        )
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RequestFailed { .. } | Self::RateLimited { .. })
    }
}

/// Errors from the classification / extraction / enrichment capabilities.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("{capability} call timed out after {timeout:?}")]
    Timeout {
        capability: &'static str,
        timeout: Duration,
    },

    #[error("LLM backend failed: {0}")]
    Llm(#[from] LlmError),

    #[error("{capability} returned an unusable response: {reason}")]
    InvalidOutput {
        capability: &'static str,
        reason: String,
    },
}

impl CapabilityError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Llm(e) => e.is_transient(),
            Self::InvalidOutput { .. } => false,
        }
    }
}

/// Output artifact errors.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Artifact {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("Artifact {path} could not be written: {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} already in stage {stage}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        stage: String,
        target: String,
    },

    #[error("Job {existing} is already in progress for output {output_target}")]
    AlreadyRunning {
        existing: Uuid,
        output_target: String,
    },

    #[error("Invalid job request: {0}")]
    InvalidRequest(String),

    #[error("Job {id} is terminal and can no longer be modified")]
    Immutable { id: Uuid },

    #[error("Job {id} failed: {reason}")]
    Failed { id: Uuid, reason: String },

    #[error("Job store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
