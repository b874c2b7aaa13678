//! Relevance Cache: durable per-message memo of the relevance verdict.
//!
//! Every job consults the cache before classifying, so a message seen by any
//! earlier job for the user is never sent to the classifier again. Entries are
//! never deleted; a later write for the same message replaces the earlier one.

pub mod classifier;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{CapabilityError, DatabaseError};
use crate::retry::CallPolicy;
use crate::source::RawMessage;
use crate::store::Database;

pub use classifier::{Classification, Classifier, KeywordClassifier, LlmClassifier};

/// Cached relevance verdict for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevanceCacheEntry {
    pub message_id: String,
    pub user_id: String,
    pub sender: String,
    pub recipient: String,
    pub received_at: DateTime<Utc>,
    pub snippet: String,
    pub body: String,
    pub labels: Vec<String>,
    pub is_job_related: bool,
    /// 0.00..=1.00, two decimal places.
    pub relevance_score: Decimal,
    pub processed_at: DateTime<Utc>,
}

impl RelevanceCacheEntry {
    pub fn from_message(user_id: &str, message: &RawMessage, verdict: Classification) -> Self {
        Self {
            message_id: message.id.clone(),
            user_id: user_id.to_string(),
            sender: message.sender.clone(),
            recipient: message.recipient.clone(),
            received_at: message.received_at,
            snippet: message.snippet.clone(),
            body: message.body.clone(),
            labels: message.labels.clone(),
            is_job_related: verdict.is_job_related,
            relevance_score: verdict.score,
            processed_at: Utc::now(),
        }
    }
}

/// Why a relevance decision could not be made.
#[derive(Debug, thiserror::Error)]
pub enum RelevanceError {
    /// The cache store is unreachable. Fatal for the job.
    #[error("relevance cache unavailable: {0}")]
    Store(#[from] DatabaseError),

    /// The classifier failed for this message. Recoverable per item.
    #[error("classification failed: {0}")]
    Classify(#[from] CapabilityError),
}

/// Outcome of [`RelevanceCache::resolve`].
#[derive(Debug, Clone)]
pub struct RelevanceDecision {
    pub entry: RelevanceCacheEntry,
    /// Whether the entry came from the cache rather than a fresh classification.
    pub cached: bool,
    /// Whether the message goes on to extraction.
    pub forward: bool,
}

/// Read-through cache in front of a [`Classifier`].
pub struct RelevanceCache {
    db: Arc<dyn Database>,
    classifier: Arc<dyn Classifier>,
    calls: CallPolicy,
    threshold: Decimal,
    key_locks: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

/// Message ids are only unique within one user's mailbox.
type CacheKey = (String, String);

impl RelevanceCache {
    pub fn new(
        db: Arc<dyn Database>,
        classifier: Arc<dyn Classifier>,
        calls: CallPolicy,
        threshold: Decimal,
    ) -> Self {
        Self {
            db,
            classifier,
            calls,
            threshold,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Cached entry for one of the user's messages, if any.
    pub async fn lookup(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Option<RelevanceCacheEntry>, DatabaseError> {
        self.db.get_relevance(user_id, message_id).await
    }

    /// Classify a message and persist the verdict.
    ///
    /// Holds the per-message lock for the duration, and re-checks the store
    /// under it, so concurrent callers for the same message classify once.
    pub async fn classify_and_store(
        &self,
        user_id: &str,
        message: &RawMessage,
    ) -> Result<RelevanceCacheEntry, RelevanceError> {
        let key = (user_id.to_string(), message.id.clone());
        let lock = self.key_lock(&key).await;
        let result = {
            let _guard = lock.lock().await;
            match self.db.get_relevance(user_id, &message.id).await? {
                Some(existing) => Ok(existing),
                None => self.classify_uncached(user_id, message).await,
            }
        };
        self.release_key(&key, lock).await;
        result
    }

    /// Lookup, classifying on a miss, and decide whether to forward.
    pub async fn resolve(
        &self,
        user_id: &str,
        message: &RawMessage,
    ) -> Result<RelevanceDecision, RelevanceError> {
        let (entry, cached) = match self.lookup(user_id, &message.id).await? {
            Some(entry) => (entry, true),
            None => (self.classify_and_store(user_id, message).await?, false),
        };
        let forward = self.is_forwardable(&entry);
        debug!(
            message_id = %entry.message_id,
            cached,
            is_job_related = entry.is_job_related,
            score = %entry.relevance_score,
            forward,
            "Relevance decided"
        );
        Ok(RelevanceDecision {
            entry,
            cached,
            forward,
        })
    }

    /// The boolean is authoritative; the score must also meet the threshold.
    pub fn is_forwardable(&self, entry: &RelevanceCacheEntry) -> bool {
        entry.is_job_related && entry.relevance_score >= self.threshold
    }

    async fn classify_uncached(
        &self,
        user_id: &str,
        message: &RawMessage,
    ) -> Result<RelevanceCacheEntry, RelevanceError> {
        let classifier = Arc::clone(&self.classifier);
        let verdict = self
            .calls
            .run("classify", || {
                let classifier = Arc::clone(&classifier);
                async move { classifier.classify(message).await }
            })
            .await?;

        let entry = RelevanceCacheEntry::from_message(user_id, message, verdict);
        self.db.upsert_relevance(&entry).await?;
        Ok(entry)
    }

    async fn key_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    async fn release_key(&self, key: &CacheKey, lock: Arc<Mutex<()>>) {
        let mut locks = self.key_locks.lock().await;
        drop(lock);
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }
}
