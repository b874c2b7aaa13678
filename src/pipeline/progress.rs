//! Progress publishing.
//!
//! The orchestrator calls [`ProgressPublisher::publish`] synchronously at every
//! checkpoint; delivery is the publisher's business. Snapshots for one job are
//! published from a single task, so they arrive in non-decreasing order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{info, warn};
use uuid::Uuid;

use crate::pipeline::job::ProcessingJob;
use crate::pipeline::state::JobStage;

/// Point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: Uuid,
    pub user_id: String,
    pub stage: JobStage,
    pub progress: u8,
    pub found: u32,
    pub processed: u32,
    pub error_count: usize,
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&ProcessingJob> for ProgressSnapshot {
    fn from(job: &ProcessingJob) -> Self {
        Self {
            job_id: job.id,
            user_id: job.user_id.clone(),
            stage: job.stage,
            progress: job.progress,
            found: job.found,
            processed: job.processed,
            error_count: job.errors.len(),
            message: job.message.clone(),
            updated_at: job.updated_at,
        }
    }
}

/// Fire-and-forget progress sink.
pub trait ProgressPublisher: Send + Sync {
    fn publish(&self, snapshot: &ProgressSnapshot);
}

/// Logs every snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPublisher;

impl ProgressPublisher for TracingPublisher {
    fn publish(&self, snapshot: &ProgressSnapshot) {
        info!(
            job_id = %snapshot.job_id,
            stage = %snapshot.stage,
            progress = snapshot.progress,
            found = snapshot.found,
            processed = snapshot.processed,
            errors = snapshot.error_count,
            "Job progress"
        );
    }
}

/// Fans snapshots out to any number of subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<ProgressSnapshot>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    /// Snapshots for one job. A subscriber that falls behind skips ahead.
    pub fn job_stream(&self, job_id: Uuid) -> impl Stream<Item = ProgressSnapshot> + use<> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |result| match result {
            Ok(snapshot) if snapshot.job_id == job_id => Some(snapshot),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                warn!(job_id = %job_id, missed = n, "Progress subscriber lagged behind");
                None
            }
        })
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ProgressPublisher for BroadcastPublisher {
    fn publish(&self, snapshot: &ProgressSnapshot) {
        // No subscribers is fine.
        let _ = self.tx.send(snapshot.clone());
    }
}

/// Publishes to several sinks in order.
#[derive(Default, Clone)]
pub struct FanoutPublisher {
    sinks: Vec<Arc<dyn ProgressPublisher>>,
}

impl FanoutPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ProgressPublisher>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ProgressPublisher for FanoutPublisher {
    fn publish(&self, snapshot: &ProgressSnapshot) {
        for sink in &self.sinks {
            sink.publish(snapshot);
        }
    }
}
