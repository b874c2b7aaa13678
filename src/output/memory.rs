//! In-memory artifact store, for dry runs and tests.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ArtifactStore, OutputRow};
use crate::error::ArtifactError;

#[derive(Default)]
struct Inner {
    artifacts: HashMap<String, Vec<OutputRow>>,
    corrupt: HashSet<String>,
    read_only: HashSet<String>,
    writes: usize,
}

/// Artifact store that keeps rows in memory.
#[derive(Default)]
pub struct MemoryArtifactStore {
    inner: Mutex<Inner>,
}

impl MemoryArtifactStore {
    /// Seed `target` with existing rows.
    pub async fn insert(&self, target: &str, rows: Vec<OutputRow>) {
        let mut inner = self.inner.lock().await;
        inner.corrupt.remove(target);
        inner.artifacts.insert(target.to_string(), rows);
    }

    /// Make reads of `target` fail as if the file were damaged.
    pub async fn corrupt(&self, target: &str) {
        self.inner.lock().await.corrupt.insert(target.to_string());
    }

    /// Make writes to `target` fail.
    pub async fn fail_writes(&self, target: &str) {
        self.inner.lock().await.read_only.insert(target.to_string());
    }

    /// Current rows of `target`, if it exists.
    pub async fn rows(&self, target: &str) -> Option<Vec<OutputRow>> {
        self.inner.lock().await.artifacts.get(target).cloned()
    }

    /// Number of successful writes so far.
    pub async fn write_count(&self) -> usize {
        self.inner.lock().await.writes
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn read(&self, target: &str) -> Result<Option<Vec<OutputRow>>, ArtifactError> {
        let inner = self.inner.lock().await;
        if inner.corrupt.contains(target) {
            return Err(ArtifactError::Corrupt {
                path: target.to_string(),
                reason: "unreadable".into(),
            });
        }
        Ok(inner.artifacts.get(target).cloned())
    }

    async fn write(&self, target: &str, rows: &[OutputRow]) -> Result<(), ArtifactError> {
        let mut inner = self.inner.lock().await;
        if inner.read_only.contains(target) {
            return Err(ArtifactError::WriteFailed {
                path: target.to_string(),
                reason: "target is read-only".into(),
            });
        }
        inner.corrupt.remove(target);
        inner.artifacts.insert(target.to_string(), rows.to_vec());
        inner.writes += 1;
        Ok(())
    }
}
