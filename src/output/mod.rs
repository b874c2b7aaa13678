//! Merge/Output Stage: reconciles new candidates with the existing artifact.
//!
//! Rows are keyed by normalized `(company, position, applied date)`; a new
//! row with a matching key replaces the old one. The final row order depends
//! only on row contents, never on processing order.

pub mod memory;
pub mod xlsx;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ArtifactError;
use crate::model::{Application, ApplicationStatus, CandidateApplication, MergeMode};

pub use memory::MemoryArtifactStore;
pub use xlsx::XlsxArtifactStore;

/// Artifact column headers, in order.
pub const COLUMNS: [&str; 10] = [
    "Company",
    "Position",
    "Applied Date",
    "Status",
    "Source",
    "Location",
    "Job ID",
    "Status Link",
    "Notes",
    "Message ID",
];

/// One artifact row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRow {
    pub company: String,
    pub position: String,
    pub applied_date: NaiveDate,
    pub status: ApplicationStatus,
    pub source: String,
    pub location: String,
    pub job_id: String,
    pub status_link: String,
    pub notes: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RowKey {
    company: String,
    position: String,
    applied_date: NaiveDate,
    message_id: Option<String>,
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

impl OutputRow {
    pub fn from_candidate(candidate: &CandidateApplication) -> Self {
        Self {
            company: candidate.company.clone(),
            position: candidate.position.clone(),
            applied_date: candidate.applied_date,
            status: candidate.status.unwrap_or(ApplicationStatus::Applied),
            source: candidate.source.clone(),
            location: candidate.location.clone().unwrap_or_default(),
            job_id: candidate.job_id.clone().unwrap_or_default(),
            status_link: candidate.status_link.clone().unwrap_or_default(),
            notes: candidate.notes.clone().unwrap_or_default(),
            message_id: candidate.message_id.clone(),
        }
    }

    /// Cell values in [`COLUMNS`] order.
    pub fn cells(&self) -> [String; 10] {
        [
            self.company.clone(),
            self.position.clone(),
            self.applied_date.format("%Y-%m-%d").to_string(),
            self.status.to_string(),
            self.source.clone(),
            self.location.clone(),
            self.job_id.clone(),
            self.status_link.clone(),
            self.notes.clone(),
            self.message_id.clone(),
        ]
    }

    /// Durable application record for this row.
    pub fn to_application(&self, user_id: &str, now: DateTime<Utc>) -> Application {
        let opt = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Application {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            company: self.company.clone(),
            position: self.position.clone(),
            applied_date: self.applied_date,
            status: self.status,
            source: self.source.clone(),
            location: opt(&self.location),
            job_id: opt(&self.job_id),
            status_link: opt(&self.status_link),
            notes: opt(&self.notes),
            message_id: self.message_id.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    fn key(&self, allow_duplicates: bool) -> RowKey {
        RowKey {
            company: normalize(&self.company),
            position: normalize(&self.position),
            applied_date: self.applied_date,
            message_id: allow_duplicates.then(|| self.message_id.clone()),
        }
    }

    fn sort_key(&self) -> (NaiveDate, String, String, String, String, String) {
        (
            self.applied_date,
            normalize(&self.company),
            normalize(&self.position),
            self.company.clone(),
            self.position.clone(),
            self.message_id.clone(),
        )
    }
}

/// Result of [`merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub rows: Vec<OutputRow>,
    /// New keys added to the artifact.
    pub inserted: usize,
    /// Existing rows replaced by a newer one.
    pub updated: usize,
}

/// Merge `new` rows into `existing`.
///
/// `new` is in arrival order: when two new rows share a key the later one
/// wins. In [`MergeMode::Overwrite`] the existing rows are ignored. With
/// `allow_duplicates`, rows from different messages never collide.
pub fn merge(
    existing: Vec<OutputRow>,
    new: Vec<OutputRow>,
    mode: MergeMode,
    allow_duplicates: bool,
) -> MergeOutcome {
    let mut slots: HashMap<RowKey, usize> = HashMap::new();
    let mut rows: Vec<OutputRow> = Vec::new();

    if mode == MergeMode::Append {
        for row in existing {
            let key = row.key(allow_duplicates);
            match slots.get(&key) {
                // Duplicate keys already in the artifact collapse to the last one.
                Some(&idx) => rows[idx] = row,
                None => {
                    slots.insert(key, rows.len());
                    rows.push(row);
                }
            }
        }
    }
    let preexisting = rows.len();

    let mut inserted = 0;
    let mut updated = 0;
    let mut touched = vec![false; preexisting];
    for row in new {
        let key = row.key(allow_duplicates);
        match slots.get(&key) {
            Some(&idx) => {
                if idx < preexisting && !touched[idx] {
                    touched[idx] = true;
                    updated += 1;
                }
                rows[idx] = row;
            }
            None => {
                slots.insert(key, rows.len());
                rows.push(row);
                inserted += 1;
            }
        }
    }

    rows.sort_by_cached_key(OutputRow::sort_key);
    MergeOutcome {
        rows,
        inserted,
        updated,
    }
}

/// Where artifacts live.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Existing rows, or `None` when the artifact does not exist yet.
    async fn read(&self, target: &str) -> Result<Option<Vec<OutputRow>>, ArtifactError>;

    /// Replace the artifact with `rows`. Either fully succeeds or leaves the
    /// previous artifact in place.
    async fn write(&self, target: &str, rows: &[OutputRow]) -> Result<(), ArtifactError>;
}

/// Outcome of [`OutputStage::write`].
#[derive(Debug, Clone)]
pub struct OutputReport {
    pub merge: MergeOutcome,
    /// Set when an unreadable existing artifact was treated as empty.
    pub recovered: Option<String>,
}

/// Single-writer merge stage in front of an [`ArtifactStore`].
pub struct OutputStage {
    store: Arc<dyn ArtifactStore>,
    allow_duplicates: bool,
    target_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl OutputStage {
    pub fn new(store: Arc<dyn ArtifactStore>, allow_duplicates: bool) -> Self {
        Self {
            store,
            allow_duplicates,
            target_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Read, merge and write `target` while holding its lock.
    ///
    /// A missing artifact is a fresh target. A corrupt one is reported in
    /// [`OutputReport::recovered`] and treated as empty. Write failures are
    /// returned as errors.
    pub async fn write(
        &self,
        target: &str,
        new_rows: Vec<OutputRow>,
        mode: MergeMode,
    ) -> Result<OutputReport, ArtifactError> {
        let lock = {
            let mut locks = self.target_locks.lock().await;
            Arc::clone(locks.entry(target.to_string()).or_default())
        };
        let result = {
            let _guard = lock.lock().await;
            self.merge_and_write(target, new_rows, mode).await
        };
        self.release_target(target, lock).await;
        result
    }

    /// Whether rows sharing a key but not a source message are all kept.
    pub fn allow_duplicates(&self) -> bool {
        self.allow_duplicates
    }

    async fn merge_and_write(
        &self,
        target: &str,
        new_rows: Vec<OutputRow>,
        mode: MergeMode,
    ) -> Result<OutputReport, ArtifactError> {
        let mut recovered = None;
        let existing = match mode {
            MergeMode::Overwrite => Vec::new(),
            MergeMode::Append => match self.store.read(target).await {
                Ok(Some(rows)) => rows,
                Ok(None) => Vec::new(),
                Err(e) => {
                    warn!(output_target = target, error = %e, "Existing artifact unreadable, starting empty");
                    recovered = Some(format!("existing artifact ignored: {e}"));
                    Vec::new()
                }
            },
        };

        let outcome = merge(existing, new_rows, mode, self.allow_duplicates);
        self.store.write(target, &outcome.rows).await?;
        info!(
            output_target = target,
            rows = outcome.rows.len(),
            inserted = outcome.inserted,
            updated = outcome.updated,
            "Artifact written"
        );

        Ok(OutputReport {
            merge: outcome,
            recovered,
        })
    }

    async fn release_target(&self, target: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.target_locks.lock().await;
        drop(lock);
        if locks.get(target).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::testing::candidate;

    fn row(company: &str, position: &str, day: u32, notes: &str, message_id: &str) -> OutputRow {
        let mut c = candidate(message_id, company, position, day);
        c.notes = Some(notes.into());
        OutputRow::from_candidate(&c)
    }

    #[test]
    fn append_replaces_matching_key_with_newer_row() {
        let existing = vec![row("Acme", "SWE Intern", 23, "old summary", "m-old")];
        let new = vec![row("ACME ", "swe intern", 23, "new summary", "m-new")];

        let outcome = merge(existing, new, MergeMode::Append, false);
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0].notes, "new summary");
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.inserted, 0);
    }

    #[test]
    fn overwrite_ignores_existing() {
        let existing = vec![row("Initech", "Analyst", 1, "", "m1")];
        let new = vec![row("Acme", "SWE Intern", 23, "", "m2")];
        let outcome = merge(existing, new, MergeMode::Overwrite, false);
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0].company, "Acme");
        assert_eq!(outcome.inserted, 1);
    }

    #[test]
    fn rows_sorted_by_date_company_position() {
        let new = vec![
            row("Zeta", "B", 5, "", "m1"),
            row("Acme", "B", 5, "", "m2"),
            row("Acme", "A", 5, "", "m3"),
            row("Zeta", "A", 2, "", "m4"),
        ];
        let outcome = merge(Vec::new(), new, MergeMode::Overwrite, false);
        let order: Vec<_> = outcome.rows.iter().map(|r| r.message_id.as_str()).collect();
        assert_eq!(order, vec!["m4", "m3", "m2", "m1"]);
    }

    #[test]
    fn merge_is_idempotent() {
        let new = vec![
            row("Acme", "SWE Intern", 23, "s1", "m1"),
            row("Initech", "Analyst", 2, "s2", "m2"),
        ];
        let first = merge(Vec::new(), new.clone(), MergeMode::Append, false);
        let second = merge(first.rows.clone(), new, MergeMode::Append, false);
        assert_eq!(first.rows, second.rows);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 2);
    }

    #[test]
    fn later_row_in_batch_wins_and_counts_once() {
        let new = vec![
            row("Acme", "SWE Intern", 23, "first", "m1"),
            row("Acme", "SWE Intern", 23, "second", "m2"),
        ];
        let outcome = merge(Vec::new(), new, MergeMode::Append, false);
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0].notes, "second");
        assert_eq!(outcome.inserted, 1);
    }

    #[test]
    fn duplicates_allowed_keeps_distinct_messages() {
        let existing = vec![row("Acme", "SWE Intern", 23, "a", "m1")];
        let new = vec![
            row("Acme", "SWE Intern", 23, "b", "m2"),
            row("Acme", "SWE Intern", 23, "a2", "m1"),
        ];
        let outcome = merge(existing, new, MergeMode::Append, true);
        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.updated, 1);
    }

    #[tokio::test]
    async fn corrupt_existing_is_recovered_as_empty() {
        let store = Arc::new(MemoryArtifactStore::default());
        store.corrupt("apps.xlsx").await;
        let stage = OutputStage::new(store.clone(), false);

        let report = stage
            .write(
                "apps.xlsx",
                vec![row("Acme", "SWE Intern", 23, "s", "m1")],
                MergeMode::Append,
            )
            .await
            .unwrap();
        assert!(report.recovered.is_some());
        assert_eq!(report.merge.rows.len(), 1);
        assert_eq!(store.rows("apps.xlsx").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_existing_is_not_an_error() {
        let store = Arc::new(MemoryArtifactStore::default());
        let stage = OutputStage::new(store, false);
        let report = stage
            .write("new.xlsx", vec![row("Acme", "SWE", 1, "", "m1")], MergeMode::Append)
            .await
            .unwrap();
        assert!(report.recovered.is_none());
    }

    #[tokio::test]
    async fn write_failure_is_an_error() {
        let store = Arc::new(MemoryArtifactStore::default());
        store.fail_writes("locked.xlsx").await;
        let stage = OutputStage::new(store, false);
        let err = stage
            .write("locked.xlsx", vec![], MergeMode::Overwrite)
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::WriteFailed { .. }));
        assert!(stage.target_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn target_locks_are_released_after_writes() {
        let store = Arc::new(MemoryArtifactStore::default());
        let stage = Arc::new(OutputStage::new(store.clone(), false));

        let (a, b) = tokio::join!(
            stage.write("a.xlsx", vec![row("Acme", "SWE", 1, "", "m1")], MergeMode::Append),
            stage.write("a.xlsx", vec![row("Initech", "Analyst", 2, "", "m2")], MergeMode::Append),
        );
        assert!(a.is_ok() && b.is_ok());
        stage
            .write("b.xlsx", vec![row("Acme", "SWE", 1, "", "m1")], MergeMode::Overwrite)
            .await
            .unwrap();

        assert!(stage.target_locks.lock().await.is_empty());
        assert_eq!(store.rows("a.xlsx").await.unwrap().len(), 2);
    }
}
