//! libSQL backend, the async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{Application, ApplicationStatus, MergeMode};
use crate::pipeline::job::ProcessingJob;
use crate::pipeline::state::JobStage;
use crate::relevance::RelevanceCacheEntry;
use crate::store::migrations;
use crate::store::traits::{Database, UpsertOutcome};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    // Keeps the database alive for the connection's lifetime.
    _db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            _db: Arc::new(db),
            conn,
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_jobs(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<ProcessingJob>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_date(s: &str) -> Result<NaiveDate, DatabaseError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| DatabaseError::Serialization(format!("bad date '{s}': {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Normalized key used for case-insensitive uniqueness.
fn match_key(s: &str) -> String {
    s.trim().to_lowercase()
}

const JOB_COLUMNS: &str = "id, user_id, start_date, end_date, range_start, range_end, \
     output_target, merge_mode, stage, progress, found, processed, errors, message, \
     created_at, updated_at, completed_at";

fn row_to_job(row: &libsql::Row) -> Result<ProcessingJob, DatabaseError> {
    let get = |e: libsql::Error| DatabaseError::Query(format!("job row parse: {e}"));

    let id_str: String = row.get(0).map_err(get)?;
    let start_str: String = row.get(2).map_err(get)?;
    let end_str: Option<String> = row.get(3).ok();
    let range_start: String = row.get(4).map_err(get)?;
    let range_end: String = row.get(5).map_err(get)?;
    let mode_str: String = row.get(7).map_err(get)?;
    let stage_str: String = row.get(8).map_err(get)?;
    let progress: i64 = row.get(9).map_err(get)?;
    let found: i64 = row.get(10).map_err(get)?;
    let processed: i64 = row.get(11).map_err(get)?;
    let errors_str: String = row.get(12).map_err(get)?;
    let created_str: String = row.get(14).map_err(get)?;
    let updated_str: String = row.get(15).map_err(get)?;
    let completed_str: Option<String> = row.get(16).ok();

    Ok(ProcessingJob {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("bad job id: {e}")))?,
        user_id: row.get(1).map_err(get)?,
        start_date: parse_date(&start_str)?,
        end_date: end_str.as_deref().map(parse_date).transpose()?,
        range_start: parse_datetime(&range_start),
        range_end: parse_datetime(&range_end),
        output_target: row.get(6).map_err(get)?,
        merge_mode: MergeMode::from_str(&mode_str).map_err(DatabaseError::Serialization)?,
        stage: JobStage::from_str(&stage_str).map_err(DatabaseError::Serialization)?,
        progress: u8::try_from(progress.clamp(0, 100)).unwrap_or(0),
        found: u32::try_from(found).unwrap_or(0),
        processed: u32::try_from(processed).unwrap_or(0),
        errors: serde_json::from_str(&errors_str)
            .map_err(|e| DatabaseError::Serialization(format!("job errors: {e}")))?,
        message: row.get(13).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        completed_at: parse_optional_datetime(&completed_str),
    })
}

const RELEVANCE_COLUMNS: &str = "message_id, user_id, sender, recipient, received_at, \
     snippet, body, labels, is_job_related, relevance_score, processed_at";

fn row_to_relevance(row: &libsql::Row) -> Result<RelevanceCacheEntry, DatabaseError> {
    let get = |e: libsql::Error| DatabaseError::Query(format!("relevance row parse: {e}"));

    let received_str: String = row.get(4).map_err(get)?;
    let labels_str: String = row.get(7).map_err(get)?;
    let related: i64 = row.get(8).map_err(get)?;
    let score_str: String = row.get(9).map_err(get)?;
    let processed_str: String = row.get(10).map_err(get)?;

    Ok(RelevanceCacheEntry {
        message_id: row.get(0).map_err(get)?,
        user_id: row.get(1).map_err(get)?,
        sender: row.get(2).map_err(get)?,
        recipient: row.get(3).map_err(get)?,
        received_at: parse_datetime(&received_str),
        snippet: row.get(5).map_err(get)?,
        body: row.get(6).map_err(get)?,
        labels: serde_json::from_str(&labels_str).unwrap_or_default(),
        is_job_related: related != 0,
        relevance_score: Decimal::from_str(&score_str)
            .map_err(|e| DatabaseError::Serialization(format!("relevance score: {e}")))?,
        processed_at: parse_datetime(&processed_str),
    })
}

const APPLICATION_COLUMNS: &str = "id, user_id, company, position, applied_date, status, \
     source, location, job_id, status_link, notes, message_id, created_at, updated_at";

fn row_to_application(row: &libsql::Row) -> Result<Application, DatabaseError> {
    let get = |e: libsql::Error| DatabaseError::Query(format!("application row parse: {e}"));

    let id_str: String = row.get(0).map_err(get)?;
    let date_str: String = row.get(4).map_err(get)?;
    let status_str: String = row.get(5).map_err(get)?;
    let created_str: String = row.get(12).map_err(get)?;
    let updated_str: String = row.get(13).map_err(get)?;

    Ok(Application {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("bad application id: {e}")))?,
        user_id: row.get(1).map_err(get)?,
        company: row.get(2).map_err(get)?,
        position: row.get(3).map_err(get)?,
        applied_date: parse_date(&date_str)?,
        status: ApplicationStatus::parse_exact(&status_str).unwrap_or(ApplicationStatus::Applied),
        source: row.get(6).map_err(get)?,
        location: row.get(7).ok(),
        job_id: row.get(8).ok(),
        status_link: row.get(9).ok(),
        notes: row.get(10).ok(),
        message_id: row.get(11).map_err(get)?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &ProcessingJob) -> Result<(), DatabaseError> {
        let errors = serde_json::to_string(&job.errors)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let end_date = job.end_date.map(|d| d.to_string());
        let completed_at = job.completed_at.map(|d| d.to_rfc3339());

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                params![
                    job.id.to_string(),
                    job.user_id.clone(),
                    job.start_date.to_string(),
                    opt_text(end_date.as_deref()),
                    job.range_start.to_rfc3339(),
                    job.range_end.to_rfc3339(),
                    job.output_target.clone(),
                    job.merge_mode.as_str(),
                    job.stage.as_str(),
                    i64::from(job.progress),
                    i64::from(job.found),
                    i64::from(job.processed),
                    errors,
                    opt_text(job.message.as_deref()),
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                    opt_text(completed_at.as_deref()),
                ],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE constraint failed") {
                    DatabaseError::Constraint(format!("insert_job: {msg}"))
                } else {
                    DatabaseError::Query(format!("insert_job: {msg}"))
                }
            })?;
        Ok(())
    }

    async fn update_job(&self, job: &ProcessingJob) -> Result<(), DatabaseError> {
        let errors = serde_json::to_string(&job.errors)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let completed_at = job.completed_at.map(|d| d.to_rfc3339());

        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET stage = ?1, progress = ?2, found = ?3, processed = ?4, \
                 errors = ?5, message = ?6, updated_at = ?7, completed_at = ?8 \
                 WHERE id = ?9",
                params![
                    job.stage.as_str(),
                    i64::from(job.progress),
                    i64::from(job.found),
                    i64::from(job.processed),
                    errors,
                    opt_text(job.message.as_deref()),
                    job.updated_at.to_rfc3339(),
                    opt_text(completed_at.as_deref()),
                    job.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_job: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "job".into(),
                id: job.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ProcessingJob>, DatabaseError> {
        let jobs = self
            .query_jobs(
                "get_job",
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(jobs.into_iter().next())
    }

    async fn list_jobs(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ProcessingJob>, DatabaseError> {
        self.query_jobs(
            "list_jobs",
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE user_id = ?1 \
                 ORDER BY created_at DESC LIMIT ?2"
            ),
            params![user_id, i64::try_from(limit).unwrap_or(i64::MAX)],
        )
        .await
    }

    async fn find_active_job(
        &self,
        user_id: &str,
        output_target: &str,
    ) -> Result<Option<ProcessingJob>, DatabaseError> {
        let jobs = self
            .query_jobs(
                "find_active_job",
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE user_id = ?1 AND output_target = ?2 \
                     AND stage NOT IN ('completed', 'error') LIMIT 1"
                ),
                params![user_id, output_target],
            )
            .await?;
        Ok(jobs.into_iter().next())
    }

    async fn list_active_jobs(&self) -> Result<Vec<ProcessingJob>, DatabaseError> {
        self.query_jobs(
            "list_active_jobs",
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs \
                 WHERE stage NOT IN ('completed', 'error') ORDER BY created_at"
            ),
            (),
        )
        .await
    }

    // ── Relevance cache ─────────────────────────────────────────────

    async fn get_relevance(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Option<RelevanceCacheEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RELEVANCE_COLUMNS} FROM relevance_cache \
                     WHERE user_id = ?1 AND message_id = ?2"
                ),
                params![user_id, message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_relevance: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_relevance(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_relevance: {e}"))),
        }
    }

    async fn upsert_relevance(&self, entry: &RelevanceCacheEntry) -> Result<(), DatabaseError> {
        let labels = serde_json::to_string(&entry.labels)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO relevance_cache ({RELEVANCE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                     ON CONFLICT(user_id, message_id) DO UPDATE SET \
                         sender = excluded.sender, \
                         recipient = excluded.recipient, \
                         received_at = excluded.received_at, \
                         snippet = excluded.snippet, \
                         body = excluded.body, \
                         labels = excluded.labels, \
                         is_job_related = excluded.is_job_related, \
                         relevance_score = excluded.relevance_score, \
                         processed_at = excluded.processed_at"
                ),
                params![
                    entry.message_id.clone(),
                    entry.user_id.clone(),
                    entry.sender.clone(),
                    entry.recipient.clone(),
                    entry.received_at.to_rfc3339(),
                    entry.snippet.clone(),
                    entry.body.clone(),
                    labels,
                    i64::from(entry.is_job_related),
                    entry.relevance_score.round_dp(2).to_string(),
                    entry.processed_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_relevance: {e}")))?;
        Ok(())
    }

    async fn count_relevance(&self, user_id: &str) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM relevance_cache WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_relevance: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let n: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count_relevance: {e}")))?;
                Ok(u64::try_from(n).unwrap_or(0))
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_relevance: {e}"))),
        }
    }

    // ── Applications ────────────────────────────────────────────────

    async fn upsert_application(
        &self,
        app: &Application,
        per_message: bool,
    ) -> Result<UpsertOutcome, DatabaseError> {
        let conn = self.conn();
        let company_key = match_key(&app.company);
        let position_key = match_key(&app.position);
        // Empty unless duplicates are kept, so a newer message replaces the row.
        let message_key = if per_message {
            match_key(&app.message_id)
        } else {
            String::new()
        };
        let applied = app.applied_date.to_string();

        let mut rows = conn
            .query(
                "SELECT id FROM applications WHERE user_id = ?1 AND company_key = ?2 \
                 AND position_key = ?3 AND applied_date = ?4 AND message_key = ?5",
                params![
                    app.user_id.clone(),
                    company_key.clone(),
                    position_key.clone(),
                    applied.clone(),
                    message_key.clone()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_application: {e}")))?;
        let existed = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_application: {e}")))?
            .is_some();

        conn.execute(
            &format!(
                "INSERT INTO applications ({APPLICATION_COLUMNS}, company_key, position_key, message_key) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17) \
                 ON CONFLICT(user_id, company_key, position_key, applied_date, message_key) DO UPDATE SET \
                     company = excluded.company, \
                     position = excluded.position, \
                     status = excluded.status, \
                     source = excluded.source, \
                     location = excluded.location, \
                     job_id = excluded.job_id, \
                     status_link = excluded.status_link, \
                     notes = excluded.notes, \
                     message_id = excluded.message_id, \
                     updated_at = excluded.updated_at"
            ),
            params![
                app.id.to_string(),
                app.user_id.clone(),
                app.company.clone(),
                app.position.clone(),
                applied,
                app.status.as_str(),
                app.source.clone(),
                opt_text(app.location.as_deref()),
                opt_text(app.job_id.as_deref()),
                opt_text(app.status_link.as_deref()),
                opt_text(app.notes.as_deref()),
                app.message_id.clone(),
                app.created_at.to_rfc3339(),
                app.updated_at.to_rfc3339(),
                company_key,
                position_key,
                message_key,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_application: {e}")))?;

        Ok(if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    async fn list_applications(&self, user_id: &str) -> Result<Vec<Application>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {APPLICATION_COLUMNS} FROM applications WHERE user_id = ?1 \
                     ORDER BY applied_date, company_key, position_key, message_key"
                ),
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_applications: {e}")))?;

        let mut apps = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_applications: {e}")))?
        {
            apps.push(row_to_application(&row)?);
        }
        Ok(apps)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::model::JobRequest;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_job(user: &str, target: &str) -> ProcessingJob {
        let request = JobRequest {
            user_id: user.into(),
            start_date: NaiveDate::from_ymd_opt(2025, 8, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2025, 9, 1),
            output_target: target.into(),
            merge_mode: MergeMode::Append,
        };
        let now = Utc::now();
        let range = request.resolve_range(now).unwrap();
        ProcessingJob::new(&request, range, now)
    }

    fn make_app(message_id: &str, notes: &str) -> Application {
        let now = Utc::now();
        Application {
            id: Uuid::new_v4(),
            user_id: "alice".into(),
            company: "Acme".into(),
            position: "SWE Intern".into(),
            applied_date: NaiveDate::from_ymd_opt(2025, 8, 23).unwrap(),
            status: ApplicationStatus::Applied,
            source: "Greenhouse".into(),
            location: None,
            job_id: Some("R-1".into()),
            status_link: None,
            notes: Some(notes.into()),
            message_id: message_id.into(),
            created_at: now,
            updated_at: now,
        }
    }

    // ── Job tests ───────────────────────────────────────────────────

    #[tokio::test]
    async fn job_round_trip() {
        let db = test_db().await;
        let mut job = make_job("alice", "apps.xlsx");
        db.insert_job(&job).await.unwrap();

        job.transition_to(JobStage::FindingEmails).unwrap();
        job.add_found(3).unwrap();
        job.record_error("m2: extraction failed").unwrap();
        db.update_job(&job).await.unwrap();

        let fetched = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.stage, JobStage::FindingEmails);
        assert_eq!(fetched.found, 3);
        assert_eq!(fetched.errors, vec!["m2: extraction failed".to_string()]);
        assert_eq!(fetched.end_date, job.end_date);
        assert_eq!(fetched.merge_mode, MergeMode::Append);
    }

    #[tokio::test]
    async fn second_active_job_for_target_is_rejected() {
        let db = test_db().await;
        db.insert_job(&make_job("alice", "apps.xlsx")).await.unwrap();

        let err = db.insert_job(&make_job("alice", "apps.xlsx")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));

        // Other targets and other users are unaffected.
        db.insert_job(&make_job("alice", "other.xlsx")).await.unwrap();
        db.insert_job(&make_job("bob", "apps.xlsx")).await.unwrap();
    }

    #[tokio::test]
    async fn terminal_job_releases_target() {
        let db = test_db().await;
        let mut job = make_job("alice", "apps.xlsx");
        db.insert_job(&job).await.unwrap();
        job.fail("boom").unwrap();
        db.update_job(&job).await.unwrap();

        assert!(db.find_active_job("alice", "apps.xlsx").await.unwrap().is_none());
        db.insert_job(&make_job("alice", "apps.xlsx")).await.unwrap();
        assert_eq!(db.list_active_jobs().await.unwrap().len(), 1);
        assert_eq!(db.list_jobs("alice", 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_missing_job_is_not_found() {
        let db = test_db().await;
        let err = db.update_job(&make_job("alice", "x.xlsx")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    // ── Relevance tests ─────────────────────────────────────────────

    fn entry(message_id: &str, related: bool, score: Decimal) -> RelevanceCacheEntry {
        RelevanceCacheEntry {
            message_id: message_id.into(),
            user_id: "alice".into(),
            sender: "jobs@acme.com".into(),
            recipient: "alice@example.com".into(),
            received_at: Utc::now(),
            snippet: "Thanks".into(),
            body: "Thanks for applying".into(),
            labels: vec!["INBOX".into(), "CATEGORY_UPDATES".into()],
            is_job_related: related,
            relevance_score: score,
            processed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn relevance_last_write_wins() {
        let db = test_db().await;
        db.upsert_relevance(&entry("m1", false, dec!(0.10))).await.unwrap();
        db.upsert_relevance(&entry("m1", true, dec!(0.876))).await.unwrap();

        let got = db.get_relevance("alice", "m1").await.unwrap().unwrap();
        assert!(got.is_job_related);
        assert_eq!(got.relevance_score, dec!(0.88));
        assert_eq!(got.labels.len(), 2);
        assert_eq!(db.count_relevance("alice").await.unwrap(), 1);
        assert!(db.get_relevance("alice", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn relevance_is_scoped_per_user() {
        let db = test_db().await;
        db.upsert_relevance(&entry("42", true, dec!(0.9))).await.unwrap();
        let mut other = entry("42", false, dec!(0.05));
        other.user_id = "bob".into();
        db.upsert_relevance(&other).await.unwrap();

        let alice = db.get_relevance("alice", "42").await.unwrap().unwrap();
        let bob = db.get_relevance("bob", "42").await.unwrap().unwrap();
        assert!(alice.is_job_related);
        assert!(!bob.is_job_related);
        assert_eq!(bob.user_id, "bob");
        assert!(db.get_relevance("carol", "42").await.unwrap().is_none());
    }

    // ── Application tests ───────────────────────────────────────────

    #[tokio::test]
    async fn application_upsert_inserts_then_updates() {
        let db = test_db().await;
        assert_eq!(
            db.upsert_application(&make_app("m1", "old"), false).await.unwrap(),
            UpsertOutcome::Inserted
        );
        let mut newer = make_app("m1", "new");
        newer.company = "ACME ".into();
        assert_eq!(
            db.upsert_application(&newer, false).await.unwrap(),
            UpsertOutcome::Updated
        );

        let apps = db.list_applications("alice").await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].notes.as_deref(), Some("new"));
        assert_eq!(apps[0].job_id.as_deref(), Some("R-1"));
    }

    #[tokio::test]
    async fn newer_message_replaces_application_with_same_key() {
        let db = test_db().await;
        db.upsert_application(&make_app("m1", "old"), false).await.unwrap();
        assert_eq!(
            db.upsert_application(&make_app("m2", "new"), false).await.unwrap(),
            UpsertOutcome::Updated
        );

        let apps = db.list_applications("alice").await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].message_id, "m2");
        assert_eq!(apps[0].notes.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn per_message_keys_keep_both_applications() {
        let db = test_db().await;
        db.upsert_application(&make_app("m1", "old"), true).await.unwrap();
        assert_eq!(
            db.upsert_application(&make_app("m2", "new"), true).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(db.list_applications("alice").await.unwrap().len(), 2);
    }
}
