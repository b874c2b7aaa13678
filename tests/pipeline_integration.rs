//! End-to-end pipeline runs.
//!
//! Each test wires a real `Orchestrator` over an in-memory libSQL database and
//! a scripted mailbox, the way the binary wires it over IMAP.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use futures::StreamExt;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;

use jobtracker::enrich::{EnrichmentStage, Enricher, RuleEnricher};
use jobtracker::error::{CapabilityError, JobError, SourceError};
use jobtracker::extract::{ExtractedFields, Extraction, ExtractionStage, Extractor, RuleExtractor};
use jobtracker::model::{ApplicationStatus, CandidateApplication, DateRange, JobRequest, MergeMode};
use jobtracker::output::{ArtifactStore, MemoryArtifactStore, OutputStage, XlsxArtifactStore};
use jobtracker::pipeline::{BroadcastPublisher, JobStage, Orchestrator, Stages};
use jobtracker::rate_limit::RateBudget;
use jobtracker::relevance::{Classification, Classifier, KeywordClassifier, RelevanceCache};
use jobtracker::retry::{CallPolicy, RetryPolicy};
use jobtracker::source::{MailSource, MessagePage, RawMessage, SourceReader};
use jobtracker::store::{Database, LibSqlBackend};

// ── Mailbox ─────────────────────────────────────────────────────────

struct Inbox {
    messages: Vec<RawMessage>,
    page_size: usize,
}

#[async_trait]
impl MailSource for Inbox {
    fn name(&self) -> &str {
        "inbox"
    }

    async fn list_messages(
        &self,
        _user_id: &str,
        _range: &DateRange,
        page_token: Option<&str>,
    ) -> Result<MessagePage, SourceError> {
        let page: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let start = page * self.page_size;
        let message_ids = self
            .messages
            .iter()
            .skip(start)
            .take(self.page_size)
            .map(|m| m.id.clone())
            .collect();
        Ok(MessagePage {
            message_ids,
            next_page_token: (start + self.page_size < self.messages.len())
                .then(|| (page + 1).to_string()),
            total_estimate: Some(self.messages.len() as u32),
        })
    }

    async fn get_message(&self, _user_id: &str, id: &str) -> Result<RawMessage, SourceError> {
        self.messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound { id: id.into() })
    }
}

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 8, day, hour, 0, 0).unwrap()
}

fn mail(id: &str, sender: &str, subject: &str, body: &str, received_at: DateTime<Utc>) -> RawMessage {
    RawMessage {
        id: id.into(),
        thread_id: None,
        sender: sender.into(),
        recipient: "me@example.com".into(),
        subject: subject.into(),
        snippet: body.chars().take(80).collect(),
        body: body.into(),
        labels: vec!["INBOX".into()],
        received_at,
    }
}

// ── Scripted capabilities ───────────────────────────────────────────

/// Relevant iff the subject starts with `APP|`. Counts calls.
#[derive(Default)]
struct ScriptClassifier {
    calls: AtomicUsize,
}

#[async_trait]
impl Classifier for ScriptClassifier {
    fn name(&self) -> &'static str {
        "script"
    }

    async fn classify(&self, message: &RawMessage) -> Result<Classification, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let related = message.subject.starts_with("APP|");
        Ok(Classification::new(related, if related { 0.95 } else { 0.05 }))
    }
}

/// `APP|Company|Position` subjects, applied on the day received.
struct ScriptExtractor;

#[async_trait]
impl Extractor for ScriptExtractor {
    fn name(&self) -> &'static str {
        "script"
    }

    async fn extract(&self, message: &RawMessage) -> Result<Option<Extraction>, CapabilityError> {
        let mut parts = message.subject.split('|').skip(1);
        Ok(Some(Extraction {
            fields: ExtractedFields {
                company: parts.next().map(str::to_string),
                position: parts.next().map(str::to_string),
                applied_date: Some(message.received_at.date_naive()),
                source: Some("Greenhouse".into()),
                ..ExtractedFields::default()
            },
            confidence: 0.9,
        }))
    }
}

/// Summary is the message text; an interview mention sets the status.
struct BodyEnricher;

#[async_trait]
impl Enricher for BodyEnricher {
    fn name(&self) -> &'static str {
        "body"
    }

    async fn summarize(&self, c: &CandidateApplication) -> Result<String, CapabilityError> {
        Ok(c.source_text.clone())
    }

    async fn infer_status(&self, c: &CandidateApplication) -> Result<String, CapabilityError> {
        if c.source_text.contains("interview") {
            Ok("Interview Scheduled".into())
        } else {
            Ok("Applied".into())
        }
    }
}

// ── Wiring ──────────────────────────────────────────────────────────

fn policy() -> CallPolicy {
    CallPolicy::new(
        RateBudget::per_second("ai", 1000),
        RetryPolicy::none(),
        Duration::from_secs(5),
    )
}

fn orchestrator(
    db: Arc<dyn Database>,
    messages: Vec<RawMessage>,
    classifier: Arc<dyn Classifier>,
    extractor: Arc<dyn Extractor>,
    enricher: Arc<dyn Enricher>,
    artifacts: Arc<dyn ArtifactStore>,
    publisher: Arc<BroadcastPublisher>,
) -> Orchestrator {
    let stages = Stages {
        reader: SourceReader::new(
            Arc::new(Inbox {
                messages,
                page_size: 3,
            }),
            RateBudget::per_second("mail", 1000),
            RetryPolicy::none(),
            Duration::from_secs(5),
            2,
        ),
        relevance: RelevanceCache::new(Arc::clone(&db), classifier, policy(), dec!(0.50)),
        extraction: ExtractionStage::new(extractor, policy(), 0.4),
        enrichment: EnrichmentStage::new(enricher, policy(), 30),
        output: OutputStage::new(artifacts, false),
    };
    Orchestrator::new(db, stages, publisher, 3)
}

async fn memory_db() -> Arc<dyn Database> {
    Arc::new(LibSqlBackend::new_memory().await.unwrap())
}

fn request(target: &str, merge_mode: MergeMode) -> JobRequest {
    JobRequest {
        user_id: "alice".into(),
        start_date: NaiveDate::from_ymd_opt(2025, 8, 1).unwrap(),
        end_date: NaiveDate::from_ymd_opt(2025, 9, 1),
        output_target: target.into(),
        merge_mode,
    }
}

fn scripted_inbox() -> Vec<RawMessage> {
    vec![
        mail("a1", "jobs@acme.com", "APP|Acme|SWE Intern", "Application received", at(23, 9)),
        mail("n1", "deals@shop.com", "Weekly deals", "Shoes on sale", at(24, 9)),
        mail("i1", "jobs@initech.com", "APP|Initech|Data Analyst", "Thanks for applying", at(2, 9)),
        mail("n2", "friend@gmail.com", "Dinner?", "Saturday at seven", at(5, 9)),
        mail("g1", "jobs@globex.com", "APP|Globex|PM", "We got it", at(12, 9)),
    ]
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn append_rerun_is_idempotent_and_reuses_the_cache() {
    let db = memory_db().await;
    let classifier = Arc::new(ScriptClassifier::default());
    let artifacts = Arc::new(MemoryArtifactStore::default());
    let orch = orchestrator(
        Arc::clone(&db),
        scripted_inbox(),
        classifier.clone(),
        Arc::new(ScriptExtractor),
        Arc::new(BodyEnricher),
        artifacts.clone(),
        Arc::new(BroadcastPublisher::default()),
    );

    let first = orch
        .process(request("apps.xlsx", MergeMode::Append), CancellationToken::new())
        .await
        .unwrap();
    assert!(first.success);
    assert_eq!(first.applications_found, 3);
    let rows_after_first = artifacts.rows("apps.xlsx").await.unwrap();
    assert_eq!(rows_after_first.len(), 3);
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 5);

    let second = orch
        .process(request("apps.xlsx", MergeMode::Append), CancellationToken::new())
        .await
        .unwrap();
    assert!(second.success);
    assert!(second.message.contains("(0 new, 3 updated)"), "{}", second.message);
    assert_eq!(artifacts.rows("apps.xlsx").await.unwrap(), rows_after_first);
    // Every verdict came from the cache.
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 5);
    assert_eq!(db.count_relevance("alice").await.unwrap(), 5);
}

#[tokio::test]
async fn newer_message_updates_the_existing_row() {
    let db = memory_db().await;
    let artifacts = Arc::new(MemoryArtifactStore::default());
    let first_inbox = vec![mail(
        "old",
        "jobs@acme.com",
        "APP|Acme|SWE Intern",
        "Application received",
        at(23, 9),
    )];
    let orch = orchestrator(
        Arc::clone(&db),
        first_inbox,
        Arc::new(ScriptClassifier::default()),
        Arc::new(ScriptExtractor),
        Arc::new(BodyEnricher),
        artifacts.clone(),
        Arc::new(BroadcastPublisher::default()),
    );
    orch.process(request("apps.xlsx", MergeMode::Append), CancellationToken::new())
        .await
        .unwrap();

    let second_inbox = vec![mail(
        "new",
        "jobs@acme.com",
        "APP|Acme|SWE Intern",
        "Please pick an interview slot",
        at(23, 15),
    )];
    let orch = orchestrator(
        Arc::clone(&db),
        second_inbox,
        Arc::new(ScriptClassifier::default()),
        Arc::new(ScriptExtractor),
        Arc::new(BodyEnricher),
        artifacts.clone(),
        Arc::new(BroadcastPublisher::default()),
    );
    let result = orch
        .process(request("apps.xlsx", MergeMode::Append), CancellationToken::new())
        .await
        .unwrap();

    assert!(result.message.contains("(0 new, 1 updated)"), "{}", result.message);
    let rows = artifacts.rows("apps.xlsx").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].applied_date, NaiveDate::from_ymd_opt(2025, 8, 23).unwrap());
    assert!(rows[0].notes.ends_with("Please pick an interview slot."), "{}", rows[0].notes);
    assert_eq!(rows[0].status, ApplicationStatus::InterviewScheduled);
    assert_eq!(rows[0].message_id, "new");
}

#[tokio::test]
async fn overwrite_drops_rows_from_earlier_runs() {
    let db = memory_db().await;
    let artifacts = Arc::new(MemoryArtifactStore::default());
    let orch = orchestrator(
        Arc::clone(&db),
        scripted_inbox(),
        Arc::new(ScriptClassifier::default()),
        Arc::new(ScriptExtractor),
        Arc::new(BodyEnricher),
        artifacts.clone(),
        Arc::new(BroadcastPublisher::default()),
    );
    orch.process(request("apps.xlsx", MergeMode::Append), CancellationToken::new())
        .await
        .unwrap();

    let orch = orchestrator(
        Arc::clone(&db),
        vec![mail("h1", "jobs@hooli.com", "APP|Hooli|SRE", "Thanks", at(30, 9))],
        Arc::new(ScriptClassifier::default()),
        Arc::new(ScriptExtractor),
        Arc::new(BodyEnricher),
        artifacts.clone(),
        Arc::new(BroadcastPublisher::default()),
    );
    orch.process(request("apps.xlsx", MergeMode::Overwrite), CancellationToken::new())
        .await
        .unwrap();

    let rows = artifacts.rows("apps.xlsx").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].company, "Hooli");
}

#[tokio::test]
async fn second_process_cannot_claim_a_running_target() {
    let db = memory_db().await;
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::default());
    let build = || {
        orchestrator(
            Arc::clone(&db),
            scripted_inbox(),
            Arc::new(ScriptClassifier::default()),
            Arc::new(ScriptExtractor),
            Arc::new(BodyEnricher),
            Arc::clone(&artifacts),
            Arc::new(BroadcastPublisher::default()),
        )
    };
    let first = build();
    let second = build();

    let job = first
        .create_job(request("apps.xlsx", MergeMode::Append))
        .await
        .unwrap();
    let err = second
        .create_job(request("apps.xlsx", MergeMode::Append))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::AlreadyRunning { existing, .. } if existing == job.id));

    first.run(job, CancellationToken::new()).await.unwrap();
    assert!(
        second
            .process(request("apps.xlsx", MergeMode::Append), CancellationToken::new())
            .await
            .unwrap()
            .success
    );
}

#[tokio::test]
async fn racing_processes_admit_one_job_per_target() {
    let db = memory_db().await;
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::default());
    let build = || {
        orchestrator(
            Arc::clone(&db),
            scripted_inbox(),
            Arc::new(ScriptClassifier::default()),
            Arc::new(ScriptExtractor),
            Arc::new(BodyEnricher),
            Arc::clone(&artifacts),
            Arc::new(BroadcastPublisher::default()),
        )
    };
    let first = build();
    let second = build();

    let (a, b) = tokio::join!(
        first.create_job(request("apps.xlsx", MergeMode::Append)),
        second.create_job(request("apps.xlsx", MergeMode::Append))
    );
    assert_eq!(
        [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(),
        1,
        "exactly one job may claim the target"
    );
    let rejected = a.err().or(b.err()).unwrap();
    assert!(matches!(rejected, JobError::AlreadyRunning { .. }));
    assert!(db.find_active_job("alice", "apps.xlsx").await.unwrap().is_some());
}

#[tokio::test]
async fn progress_stream_ends_at_completion() {
    let db = memory_db().await;
    let publisher = Arc::new(BroadcastPublisher::default());
    let orch = orchestrator(
        db,
        scripted_inbox(),
        Arc::new(ScriptClassifier::default()),
        Arc::new(ScriptExtractor),
        Arc::new(BodyEnricher),
        Arc::new(MemoryArtifactStore::default()),
        publisher.clone(),
    );

    let job = orch
        .create_job(request("apps.xlsx", MergeMode::Overwrite))
        .await
        .unwrap();
    let mut stream = Box::pin(publisher.job_stream(job.id));
    let watcher = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(snapshot) = stream.next().await {
            let terminal = snapshot.stage.is_terminal();
            seen.push(snapshot);
            if terminal {
                break;
            }
        }
        seen
    });

    let result = orch.run(job, CancellationToken::new()).await.unwrap();
    let seen = watcher.await.unwrap();

    assert!(result.success);
    for pair in seen.windows(2) {
        assert!(pair[0].progress <= pair[1].progress);
    }
    let last = seen.last().unwrap();
    assert_eq!(last.stage, JobStage::Completed);
    assert_eq!(last.progress, 100);
    assert_eq!(last.found, 3);
    assert_eq!(last.processed, 3);
}

#[tokio::test]
async fn rule_capabilities_build_a_spreadsheet() {
    let dir = tempfile::tempdir().unwrap();
    let db = memory_db().await;
    let store = Arc::new(XlsxArtifactStore::new(dir.path()));
    let inbox = vec![
        mail(
            "acme-1",
            "Acme Recruiting <recruiting@acme.com>",
            "Thanks for applying - Backend Engineer Intern",
            "Hi, thanks for applying! We received your application. Job ID: R-20431. \
             Location: Austin, TX\nTrack your status at https://boards.greenhouse.io/acme/jobs/12345.",
            at(23, 15),
        ),
        mail(
            "initech-1",
            "Initech Talent <talent@initech.com>",
            "Re: Your application for the Data Analyst role",
            "Unfortunately, we have decided not to move forward. Thank you for your interest.",
            at(25, 10),
        ),
        mail(
            "friend-1",
            "Sam <sam@gmail.com>",
            "Weekend plans",
            "Dinner at seven on Saturday?",
            at(26, 18),
        ),
    ];
    let orch = orchestrator(
        db,
        inbox,
        Arc::new(KeywordClassifier),
        Arc::new(RuleExtractor),
        Arc::new(RuleEnricher),
        store.clone(),
        Arc::new(BroadcastPublisher::default()),
    );

    let result = orch
        .process(request("apps.xlsx", MergeMode::Append), CancellationToken::new())
        .await
        .unwrap();
    assert!(result.success, "{result:?}");
    assert_eq!(result.applications_found, 2);
    assert_eq!(result.applications_processed, 2);
    assert!(dir.path().join("apps.xlsx").exists());

    let rows = store.read("apps.xlsx").await.unwrap().unwrap();
    assert_eq!(rows.len(), 2);

    let acme = &rows[0];
    assert_eq!(acme.company, "Acme");
    assert_eq!(acme.position, "Backend Engineer Intern");
    assert_eq!(acme.applied_date, NaiveDate::from_ymd_opt(2025, 8, 23).unwrap());
    assert_eq!(acme.status, ApplicationStatus::Applied);
    assert_eq!(acme.job_id, "R-20431");
    assert_eq!(acme.message_id, "acme-1");
    assert!(!acme.notes.is_empty());

    let initech = &rows[1];
    assert_eq!(initech.company, "Initech");
    assert_eq!(initech.position, "Data Analyst");
    assert_eq!(initech.status, ApplicationStatus::Rejected);
}
