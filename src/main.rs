use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::NaiveDate;
use clap::Parser;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use jobtracker::config::AppConfig;
use jobtracker::enrich::{EnrichmentStage, Enricher, LlmEnricher, RuleEnricher};
use jobtracker::extract::{ExtractionStage, Extractor, LlmExtractor, RuleExtractor};
use jobtracker::llm::create_provider;
use jobtracker::model::{JobRequest, MergeMode};
use jobtracker::output::{OutputStage, XlsxArtifactStore};
use jobtracker::pipeline::{
    BroadcastPublisher, FanoutPublisher, Orchestrator, Stages, TracingPublisher,
};
use jobtracker::rate_limit::RateBudget;
use jobtracker::relevance::{Classifier, KeywordClassifier, LlmClassifier, RelevanceCache};
use jobtracker::retry::CallPolicy;
use jobtracker::source::SourceReader;
use jobtracker::source::imap::ImapMailSource;
use jobtracker::store::{Database, LibSqlBackend};

/// The rule capabilities are local, so their budget only guards runaway loops.
const RULES_RATE_PER_SEC: u32 = 1000;

#[derive(Parser)]
#[command(name = "jobtracker")]
#[command(about = "Build a spreadsheet of job applications from your mailbox", version)]
struct Cli {
    /// First day to scan (YYYY-MM-DD)
    #[arg(long, required_unless_present = "recover")]
    start: Option<NaiveDate>,

    /// Day to stop before (YYYY-MM-DD). Defaults to now.
    #[arg(long)]
    end: Option<NaiveDate>,

    /// Spreadsheet to write
    #[arg(long, default_value = "job_applications.xlsx")]
    output: String,

    /// Merge into the existing spreadsheet instead of rebuilding it
    #[arg(long)]
    append: bool,

    /// Mailbox owner the job runs for
    #[arg(long, env = "JOBTRACKER_USER", default_value = "default")]
    user: String,

    /// Fail jobs left running by a previous process, then exit
    #[arg(long)]
    recover: bool,
}

/// Install the stderr logger and, with a log dir, a daily rolling file.
fn init_tracing(
    log_dir: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "jobtracker.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env().context("invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    // The IMAP source speaks TLS through rustls.
    let _ = rustls::crypto::ring::default_provider().install_default();

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Capabilities ────────────────────────────────────────────────────
    let pipeline = &config.pipeline;
    let (classifier, extractor, enricher, ai_rate): (
        Arc<dyn Classifier>,
        Arc<dyn Extractor>,
        Arc<dyn Enricher>,
        u32,
    ) = match &config.llm {
        Some(llm_config) => {
            let llm = create_provider(llm_config).context("failed to create LLM provider")?;
            eprintln!("   Model: {}", llm.model_name());
            (
                Arc::new(LlmClassifier::new(Arc::clone(&llm))),
                Arc::new(LlmExtractor::new(Arc::clone(&llm))),
                Arc::new(LlmEnricher::new(llm)),
                pipeline.ai_rate_per_sec,
            )
        }
        None => {
            eprintln!("   Model: none (keyword and rule capabilities)");
            (
                Arc::new(KeywordClassifier),
                Arc::new(RuleExtractor),
                Arc::new(RuleEnricher),
                RULES_RATE_PER_SEC,
            )
        }
    };
    let calls = CallPolicy::new(
        RateBudget::per_second("ai", ai_rate),
        pipeline.retry,
        pipeline.call_timeout,
    );

    // ── Mail source ─────────────────────────────────────────────────────
    let Some(imap) = config.imap.clone() else {
        bail!("no mail source configured: set EMAIL_IMAP_HOST, EMAIL_USERNAME and EMAIL_PASSWORD");
    };
    eprintln!("   Mailbox: {}@{} ({})", imap.username, imap.host, imap.mailbox);
    let reader = SourceReader::new(
        Arc::new(ImapMailSource::new(imap)),
        RateBudget::per_second("mail", pipeline.mail_rate_per_sec),
        pipeline.retry,
        pipeline.call_timeout,
        pipeline.worker_concurrency,
    );

    // ── Orchestrator ────────────────────────────────────────────────────
    let stages = Stages {
        reader,
        relevance: RelevanceCache::new(
            Arc::clone(&db),
            classifier,
            calls.clone(),
            pipeline.relevance_threshold,
        ),
        extraction: ExtractionStage::new(extractor, calls.clone(), pipeline.min_extraction_confidence),
        enrichment: EnrichmentStage::new(enricher, calls, pipeline.summary_max_words),
        output: OutputStage::new(
            Arc::new(XlsxArtifactStore::new(".")),
            pipeline.allow_duplicates,
        ),
    };
    let broadcast = Arc::new(BroadcastPublisher::default());
    let publisher = FanoutPublisher::new()
        .with(Arc::new(TracingPublisher))
        .with(broadcast.clone());
    let orchestrator = Orchestrator::new(
        Arc::clone(&db),
        stages,
        Arc::new(publisher),
        pipeline.worker_concurrency,
    );

    let recovered = orchestrator.recover_interrupted().await?;
    if !recovered.is_empty() {
        eprintln!("   Recovered {} interrupted job(s)", recovered.len());
    }
    if cli.recover {
        return Ok(());
    }

    // ── Run ─────────────────────────────────────────────────────────────
    let Some(start_date) = cli.start else {
        bail!("--start is required");
    };
    let request = JobRequest {
        user_id: cli.user,
        start_date,
        end_date: cli.end,
        output_target: cli.output,
        merge_mode: if cli.append {
            MergeMode::Append
        } else {
            MergeMode::Overwrite
        },
    };
    let job = orchestrator.create_job(request).await?;
    eprintln!("   Job: {} -> {}\n", job.id, job.output_target);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let mut progress = Box::pin(broadcast.job_stream(job.id));
    let printer = tokio::spawn(async move {
        while let Some(snapshot) = progress.next().await {
            eprintln!(
                "   [{:>3}%] {} (found {}, processed {})",
                snapshot.progress, snapshot.stage, snapshot.found, snapshot.processed
            );
        }
    });

    let result = orchestrator.run(job, cancel).await;
    printer.abort();
    let result = result?;

    println!("{}", result.summary());
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
