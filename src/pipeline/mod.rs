//! Job pipeline.
//!
//! Every job flows through the same stages:
//! 1. `finding_emails`: paged fetch plus the relevance cache
//! 2. `parsing_emails`: candidate extraction
//! 3. `summarizing` and `tracking_status`: enrichment
//! 4. `writing_excel`: merge into the output artifact
//!
//! The [`Orchestrator`] owns the job record and is the only writer of it;
//! progress goes out through a [`ProgressPublisher`] after each checkpoint.

pub mod job;
pub mod orchestrator;
pub mod progress;
pub mod state;

pub use job::ProcessingJob;
pub use orchestrator::{JobHandle, Orchestrator, Stages};
pub use progress::{
    BroadcastPublisher, FanoutPublisher, ProgressPublisher, ProgressSnapshot, TracingPublisher,
};
pub use state::JobStage;
