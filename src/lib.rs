//! Job tracker: turns a mailbox into a spreadsheet of job applications.

pub mod config;
pub mod enrich;
pub mod error;
pub mod extract;
pub mod llm;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod rate_limit;
pub mod relevance;
pub mod retry;
pub mod source;
pub mod store;
