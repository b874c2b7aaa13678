//! Persistence layer: libSQL-backed storage for jobs, the relevance cache
//! and merged applications.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, UpsertOutcome};
