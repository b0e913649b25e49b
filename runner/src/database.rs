mod sqlite;

pub use sqlite::{InnerConnection, SharedConnection, SQL_SCHEMA, SQL_SCHEMA_NUMBER};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("SQLite operation failed")]
    SQLite(#[source] rusqlite::Error),
    #[error("Failed to (de)serialize the pipeline state")]
    Serialization(#[from] serde_json::Error),
    #[error("Stored timestamp '{0}' is invalid")]
    Timestamp(String),
}

/// Pipeline row without the state document, used for listings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineRecord {
    pub run_id: String,
    pub phase: String,
    pub archived: bool,
    pub updated_at: DateTime<Utc>,
}
