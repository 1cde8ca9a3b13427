//! Database module: the persistence collaborator behind the gateway
//!
//! Pipelines only see the async [`Store`] trait. [`SqliteStore`] implements it
//! over per-table repositories on an r2d2 pool, running every call on the
//! blocking thread pool.

pub mod memory;
pub mod record;
mod schema;
pub mod skill;
pub mod soul;
mod store;
pub mod tag;
pub mod todo;

use std::path::Path;

use async_trait::async_trait;
use chrono::NaiveDate;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub use memory::{MEMORY_CONTEXT_LIMIT, MemoryEntry, MemoryRepo};
pub use record::{DatedTranscript, NewRecord, Record, RecordRepo, RecordSource, RecordStatus};
pub use schema::SCHEMA_VERSION;
pub use skill::{SkillConfigRepo, SkillToggle};
pub use soul::SoulRepo;
pub use store::SqliteStore;
pub use tag::{Tag, TagRepo};
pub use todo::{ExtractionTable, Todo, TodoRepo};

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Pooled database connection
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Inclusive calendar date range (`YYYY-MM-DD` on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Timestamp format shared by all tables; sorts lexicographically
pub(crate) fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Persistence operations the gateway core depends on
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_record(&self, new: NewRecord) -> Result<Record>;
    async fn update_record_status(&self, record_id: &str, status: RecordStatus) -> Result<()>;
    async fn set_record_audio(&self, record_id: &str, path: &str) -> Result<()>;
    async fn add_transcript(&self, record_id: &str, text: &str, language: &str) -> Result<()>;
    async fn transcripts_in_range(
        &self,
        device_id: &str,
        range: &DateRange,
    ) -> Result<Vec<DatedTranscript>>;
    async fn save_summary(&self, record_id: &str, summary: &str) -> Result<()>;

    async fn create_todos(&self, record_id: &str, texts: &[String]) -> Result<Vec<Todo>>;
    async fn pending_todos(&self, device_id: &str) -> Result<Vec<Todo>>;
    async fn update_todo_estimate(&self, todo_id: &str, minutes: u32, priority: u8)
    -> Result<()>;
    async fn create_customer_requests(&self, record_id: &str, texts: &[String]) -> Result<()>;
    async fn create_setting_changes(&self, record_id: &str, texts: &[String]) -> Result<()>;

    /// Existing tag by name; tags are never created by the gateway
    async fn find_tag(&self, name: &str) -> Result<Option<Tag>>;
    async fn tag_record(&self, record_id: &str, tag_id: &str) -> Result<()>;

    async fn skill_toggles(&self, device_id: &str) -> Result<Vec<SkillToggle>>;

    async fn memories(
        &self,
        device_id: &str,
        range: Option<&DateRange>,
    ) -> Result<Vec<MemoryEntry>>;
    async fn save_memory(
        &self,
        device_id: &str,
        content: &str,
        source_date: Option<NaiveDate>,
        importance: u8,
    ) -> Result<()>;

    async fn soul(&self, device_id: &str) -> Result<Option<String>>;
    async fn save_soul(&self, device_id: &str, content: &str) -> Result<()>;
}

/// Initialize the database
///
/// # Errors
///
/// Returns error if database cannot be opened or initialized
pub fn init<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    if let Some(parent) = path.as_ref().parent() {
        std::fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(path)
        .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
    let pool = Pool::builder()
        .max_size(4)
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))?;

    // Run migrations on first connection
    let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
    schema::init(&conn)?;

    tracing::info!(version = SCHEMA_VERSION, "database initialized");
    Ok(pool)
}

/// Initialize an in-memory database (for testing)
///
/// # Errors
///
/// Returns error if database cannot be initialized
pub fn init_memory() -> Result<DbPool> {
    let manager = SqliteConnectionManager::memory()
        .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
    let pool = Pool::builder()
        .max_size(1)
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))?;

    let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
    schema::init(&conn)?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_memory() {
        let pool = init_memory().unwrap();
        let _conn = pool.get().unwrap();
    }

    #[test]
    fn test_init_file() {
        let dir = tempfile::tempdir().unwrap();
        let pool = init(dir.path().join("nested").join("gateway.db")).unwrap();
        let _conn = pool.get().unwrap();
    }

    #[test]
    fn date_range_uses_iso_dates() {
        let range: DateRange =
            serde_json::from_str(r#"{"start":"2025-03-01","end":"2025-03-07"}"#).unwrap();
        assert_eq!(range.start.to_string(), "2025-03-01");
        assert_eq!(range.end.to_string(), "2025-03-07");
    }
}
