//! Memory repository for long-term memory storage

use chrono::NaiveDate;
use serde::Serialize;
use uuid::Uuid;

use super::{DateRange, DbPool, now_timestamp};
use crate::{Error, Result};

/// Maximum number of long-term entries loaded into a prompt
pub const MEMORY_CONTEXT_LIMIT: usize = 50;

/// A persisted long-term memory entry
#[derive(Debug, Clone, Serialize)]
pub struct MemoryEntry {
    pub id: String,
    pub device_id: String,
    pub content: String,
    pub source_date: Option<NaiveDate>,
    /// 1 to 10, higher is more important
    pub importance: u8,
    pub created_at: String,
}

/// Memory repository
#[derive(Clone)]
pub struct MemoryRepo {
    pool: DbPool,
}

impl MemoryRepo {
    /// Create a new memory repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Add a memory entry; importance is clamped to 1..=10
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn add(
        &self,
        device_id: &str,
        content: &str,
        source_date: Option<NaiveDate>,
        importance: u8,
    ) -> Result<MemoryEntry> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let entry = MemoryEntry {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            content: content.to_string(),
            source_date,
            importance: importance.clamp(1, 10),
            created_at: now_timestamp(),
        };

        conn.execute(
            r"INSERT INTO memories (id, device_id, content, source_date, importance, created_at)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                entry.id,
                entry.device_id,
                entry.content,
                entry.source_date.map(|d| d.to_string()),
                entry.importance,
                entry.created_at,
            ],
        )?;

        tracing::debug!(device_id = %device_id, importance = entry.importance, "memory saved");
        Ok(entry)
    }

    /// Load a device's memories, most important first
    ///
    /// With a range, only entries whose source date lies inside it are returned.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_for_context(
        &self,
        device_id: &str,
        range: Option<&DateRange>,
    ) -> Result<Vec<MemoryEntry>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let limit = i64::try_from(MEMORY_CONTEXT_LIMIT).unwrap_or(50);

        let entries = if let Some(range) = range {
            let mut stmt = conn.prepare(
                r"SELECT id, device_id, content, source_date, importance, created_at
                  FROM memories
                  WHERE device_id = ?1 AND source_date >= ?2 AND source_date <= ?3
                  ORDER BY importance DESC, created_at DESC
                  LIMIT ?4",
            )?;
            stmt.query_map(
                rusqlite::params![
                    device_id,
                    range.start.to_string(),
                    range.end.to_string(),
                    limit
                ],
                row_to_entry,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            let mut stmt = conn.prepare(
                r"SELECT id, device_id, content, source_date, importance, created_at
                  FROM memories
                  WHERE device_id = ?1
                  ORDER BY importance DESC, created_at DESC
                  LIMIT ?2",
            )?;
            stmt.query_map(rusqlite::params![device_id, limit], row_to_entry)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };

        Ok(entries)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let source_date: Option<String> = row.get(3)?;
    Ok(MemoryEntry {
        id: row.get(0)?,
        device_id: row.get(1)?,
        content: row.get(2)?,
        source_date: source_date.and_then(|s| s.parse().ok()),
        importance: row.get(4)?,
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn ordered_by_importance() {
        let repo = MemoryRepo::new(init_memory().unwrap());
        repo.add("dev-1", "low", Some(date("2025-01-01")), 2).unwrap();
        repo.add("dev-1", "high", Some(date("2025-01-02")), 9).unwrap();
        repo.add("dev-2", "other", None, 10).unwrap();

        let entries = repo.list_for_context("dev-1", None).unwrap();
        let contents: Vec<_> = entries.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["high", "low"]);
    }

    #[test]
    fn importance_is_clamped() {
        let repo = MemoryRepo::new(init_memory().unwrap());
        assert_eq!(repo.add("dev-1", "x", None, 0).unwrap().importance, 1);
        assert_eq!(repo.add("dev-1", "y", None, 42).unwrap().importance, 10);
    }

    #[test]
    fn range_filters_by_source_date() {
        let repo = MemoryRepo::new(init_memory().unwrap());
        repo.add("dev-1", "inside", Some(date("2025-03-05")), 5).unwrap();
        repo.add("dev-1", "outside", Some(date("2025-04-01")), 5).unwrap();
        repo.add("dev-1", "undated", None, 5).unwrap();

        let range = DateRange {
            start: date("2025-03-01"),
            end: date("2025-03-31"),
        };
        let entries = repo.list_for_context("dev-1", Some(&range)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "inside");
    }
}
