//! Tag repository

use serde::Serialize;
use uuid::Uuid;

use super::{DbPool, now_timestamp};
use crate::{Error, Result};

/// A user-defined tag
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Tag {
    pub id: String,
    pub name: String,
}

/// Tag repository
#[derive(Clone)]
pub struct TagRepo {
    pool: DbPool,
}

impl TagRepo {
    /// Create a new tag repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create a tag, returning the existing one if the name is taken
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create(&self, name: &str) -> Result<Tag> {
        if let Some(tag) = self.find_by_name(name)? {
            return Ok(tag);
        }

        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO tags (id, name, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, name, now_timestamp()],
        )?;
        Ok(Tag {
            id,
            name: name.to_string(),
        })
    }

    /// Look up a tag by exact name
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_by_name(&self, name: &str) -> Result<Option<Tag>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        match conn.query_row(
            "SELECT id, name FROM tags WHERE name = ?1",
            [name],
            |row| {
                Ok(Tag {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        ) {
            Ok(tag) => Ok(Some(tag)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Link a tag to a record (no-op if already linked)
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn add_to_record(&self, record_id: &str, tag_id: &str) -> Result<()> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        conn.execute(
            "INSERT OR IGNORE INTO record_tags (record_id, tag_id) VALUES (?1, ?2)",
            rusqlite::params![record_id, tag_id],
        )?;
        Ok(())
    }

    /// Names of the tags linked to a record
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn names_for_record(&self, record_id: &str) -> Result<Vec<String>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let mut stmt = conn.prepare(
            r"SELECT t.name FROM tags t
              JOIN record_tags rt ON rt.tag_id = t.id
              WHERE rt.record_id = ?1 ORDER BY t.name",
        )?;
        let names = stmt
            .query_map([record_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Total number of tags
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn count(&self) -> Result<usize> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM tags", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
