//! Soul repository: one persona document per device

use super::{DbPool, now_timestamp};
use crate::{Error, Result};

/// Soul repository
#[derive(Clone)]
pub struct SoulRepo {
    pool: DbPool,
}

impl SoulRepo {
    /// Create a new soul repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Current persona document of a device
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, device_id: &str) -> Result<Option<String>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        match conn.query_row(
            "SELECT content FROM souls WHERE device_id = ?1",
            [device_id],
            |row| row.get(0),
        ) {
            Ok(content) => Ok(Some(content)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the persona document of a device
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn upsert(&self, device_id: &str, content: &str) -> Result<()> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        conn.execute(
            r"INSERT INTO souls (device_id, content, updated_at) VALUES (?1, ?2, ?3)
              ON CONFLICT(device_id) DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at",
            rusqlite::params![device_id, content, now_timestamp()],
        )?;
        Ok(())
    }
}
