//! Skill config repository for per-device skill toggles

use serde::{Deserialize, Serialize};

use super::DbPool;
use crate::{Error, Result};

/// Enabled flag of one skill for one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillToggle {
    #[serde(alias = "skill_name")]
    pub name: String,
    pub enabled: bool,
}

/// Skill config repository
#[derive(Clone)]
pub struct SkillConfigRepo {
    pool: DbPool,
}

impl SkillConfigRepo {
    /// Create a new skill config repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// All toggles stored for a device
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_by_device(&self, device_id: &str) -> Result<Vec<SkillToggle>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT skill_name, enabled FROM skill_configs WHERE device_id = ?1 ORDER BY skill_name",
        )?;
        let toggles = stmt
            .query_map([device_id], |row| {
                Ok(SkillToggle {
                    name: row.get(0)?,
                    enabled: row.get::<_, i32>(1)? != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(toggles)
    }

    /// Enable or disable a skill for a device
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set(&self, device_id: &str, skill_name: &str, enabled: bool) -> Result<()> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        conn.execute(
            r"INSERT INTO skill_configs (device_id, skill_name, enabled) VALUES (?1, ?2, ?3)
              ON CONFLICT(device_id, skill_name) DO UPDATE SET enabled = excluded.enabled",
            rusqlite::params![device_id, skill_name, i32::from(enabled)],
        )?;
        tracing::info!(device_id = %device_id, skill = %skill_name, enabled, "skill toggled");
        Ok(())
    }
}
