//! Record repository: journal entries, their transcripts and summaries

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DateRange, DbPool, now_timestamp};
use crate::{Error, Result};

/// Processing state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Extraction has not finished yet
    Processing,
    Completed,
    Error,
}

impl RecordStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Where a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    Voice,
    Manual,
    TodoAggregate,
}

impl RecordSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Manual => "manual",
            Self::TodoAggregate => "todo_aggregate",
        }
    }
}

/// Fields for a new record
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub device_id: String,
    pub status: RecordStatus,
    pub source: RecordSource,
    pub duration_seconds: Option<u32>,
    pub location_text: Option<String>,
}

/// A stored record
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    pub id: String,
    pub device_id: String,
    pub status: RecordStatus,
    pub source: String,
    pub duration_seconds: Option<u32>,
    pub location_text: Option<String>,
    pub audio_path: Option<String>,
    pub created_at: String,
}

/// A transcript joined with the creation time of its record
#[derive(Debug, Clone, Serialize)]
pub struct DatedTranscript {
    pub record_id: String,
    pub text: String,
    pub created_at: String,
}

/// Record repository
#[derive(Clone)]
pub struct RecordRepo {
    pool: DbPool,
}

impl RecordRepo {
    /// Create a new record repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create a record
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create(&self, new: &NewRecord) -> Result<Record> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let id = Uuid::new_v4().to_string();
        let now = now_timestamp();

        conn.execute(
            r"INSERT INTO records (id, device_id, status, source, duration_seconds, location_text, created_at, updated_at)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            rusqlite::params![
                id,
                new.device_id,
                new.status.as_str(),
                new.source.as_str(),
                new.duration_seconds,
                new.location_text,
                now,
            ],
        )?;

        tracing::debug!(record_id = %id, device_id = %new.device_id, "record created");

        Ok(Record {
            id,
            device_id: new.device_id.clone(),
            status: new.status,
            source: new.source.as_str().to_string(),
            duration_seconds: new.duration_seconds,
            location_text: new.location_text.clone(),
            audio_path: None,
            created_at: now,
        })
    }

    /// Get a record by ID
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, id: &str) -> Result<Option<Record>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;

        let result = conn.query_row(
            r"SELECT id, device_id, status, source, duration_seconds, location_text, audio_path, created_at
              FROM records WHERE id = ?1",
            [id],
            |row| {
                let status: String = row.get(2)?;
                Ok(Record {
                    id: row.get(0)?,
                    device_id: row.get(1)?,
                    status: RecordStatus::from_str_value(&status)
                        .unwrap_or(RecordStatus::Processing),
                    source: row.get(3)?,
                    duration_seconds: row.get(4)?,
                    location_text: row.get(5)?,
                    audio_path: row.get(6)?,
                    created_at: row.get(7)?,
                })
            },
        );

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Update record status
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails or the record does not exist
    pub fn update_status(&self, id: &str, status: RecordStatus) -> Result<()> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let rows = conn.execute(
            "UPDATE records SET status = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![status.as_str(), now_timestamp(), id],
        )?;

        if rows == 0 {
            return Err(Error::NotFound(format!("record {id}")));
        }
        Ok(())
    }

    /// Attach the saved audio location to a record
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_audio_path(&self, id: &str, path: &str) -> Result<()> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        conn.execute(
            "UPDATE records SET audio_path = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![path, now_timestamp(), id],
        )?;
        Ok(())
    }

    /// Add a transcript to a record
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn add_transcript(&self, record_id: &str, text: &str, language: &str) -> Result<()> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        conn.execute(
            r"INSERT INTO transcripts (id, record_id, text, language, created_at)
              VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                record_id,
                text,
                language,
                now_timestamp()
            ],
        )?;
        Ok(())
    }

    /// Get the transcripts of one record
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn transcripts(&self, record_id: &str) -> Result<Vec<String>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare("SELECT text FROM transcripts WHERE record_id = ?1 ORDER BY created_at")?;
        let texts = stmt
            .query_map([record_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(texts)
    }

    /// Transcripts of a device's records created within a date range (inclusive)
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn transcripts_in_range(
        &self,
        device_id: &str,
        range: &DateRange,
    ) -> Result<Vec<DatedTranscript>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let start = format!("{} 00:00:00", range.start);
        let end = format!("{} 23:59:59", range.end);

        let mut stmt = conn.prepare(
            r"SELECT t.record_id, t.text, r.created_at
              FROM transcripts t
              JOIN records r ON r.id = t.record_id
              WHERE r.device_id = ?1 AND r.created_at >= ?2 AND r.created_at <= ?3
              ORDER BY r.created_at, t.created_at",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![device_id, start, end], |row| {
                Ok(DatedTranscript {
                    record_id: row.get(0)?,
                    text: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Save (or replace) the cleaned summary of a record
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn save_summary(&self, record_id: &str, summary: &str) -> Result<()> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        conn.execute(
            r"INSERT INTO summaries (record_id, short_summary, created_at) VALUES (?1, ?2, ?3)
              ON CONFLICT(record_id) DO UPDATE SET short_summary = excluded.short_summary",
            rusqlite::params![record_id, summary, now_timestamp()],
        )?;
        Ok(())
    }

    /// Get the summary of a record
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn summary(&self, record_id: &str) -> Result<Option<String>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        match conn.query_row(
            "SELECT short_summary FROM summaries WHERE record_id = ?1",
            [record_id],
            |row| row.get(0),
        ) {
            Ok(summary) => Ok(Some(summary)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn voice_record(device_id: &str) -> NewRecord {
        NewRecord {
            device_id: device_id.to_string(),
            status: RecordStatus::Processing,
            source: RecordSource::Voice,
            duration_seconds: Some(3),
            location_text: Some("Hangzhou".to_string()),
        }
    }

    #[test]
    fn create_and_update_status() {
        let repo = RecordRepo::new(init_memory().unwrap());
        let record = repo.create(&voice_record("dev-1")).unwrap();

        repo.update_status(&record.id, RecordStatus::Completed).unwrap();
        let loaded = repo.get(&record.id).unwrap().unwrap();
        assert_eq!(loaded.status, RecordStatus::Completed);
        assert_eq!(loaded.duration_seconds, Some(3));
        assert_eq!(loaded.source, "voice");
    }

    #[test]
    fn update_status_of_missing_record_fails() {
        let repo = RecordRepo::new(init_memory().unwrap());
        assert!(matches!(
            repo.update_status("missing", RecordStatus::Error),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn transcripts_in_range_filters_by_device_and_date() {
        let repo = RecordRepo::new(init_memory().unwrap());
        let mine = repo.create(&voice_record("dev-1")).unwrap();
        let theirs = repo.create(&voice_record("dev-2")).unwrap();
        repo.add_transcript(&mine.id, "打开门", "zh").unwrap();
        repo.add_transcript(&theirs.id, "别的设备", "zh").unwrap();

        let today = chrono::Utc::now().date_naive();
        let range = DateRange {
            start: today,
            end: today,
        };
        let found = repo.transcripts_in_range("dev-1", &range).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].text, "打开门");

        let past = DateRange {
            start: today - chrono::Duration::days(10),
            end: today - chrono::Duration::days(5),
        };
        assert!(repo.transcripts_in_range("dev-1", &past).unwrap().is_empty());
    }

    #[test]
    fn summary_is_replaced() {
        let repo = RecordRepo::new(init_memory().unwrap());
        let record = repo.create(&voice_record("dev-1")).unwrap();
        repo.save_summary(&record.id, "first").unwrap();
        repo.save_summary(&record.id, "second").unwrap();
        assert_eq!(repo.summary(&record.id).unwrap().as_deref(), Some("second"));
    }
}
