//! Extraction output repositories: todos, customer requests, setting changes

use serde::Serialize;
use uuid::Uuid;

use super::{DbPool, now_timestamp};
use crate::{Error, Result};

/// A todo extracted from a record
#[derive(Debug, Clone, Serialize)]
pub struct Todo {
    pub id: String,
    pub record_id: String,
    pub text: String,
    pub done: bool,
    pub estimated_minutes: Option<u32>,
    pub priority: Option<u8>,
    pub created_at: String,
}

/// Repository for everything the process pipeline extracts besides tags
#[derive(Clone)]
pub struct TodoRepo {
    pool: DbPool,
}

impl TodoRepo {
    /// Create a new todo repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert one todo per text, all attached to the same record
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create_many(&self, record_id: &str, texts: &[String]) -> Result<Vec<Todo>> {
        let mut conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let tx = conn.transaction()?;
        let now = now_timestamp();
        let mut todos = Vec::with_capacity(texts.len());

        for text in texts {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                r"INSERT INTO todos (id, record_id, text, done, created_at) VALUES (?1, ?2, ?3, 0, ?4)",
                rusqlite::params![id, record_id, text, now],
            )?;
            todos.push(Todo {
                id,
                record_id: record_id.to_string(),
                text: text.clone(),
                done: false,
                estimated_minutes: None,
                priority: None,
                created_at: now.clone(),
            });
        }

        tx.commit()?;
        Ok(todos)
    }

    /// Todos of one record
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_by_record(&self, record_id: &str) -> Result<Vec<Todo>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let mut stmt = conn.prepare(
            r"SELECT id, record_id, text, done, estimated_minutes, priority, created_at
              FROM todos WHERE record_id = ?1 ORDER BY created_at",
        )?;
        let todos = stmt
            .query_map([record_id], row_to_todo)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(todos)
    }

    /// Open todos across all of a device's records, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn pending_by_device(&self, device_id: &str) -> Result<Vec<Todo>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let mut stmt = conn.prepare(
            r"SELECT t.id, t.record_id, t.text, t.done, t.estimated_minutes, t.priority, t.created_at
              FROM todos t
              JOIN records r ON r.id = t.record_id
              WHERE r.device_id = ?1 AND t.done = 0
              ORDER BY t.created_at",
        )?;
        let todos = stmt
            .query_map([device_id], row_to_todo)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(todos)
    }

    /// Store a time estimate for a todo
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_estimate(&self, todo_id: &str, minutes: u32, priority: u8) -> Result<()> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        conn.execute(
            "UPDATE todos SET estimated_minutes = ?1, priority = ?2 WHERE id = ?3",
            rusqlite::params![minutes, priority, todo_id],
        )?;
        Ok(())
    }

    /// Insert pending customer requests
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create_customer_requests(&self, record_id: &str, texts: &[String]) -> Result<()> {
        self.insert_texts(
            r"INSERT INTO customer_requests (id, record_id, text, status, created_at)
              VALUES (?1, ?2, ?3, 'pending', ?4)",
            record_id,
            texts,
        )
    }

    /// Insert unapplied setting changes
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create_setting_changes(&self, record_id: &str, texts: &[String]) -> Result<()> {
        self.insert_texts(
            r"INSERT INTO setting_changes (id, record_id, text, applied, created_at)
              VALUES (?1, ?2, ?3, 0, ?4)",
            record_id,
            texts,
        )
    }

    /// Count rows of an extraction table for a record
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn count_for_record(&self, table: ExtractionTable, record_id: &str) -> Result<usize> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE record_id = ?1", table.as_str()),
            [record_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn insert_texts(&self, sql: &str, record_id: &str, texts: &[String]) -> Result<()> {
        let mut conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let tx = conn.transaction()?;
        let now = now_timestamp();
        for text in texts {
            tx.execute(
                sql,
                rusqlite::params![Uuid::new_v4().to_string(), record_id, text, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

/// Tables written by the process pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionTable {
    Todos,
    CustomerRequests,
    SettingChanges,
}

impl ExtractionTable {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Todos => "todos",
            Self::CustomerRequests => "customer_requests",
            Self::SettingChanges => "setting_changes",
        }
    }
}

fn row_to_todo(row: &rusqlite::Row<'_>) -> rusqlite::Result<Todo> {
    Ok(Todo {
        id: row.get(0)?,
        record_id: row.get(1)?,
        text: row.get(2)?,
        done: row.get::<_, i32>(3)? != 0,
        estimated_minutes: row.get(4)?,
        priority: row.get(5)?,
        created_at: row.get(6)?,
    })
}
