//! `SQLite`-backed [`Store`]

use async_trait::async_trait;
use chrono::NaiveDate;

use super::{
    DateRange, DatedTranscript, DbPool, MemoryEntry, MemoryRepo, NewRecord, Record, RecordRepo,
    RecordStatus, SkillConfigRepo, SkillToggle, SoulRepo, Store, Tag, TagRepo, Todo, TodoRepo,
};
use crate::{Error, Result};

/// Store over the `SQLite` repositories
#[derive(Clone)]
pub struct SqliteStore {
    records: RecordRepo,
    todos: TodoRepo,
    tags: TagRepo,
    skills: SkillConfigRepo,
    memories: MemoryRepo,
    souls: SoulRepo,
}

impl SqliteStore {
    /// Create a store sharing one pool across all repositories
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self {
            records: RecordRepo::new(pool.clone()),
            todos: TodoRepo::new(pool.clone()),
            tags: TagRepo::new(pool.clone()),
            skills: SkillConfigRepo::new(pool.clone()),
            memories: MemoryRepo::new(pool.clone()),
            souls: SoulRepo::new(pool),
        }
    }
}

/// Run a synchronous repository call off the async workers
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Database(format!("database task failed: {e}")))?
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_record(&self, new: NewRecord) -> Result<Record> {
        let repo = self.records.clone();
        blocking(move || repo.create(&new)).await
    }

    async fn update_record_status(&self, record_id: &str, status: RecordStatus) -> Result<()> {
        let repo = self.records.clone();
        let record_id = record_id.to_string();
        blocking(move || repo.update_status(&record_id, status)).await
    }

    async fn set_record_audio(&self, record_id: &str, path: &str) -> Result<()> {
        let repo = self.records.clone();
        let (record_id, path) = (record_id.to_string(), path.to_string());
        blocking(move || repo.set_audio_path(&record_id, &path)).await
    }

    async fn add_transcript(&self, record_id: &str, text: &str, language: &str) -> Result<()> {
        let repo = self.records.clone();
        let (record_id, text, language) =
            (record_id.to_string(), text.to_string(), language.to_string());
        blocking(move || repo.add_transcript(&record_id, &text, &language)).await
    }

    async fn transcripts_in_range(
        &self,
        device_id: &str,
        range: &DateRange,
    ) -> Result<Vec<DatedTranscript>> {
        let repo = self.records.clone();
        let (device_id, range) = (device_id.to_string(), *range);
        blocking(move || repo.transcripts_in_range(&device_id, &range)).await
    }

    async fn save_summary(&self, record_id: &str, summary: &str) -> Result<()> {
        let repo = self.records.clone();
        let (record_id, summary) = (record_id.to_string(), summary.to_string());
        blocking(move || repo.save_summary(&record_id, &summary)).await
    }

    async fn create_todos(&self, record_id: &str, texts: &[String]) -> Result<Vec<Todo>> {
        let repo = self.todos.clone();
        let (record_id, texts) = (record_id.to_string(), texts.to_vec());
        blocking(move || repo.create_many(&record_id, &texts)).await
    }

    async fn pending_todos(&self, device_id: &str) -> Result<Vec<Todo>> {
        let repo = self.todos.clone();
        let device_id = device_id.to_string();
        blocking(move || repo.pending_by_device(&device_id)).await
    }

    async fn update_todo_estimate(
        &self,
        todo_id: &str,
        minutes: u32,
        priority: u8,
    ) -> Result<()> {
        let repo = self.todos.clone();
        let todo_id = todo_id.to_string();
        blocking(move || repo.set_estimate(&todo_id, minutes, priority)).await
    }

    async fn create_customer_requests(&self, record_id: &str, texts: &[String]) -> Result<()> {
        let repo = self.todos.clone();
        let (record_id, texts) = (record_id.to_string(), texts.to_vec());
        blocking(move || repo.create_customer_requests(&record_id, &texts)).await
    }

    async fn create_setting_changes(&self, record_id: &str, texts: &[String]) -> Result<()> {
        let repo = self.todos.clone();
        let (record_id, texts) = (record_id.to_string(), texts.to_vec());
        blocking(move || repo.create_setting_changes(&record_id, &texts)).await
    }

    async fn find_tag(&self, name: &str) -> Result<Option<Tag>> {
        let repo = self.tags.clone();
        let name = name.to_string();
        blocking(move || repo.find_by_name(&name)).await
    }

    async fn tag_record(&self, record_id: &str, tag_id: &str) -> Result<()> {
        let repo = self.tags.clone();
        let (record_id, tag_id) = (record_id.to_string(), tag_id.to_string());
        blocking(move || repo.add_to_record(&record_id, &tag_id)).await
    }

    async fn skill_toggles(&self, device_id: &str) -> Result<Vec<SkillToggle>> {
        let repo = self.skills.clone();
        let device_id = device_id.to_string();
        blocking(move || repo.find_by_device(&device_id)).await
    }

    async fn memories(
        &self,
        device_id: &str,
        range: Option<&DateRange>,
    ) -> Result<Vec<MemoryEntry>> {
        let repo = self.memories.clone();
        let (device_id, range) = (device_id.to_string(), range.copied());
        blocking(move || repo.list_for_context(&device_id, range.as_ref())).await
    }

    async fn save_memory(
        &self,
        device_id: &str,
        content: &str,
        source_date: Option<NaiveDate>,
        importance: u8,
    ) -> Result<()> {
        let repo = self.memories.clone();
        let (device_id, content) = (device_id.to_string(), content.to_string());
        blocking(move || {
            repo.add(&device_id, &content, source_date, importance)
                .map(|_| ())
        })
        .await
    }

    async fn soul(&self, device_id: &str) -> Result<Option<String>> {
        let repo = self.souls.clone();
        let device_id = device_id.to_string();
        blocking(move || repo.get(&device_id)).await
    }

    async fn save_soul(&self, device_id: &str, content: &str) -> Result<()> {
        let repo = self.souls.clone();
        let (device_id, content) = (device_id.to_string(), content.to_string());
        blocking(move || repo.upsert(&device_id, &content)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{RecordSource, init_memory};

    #[tokio::test]
    async fn round_trip_through_blocking_pool() {
        let store = SqliteStore::new(init_memory().unwrap());
        let record = store
            .create_record(NewRecord {
                device_id: "dev-1".to_string(),
                status: RecordStatus::Processing,
                source: RecordSource::Voice,
                duration_seconds: Some(2),
                location_text: None,
            })
            .await
            .unwrap();

        let todos = store
            .create_todos(&record.id, &["明天开会".to_string()])
            .await
            .unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(store.pending_todos("dev-1").await.unwrap().len(), 1);

        store.save_soul("dev-1", "persona").await.unwrap();
        assert_eq!(store.soul("dev-1").await.unwrap().as_deref(), Some("persona"));
    }

    #[tokio::test]
    async fn todos_for_missing_record_are_rejected() {
        let store = SqliteStore::new(init_memory().unwrap());
        assert!(
            store
                .create_todos("no-such-record", &["x".to_string()])
                .await
                .is_err()
        );
    }
}
