//! Todo aggregation: pending todos rewritten into one diary entry

use std::sync::Arc;

use crate::Result;
use crate::asr::TRANSCRIPT_LANGUAGE;
use crate::db::{NewRecord, RecordSource, RecordStatus, Store, Todo};
use crate::llm::{ChatMessage, CompletionClient, CompletionOptions};

/// Reply when the device has nothing pending
pub const NO_PENDING_TODOS: &str = "当前没有待办事项。";

const DIARY_PROMPT: &str = "将以下待办事项整理成一段简洁的日记条目。按优先级和关联性重新组织，去除重复。用自然的语言，不要用列表格式。";

const DIARY_TEMPERATURE: f32 = 0.5;

/// Folds a device's pending todos into a diary record
#[derive(Clone)]
pub struct TodoAggregator {
    store: Arc<dyn Store>,
    llm: Arc<dyn CompletionClient>,
}

impl TodoAggregator {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, llm: Arc<dyn CompletionClient>) -> Self {
        Self { store, llm }
    }

    /// Build the diary entry and save it as a completed record
    ///
    /// With nothing pending, returns [`NO_PENDING_TODOS`] and writes nothing.
    ///
    /// # Errors
    ///
    /// Returns error if the todos cannot be read, the completion call fails,
    /// or the record cannot be saved
    pub async fn aggregate(&self, device_id: &str) -> Result<String> {
        let todos = self.store.pending_todos(device_id).await?;
        if todos.is_empty() {
            return Ok(NO_PENDING_TODOS.to_string());
        }

        let messages = [
            ChatMessage::system(DIARY_PROMPT),
            ChatMessage::user(group_by_date(&todos)),
        ];
        let entry = self
            .llm
            .complete(&messages, &CompletionOptions::text(DIARY_TEMPERATURE))
            .await?;

        let record = self
            .store
            .create_record(NewRecord {
                device_id: device_id.to_string(),
                status: RecordStatus::Completed,
                source: RecordSource::TodoAggregate,
                duration_seconds: None,
                location_text: None,
            })
            .await?;
        self.store
            .add_transcript(&record.id, &entry, TRANSCRIPT_LANGUAGE)
            .await?;

        tracing::info!(device_id, record_id = %record.id, todos = todos.len(), "todos aggregated");
        Ok(entry)
    }
}

/// `date:` headed blocks in first-seen date order
fn group_by_date(todos: &[Todo]) -> String {
    let mut groups: Vec<(&str, Vec<&str>)> = Vec::new();
    for todo in todos {
        let date = todo.created_at.get(..10).unwrap_or(&todo.created_at);
        match groups.iter_mut().find(|(d, _)| *d == date) {
            Some((_, texts)) => texts.push(&todo.text),
            None => groups.push((date, vec![&todo.text])),
        }
    }

    groups
        .iter()
        .map(|(date, texts)| {
            let lines: Vec<String> = texts.iter().map(|t| format!("- {t}")).collect();
            format!("{date}:\n{}", lines.join("\n"))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn todo(text: &str, created_at: &str) -> Todo {
        Todo {
            id: text.to_string(),
            record_id: "r1".to_string(),
            text: text.to_string(),
            done: false,
            estimated_minutes: None,
            priority: None,
            created_at: created_at.to_string(),
        }
    }

    #[test]
    fn groups_keep_first_seen_order() {
        let todos = [
            todo("买牛奶", "2026-03-02 08:00:00"),
            todo("写周报", "2026-03-01 18:00:00"),
            todo("回电话", "2026-03-02 20:00:00"),
        ];
        assert_eq!(
            group_by_date(&todos),
            "2026-03-02:\n- 买牛奶\n- 回电话\n\n2026-03-01:\n- 写周报"
        );
    }
}
