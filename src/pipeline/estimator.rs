//! Batch time and priority estimation for freshly extracted todos

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::Result;
use crate::db::{Store, Todo};
use crate::llm::{ChatMessage, CompletionClient, CompletionOptions};

/// Minutes assumed when the model gives no usable estimate
pub const DEFAULT_MINUTES: u32 = 30;

/// Priority assumed when the model gives no usable estimate
pub const DEFAULT_PRIORITY: u8 = 3;

const ESTIMATE_PROMPT: &str = r#"你是一个时间管理助手。对以下待办事项进行分析，估算完成时间和优先级。
{soul}
返回 JSON 对象，格式：
{
  "estimates": [
    {"index": 1, "estimated_minutes": 30, "priority": 3, "reasoning": "..."},
    ...
  ]
}

estimated_minutes: 预估完成所需分钟数(5-480)
priority: 优先级 1-5 (5最高)
reasoning: 简短理由"#;

/// Estimate for one todo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeEstimate {
    pub todo_id: String,
    pub minutes: u32,
    /// 1 (lowest) to 5 (highest)
    pub priority: u8,
    pub reasoning: Option<String>,
}

impl TimeEstimate {
    fn fallback(todo_id: &str) -> Self {
        Self {
            todo_id: todo_id.to_string(),
            minutes: DEFAULT_MINUTES,
            priority: DEFAULT_PRIORITY,
            reasoning: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EstimateReply {
    #[serde(default)]
    estimates: Vec<Value>,
}

/// Asks the completion service for todo durations in one call
#[derive(Clone)]
pub struct TimeEstimator {
    store: Arc<dyn Store>,
    llm: Arc<dyn CompletionClient>,
}

impl TimeEstimator {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, llm: Arc<dyn CompletionClient>) -> Self {
        Self { store, llm }
    }

    /// Estimate every todo in one completion call
    ///
    /// A failed call or an unreadable reply gives every todo the defaults.
    /// Entries whose index is out of range are ignored.
    pub async fn estimate(&self, todos: &[Todo], soul: Option<&str>) -> Vec<TimeEstimate> {
        if todos.is_empty() {
            return Vec::new();
        }

        let list = todos
            .iter()
            .enumerate()
            .map(|(i, todo)| format!("{}. {}", i + 1, todo.text))
            .collect::<Vec<_>>()
            .join("\n");
        let soul_line = soul.map(|s| format!("\n用户画像：{s}\n")).unwrap_or_default();
        let messages = [
            ChatMessage::system(ESTIMATE_PROMPT.replace("{soul}", &soul_line)),
            ChatMessage::user(list),
        ];

        let reply = match self.llm.complete(&messages, &CompletionOptions::json()).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "batch estimation failed");
                return todos.iter().map(|t| TimeEstimate::fallback(&t.id)).collect();
            }
        };

        match serde_json::from_str::<EstimateReply>(&reply) {
            Ok(parsed) => read_estimates(todos, &parsed.estimates),
            Err(e) => {
                tracing::warn!(error = %e, "unreadable estimation reply");
                todos.iter().map(|t| TimeEstimate::fallback(&t.id)).collect()
            }
        }
    }

    /// Estimate and write the results back; write failures are logged
    ///
    /// # Errors
    ///
    /// Never fails; the signature matches background task bodies
    pub async fn estimate_and_store(&self, todos: &[Todo], soul: Option<&str>) -> Result<()> {
        for estimate in self.estimate(todos, soul).await {
            if let Err(e) = self
                .store
                .update_todo_estimate(&estimate.todo_id, estimate.minutes, estimate.priority)
                .await
            {
                tracing::warn!(todo_id = %estimate.todo_id, error = %e, "failed to store estimate");
            }
        }
        tracing::debug!(count = todos.len(), "todo estimates stored");
        Ok(())
    }
}

fn read_estimates(todos: &[Todo], entries: &[Value]) -> Vec<TimeEstimate> {
    entries
        .iter()
        .filter_map(|entry| {
            let index = entry.get("index").and_then(Value::as_u64)?;
            let todo = todos.get(usize::try_from(index).ok()?.checked_sub(1)?)?;

            let minutes = entry
                .get("estimated_minutes")
                .and_then(Value::as_u64)
                .and_then(|m| u32::try_from(m).ok())
                .unwrap_or(DEFAULT_MINUTES);
            let priority = entry
                .get("priority")
                .and_then(Value::as_i64)
                .map_or(DEFAULT_PRIORITY, |p| {
                    u8::try_from(p.clamp(1, 5)).unwrap_or(DEFAULT_PRIORITY)
                });

            Some(TimeEstimate {
                todo_id: todo.id.clone(),
                minutes,
                priority,
                reasoning: entry
                    .get("reasoning")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
            })
        })
        .collect()
}
