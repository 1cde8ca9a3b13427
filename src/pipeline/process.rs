//! Extraction pipeline
//!
//! transcript -> prompt -> completion (with a bounded tool-call loop) ->
//! parsed extraction -> persistence -> record status -> background follow-ups.
//!
//! The pipeline never fails outward: every problem ends up in
//! [`ProcessResult::error`] and the record is left `completed` or `error`,
//! never stuck in `processing`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{LocalConfig, PipelineDeps, TimeEstimator};
use crate::Result;
use crate::db::{RecordStatus, Todo};
use crate::llm::{ChatMessage, CompletionOptions};
use crate::memory::{MemoryManager, ShortTermMemory};
use crate::persona::SoulManager;
use crate::prompt::{PromptContext, PromptMode, build_system_prompt};
use crate::session::SessionMode;

/// Upper bound of tool-execution rounds per extraction
pub const MAX_TOOL_ROUNDS: usize = 3;

const EMPTY_RESPONSE: &str = "AI returned empty response";
const INVALID_JSON: &str = "AI response is not valid JSON";

/// Input of one extraction run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    pub text: String,
    pub device_id: String,
    pub record_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_config: Option<LocalConfig>,
}

impl ProcessRequest {
    pub fn new(
        text: impl Into<String>,
        device_id: impl Into<String>,
        record_id: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            device_id: device_id.into(),
            record_id: record_id.into(),
            local_config: None,
        }
    }
}

/// Outcome of one extraction run; arrays are always present
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub todos: Vec<String>,
    pub customer_requests: Vec<String>,
    pub setting_changes: Vec<String>,
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// One tool invocation requested by the model
#[derive(Debug, Clone, PartialEq)]
struct ToolCall {
    name: String,
    arguments: Value,
}

/// Transcript extraction
#[derive(Clone)]
pub struct ProcessPipeline {
    deps: PipelineDeps,
    memory: MemoryManager,
    soul: SoulManager,
    estimator: TimeEstimator,
}

impl ProcessPipeline {
    #[must_use]
    pub fn new(deps: PipelineDeps) -> Self {
        Self {
            memory: deps.memory(),
            soul: deps.soul(),
            estimator: TimeEstimator::new(Arc::clone(&deps.store), Arc::clone(&deps.llm)),
            deps,
        }
    }

    /// Extract, persist, and schedule follow-ups for one transcript
    pub async fn run(&self, request: ProcessRequest) -> ProcessResult {
        let device_id = request.device_id.as_str();
        let record_id = request.record_id.as_str();
        tracing::info!(device_id, record_id, len = request.text.chars().count(), "processing record");

        let mut session = self.deps.sessions.lock(device_id).await;
        let previous_mode = std::mem::replace(&mut session.mode, SessionMode::Processing);

        let (result, answered) = self.process(&request, &session.short_term).await;

        session.short_term.add(request.text.clone());
        session.mode = previous_mode;
        drop(session);

        tracing::info!(
            device_id,
            record_id,
            todos = result.todos.len(),
            tags = result.tags.len(),
            error = result.error.as_deref().unwrap_or(""),
            "processing finished"
        );
        if answered {
            self.spawn_followups(&request);
        }
        result
    }

    /// Returns the result and whether the model produced an answer
    async fn process(
        &self,
        request: &ProcessRequest,
        short_term: &ShortTermMemory,
    ) -> (ProcessResult, bool) {
        let record_id = request.record_id.as_str();

        let (mut result, soul) = match self.extract(request, short_term).await {
            Ok(extracted) => extracted,
            Err(e) => {
                tracing::error!(record_id, error = %e, "extraction failed");
                self.mark(record_id, RecordStatus::Error).await;
                return (ProcessResult::failed(e.to_string()), false);
            }
        };

        if result.error.is_some() {
            self.mark(record_id, RecordStatus::Error).await;
            return (result, true);
        }

        let todos = self.persist(record_id, &result).await;

        if let Err(e) = self
            .deps
            .store
            .update_record_status(record_id, RecordStatus::Completed)
            .await
        {
            tracing::error!(record_id, error = %e, "failed to mark record completed");
            self.mark(record_id, RecordStatus::Error).await;
            result.error = Some(e.to_string());
        }

        if !todos.is_empty() {
            let estimator = self.estimator.clone();
            self.deps.background.spawn("time estimation", async move {
                estimator.estimate_and_store(&todos, soul.as_deref()).await
            });
        }

        (result, true)
    }

    async fn extract(
        &self,
        request: &ProcessRequest,
        short_term: &ShortTermMemory,
    ) -> Result<(ProcessResult, Option<String>)> {
        let device_id = request.device_id.as_str();
        let local = request.local_config.as_ref();

        let skills = self.deps.active_skills(device_id, local).await;
        let soul = self.deps.resolve_soul(device_id, local).await;
        let memory = self
            .memory
            .load_context(device_id, short_term, None)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(device_id, error = %e, "failed to load memory");
                Vec::new()
            });
        let tools = self.deps.tools.tools_for_prompt().await;
        let existing_tags = local
            .and_then(|l| l.existing_tags.as_deref())
            .unwrap_or_default();

        let system_prompt = build_system_prompt(&PromptContext {
            skills: &skills,
            soul: soul.as_deref(),
            memory: &memory,
            existing_tags,
            tools: &tools,
            ..PromptContext::new(&self.deps.agent_prompt, PromptMode::Process)
        });
        tracing::debug!(
            device_id,
            skills = skills.len(),
            tools = tools.len(),
            prompt_len = system_prompt.len(),
            "built extraction prompt"
        );

        let mut messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user(request.text.clone()),
        ];
        let content = self.complete_with_tools(&mut messages).await?;

        let mut result = parse_extraction(&content);
        if let Some(allowed) = local.and_then(|l| l.existing_tags.as_ref()) {
            result.tags.retain(|tag| allowed.contains(tag));
        }
        Ok((result, soul))
    }

    /// Call the model, executing requested tools for at most
    /// [`MAX_TOOL_ROUNDS`] rounds
    async fn complete_with_tools(&self, messages: &mut Vec<ChatMessage>) -> Result<String> {
        let options = CompletionOptions::json();
        let mut content = self.deps.llm.complete(messages, &options).await?;

        for round in 1..=MAX_TOOL_ROUNDS {
            let calls = match serde_json::from_str::<Value>(strip_code_fence(&content)) {
                Ok(value) => tool_calls(&value),
                Err(_) => break,
            };
            if calls.is_empty() {
                break;
            }

            tracing::info!(round, calls = calls.len(), "executing tool calls");
            let results = self.execute_tools(&calls).await;
            messages.push(ChatMessage::assistant(content));
            messages.push(ChatMessage::user(results));
            content = self.deps.llm.complete(messages, &options).await?;
        }

        Ok(content)
    }

    /// Run each call in order; failures become error text for the model
    async fn execute_tools(&self, calls: &[ToolCall]) -> String {
        let mut lines = Vec::with_capacity(calls.len());
        for call in calls {
            let text = match self.deps.tools.call_tool(&call.name, call.arguments.clone()).await {
                Ok(output) if output.is_error => {
                    tracing::warn!(tool = %call.name, "tool reported an error");
                    format!("Error: {}", output.text())
                }
                Ok(output) => output.text(),
                Err(e) => {
                    tracing::warn!(tool = %call.name, error = %e, "tool call failed");
                    format!("Error: {e}")
                }
            };
            lines.push(format!("[{}] {text}", call.name));
        }
        format!("工具调用结果：\n{}", lines.join("\n"))
    }

    /// Write results; failures are logged and do not stop the run
    async fn persist(&self, record_id: &str, result: &ProcessResult) -> Vec<Todo> {
        let store = &self.deps.store;
        let mut created = Vec::new();

        if let Some(summary) = &result.summary
            && let Err(e) = store.save_summary(record_id, summary).await
        {
            tracing::error!(record_id, error = %e, "failed to save summary");
        }

        if !result.todos.is_empty() {
            match store.create_todos(record_id, &result.todos).await {
                Ok(todos) => created = todos,
                Err(e) => tracing::error!(record_id, error = %e, "failed to save todos"),
            }
        }

        if !result.customer_requests.is_empty()
            && let Err(e) = store
                .create_customer_requests(record_id, &result.customer_requests)
                .await
        {
            tracing::error!(record_id, error = %e, "failed to save customer requests");
        }

        if !result.setting_changes.is_empty()
            && let Err(e) = store
                .create_setting_changes(record_id, &result.setting_changes)
                .await
        {
            tracing::error!(record_id, error = %e, "failed to save setting changes");
        }

        // Only existing tags are linked; the gateway never creates tags
        for name in &result.tags {
            match store.find_tag(name).await {
                Ok(Some(tag)) => {
                    if let Err(e) = store.tag_record(record_id, &tag.id).await {
                        tracing::error!(record_id, tag = %name, error = %e, "failed to tag record");
                    }
                }
                Ok(None) => tracing::debug!(record_id, tag = %name, "skipping unknown tag"),
                Err(e) => tracing::error!(record_id, tag = %name, error = %e, "failed to look up tag"),
            }
        }

        created
    }

    async fn mark(&self, record_id: &str, status: RecordStatus) {
        if let Err(e) = self.deps.store.update_record_status(record_id, status).await {
            tracing::error!(record_id, status = status.as_str(), error = %e, "failed to update record status");
        }
    }

    fn spawn_followups(&self, request: &ProcessRequest) {
        let today = chrono::Utc::now().date_naive();

        let memory = self.memory.clone();
        let (device_id, text) = (request.device_id.clone(), request.text.clone());
        self.deps.background.spawn("memory creation", async move {
            memory
                .maybe_create_memory(&device_id, &text, today)
                .await
                .map(|_| ())
        });

        let soul = self.soul.clone();
        let (device_id, text) = (request.device_id.clone(), request.text.clone());
        self.deps.background.spawn("soul update", async move {
            soul.update(&device_id, &text).await.map(|_| ())
        });
    }
}

/// Parse the model's final answer
///
/// Missing or non-array fields default to empty. Empty content or a
/// top-level parse failure is reported in `error`.
#[must_use]
pub fn parse_extraction(content: &str) -> ProcessResult {
    let content = strip_code_fence(content);
    if content.is_empty() {
        return ProcessResult::failed(EMPTY_RESPONSE);
    }

    let value = match serde_json::from_str::<Value>(content) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) | Err(_) => {
            let preview: String = content.chars().take(500).collect();
            tracing::error!(content = %preview, "AI response is not valid JSON");
            return ProcessResult::failed(INVALID_JSON);
        }
    };

    ProcessResult {
        todos: string_array(&value, "todos"),
        customer_requests: string_array(&value, "customer_requests"),
        setting_changes: string_array(&value, "setting_changes"),
        tags: string_array(&value, "tags"),
        summary: value
            .get("summary")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string),
        error: None,
    }
}

fn string_array(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn tool_calls(value: &Value) -> Vec<ToolCall> {
    let Some(calls) = value.get("tool_calls").and_then(Value::as_array) else {
        return Vec::new();
    };

    calls
        .iter()
        .filter_map(|call| {
            let name = call.get("name").and_then(Value::as_str)?.to_string();
            let arguments = match call.get("arguments") {
                // Some models send arguments as an encoded JSON string
                Some(Value::String(encoded)) => {
                    serde_json::from_str(encoded).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
                }
                Some(Value::Null) | None => Value::Object(serde_json::Map::new()),
                Some(arguments) => arguments.clone(),
            };
            Some(ToolCall { name, arguments })
        })
        .collect()
}

/// Drop a surrounding ```json fence if the model added one anyway
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map_or(trimmed, str::trim)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn missing_fields_default_to_empty() {
        let result = parse_extraction(r#"{"todos":["明天开会"],"tags":"not-a-list"}"#);
        assert_eq!(result.todos, vec!["明天开会".to_string()]);
        assert!(result.tags.is_empty());
        assert!(result.customer_requests.is_empty());
        assert!(result.setting_changes.is_empty());
        assert!(result.summary.is_none());
        assert!(result.error.is_none());
    }

    #[test]
    fn empty_and_invalid_content_are_errors() {
        assert_eq!(parse_extraction("  ").error.as_deref(), Some(EMPTY_RESPONSE));
        assert_eq!(parse_extraction("sure! here").error.as_deref(), Some(INVALID_JSON));
        assert_eq!(parse_extraction("[1, 2]").error.as_deref(), Some(INVALID_JSON));
    }

    #[test]
    fn fenced_json_is_accepted() {
        let result = parse_extraction("```json\n{\"summary\": \" 明天开会 \", \"todos\": []}\n```");
        assert_eq!(result.summary.as_deref(), Some("明天开会"));
        assert!(result.error.is_none());
    }

    #[test]
    fn tool_calls_are_read_leniently() {
        let value = json!({
            "tool_calls": [
                {"name": "calendar__list", "arguments": {"day": "today"}},
                {"name": "weather__now", "arguments": "{\"city\": \"杭州\"}"},
                {"name": "clock__now"},
                {"arguments": {}}
            ]
        });
        let calls = tool_calls(&value);
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].arguments, json!({"day": "today"}));
        assert_eq!(calls[1].arguments, json!({"city": "杭州"}));
        assert_eq!(calls[2].arguments, json!({}));
        assert!(tool_calls(&json!({"todos": []})).is_empty());
    }

    #[test]
    fn result_serializes_without_empty_options() {
        let value = serde_json::to_value(ProcessResult::default()).unwrap();
        assert_eq!(
            value,
            json!({"todos": [], "customer_requests": [], "setting_changes": [], "tags": []})
        );
    }
}
