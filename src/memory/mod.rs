//! Memory manager
//!
//! Blends the session's short-term ring with persisted long-term entries,
//! and asks the completion service whether new content deserves to be kept.

mod short_term;

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Deserialize;

pub use short_term::{SHORT_TERM_CAPACITY, ShortTermEntry, ShortTermMemory};

use crate::Result;
use crate::db::{DateRange, MemoryEntry, Store};
use crate::llm::{ChatMessage, CompletionClient, CompletionOptions};

/// Importance assigned when the judgment omits one
pub const DEFAULT_IMPORTANCE: u8 = 5;

const JUDGE_PROMPT: &str = "判断以下内容是否值得作为长期记忆保存。只保存重要的事实、决定、承诺或关键事件。\n返回 JSON: {\"save\": true/false, \"summary\": \"简洁摘要\", \"importance\": 1-10}\n如果不值得保存，返回 {\"save\": false}";

/// Structured retention judgment returned by the model
#[derive(Debug, Default, Deserialize)]
struct MemoryJudgment {
    #[serde(default)]
    save: bool,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    importance: Option<i64>,
}

/// Short- and long-term memory for devices
#[derive(Clone)]
pub struct MemoryManager {
    store: Arc<dyn Store>,
    llm: Arc<dyn CompletionClient>,
}

impl MemoryManager {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, llm: Arc<dyn CompletionClient>) -> Self {
        Self { store, llm }
    }

    /// Context lines for a prompt, optionally limited to a date range
    ///
    /// # Errors
    ///
    /// Returns error if long-term memory cannot be read
    pub async fn load_context(
        &self,
        device_id: &str,
        short_term: &ShortTermMemory,
        range: Option<&DateRange>,
    ) -> Result<Vec<String>> {
        let long_term = self.store.memories(device_id, range).await?;
        Ok(compose_context(short_term, &long_term))
    }

    /// Ask the model whether `content` is worth keeping; persist it if so
    ///
    /// Returns whether an entry was saved. An unparseable judgment saves nothing.
    ///
    /// # Errors
    ///
    /// Returns error if the completion call or the write fails
    pub async fn maybe_create_memory(
        &self,
        device_id: &str,
        content: &str,
        date: NaiveDate,
    ) -> Result<bool> {
        let messages = [ChatMessage::system(JUDGE_PROMPT), ChatMessage::user(content)];
        let response = self
            .llm
            .complete(&messages, &CompletionOptions::json())
            .await?;

        let judgment: MemoryJudgment = match serde_json::from_str(&response) {
            Ok(j) => j,
            Err(e) => {
                tracing::debug!(device_id, error = %e, "unparseable memory judgment");
                return Ok(false);
            }
        };

        let Some(summary) = judgment.summary.filter(|s| !s.trim().is_empty()) else {
            return Ok(false);
        };
        if !judgment.save {
            return Ok(false);
        }

        let importance = judgment
            .importance
            .map_or(DEFAULT_IMPORTANCE, |i| u8::try_from(i.clamp(1, 10)).unwrap_or(DEFAULT_IMPORTANCE));

        self.store
            .save_memory(device_id, &summary, Some(date), importance)
            .await?;
        tracing::info!(device_id, importance, "long-term memory saved");
        Ok(true)
    }
}

/// Short-term summary line first, then long-term entries in the given order
#[must_use]
pub fn compose_context(short_term: &ShortTermMemory, long_term: &[MemoryEntry]) -> Vec<String> {
    let mut lines = Vec::with_capacity(long_term.len() + 1);
    if !short_term.is_empty() {
        lines.push(format!("[近期对话] {}", short_term.summary()));
    }
    for entry in long_term {
        let date = entry
            .source_date
            .map_or_else(|| "未知日期".to_string(), |d| d.to_string());
        lines.push(format!("[{date}] {}", entry.content));
    }
    lines
}
