//! Soul manager: one continuously merged AI identity document per device

use std::sync::Arc;

use crate::db::Store;
use crate::llm::{ChatMessage, CompletionClient, CompletionOptions, JSON_TEMPERATURE};
use crate::{Error, Result};

const MERGE_PROMPT: &str = "你负责维护 AI 助手的身份定义（Soul）。基于现有的 AI 身份定义和用户的新互动，更新 AI 的身份。\nAI 身份应包含：用户对 AI 的要求和期望、AI 的行为准则、交互风格偏好、专注领域等。\n用 markdown 格式，简洁但全面。只输出更新后的完整 AI 身份定义。\n如果新互动没有对 AI 行为的要求，返回原定义不变。";

/// Marker sent in place of an empty persona
const BLANK_SOUL: &str = "（空白，第一次互动）";

/// Loads and merges persona documents
#[derive(Clone)]
pub struct SoulManager {
    store: Arc<dyn Store>,
    llm: Arc<dyn CompletionClient>,
}

impl SoulManager {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, llm: Arc<dyn CompletionClient>) -> Self {
        Self { store, llm }
    }

    /// Current persona document, if any
    ///
    /// # Errors
    ///
    /// Returns error if the store read fails
    pub async fn load(&self, device_id: &str) -> Result<Option<String>> {
        self.store.soul(device_id).await
    }

    /// Merge `interaction` into the persona and persist the full result
    ///
    /// The stored document is replaced by whatever the model returns.
    ///
    /// # Errors
    ///
    /// Returns error if the completion call fails, returns nothing, or the
    /// write fails
    pub async fn update(&self, device_id: &str, interaction: &str) -> Result<String> {
        let current = self.load(device_id).await?.unwrap_or_default();
        let messages = [
            ChatMessage::system(MERGE_PROMPT),
            ChatMessage::user(merge_request(&current, interaction)),
        ];

        let updated = self
            .llm
            .complete(&messages, &CompletionOptions::text(JSON_TEMPERATURE))
            .await?;

        // An empty reply would wipe the persona
        if updated.trim().is_empty() {
            return Err(Error::Llm("AI returned an empty persona".to_string()));
        }

        self.store.save_soul(device_id, &updated).await?;
        tracing::debug!(device_id, len = updated.len(), "persona updated");
        Ok(updated)
    }
}

fn merge_request(current: &str, interaction: &str) -> String {
    let current = if current.is_empty() { BLANK_SOUL } else { current };
    format!("## 现有 AI 身份定义\n{current}\n\n## 新互动内容\n{interaction}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_interaction_uses_blank_marker() {
        let request = merge_request("", "请叫我小王");
        assert!(request.starts_with("## 现有 AI 身份定义\n（空白，第一次互动）"));
        assert!(request.ends_with("## 新互动内容\n请叫我小王"));
    }

    #[test]
    fn existing_persona_is_carried() {
        let request = merge_request("- 语气温和", "多用要点");
        assert!(request.contains("- 语气温和\n\n## 新互动内容"));
    }
}
