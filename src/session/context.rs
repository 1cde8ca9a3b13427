//! Trimmed message history with a separate system prompt

use crate::llm::{ChatMessage, Role};

/// Leading messages that survive trimming
const ANCHOR_MESSAGES: usize = 2;

/// Conversation window for one session
#[derive(Debug, Clone)]
pub struct SessionContext {
    messages: Vec<ChatMessage>,
    system_prompt: String,
    max_messages: usize,
}

impl SessionContext {
    #[must_use]
    pub const fn new(max_messages: usize) -> Self {
        Self {
            messages: Vec::new(),
            system_prompt: String::new(),
            max_messages,
        }
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }

    #[must_use]
    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Append a message, then keep the first two and the most recent rest
    pub fn add_message(&mut self, message: ChatMessage) {
        self.messages.push(message);

        if self.messages.len() > self.max_messages {
            let anchors = ANCHOR_MESSAGES.min(self.max_messages);
            let excess = self.messages.len() - self.max_messages;
            self.messages.drain(anchors..anchors + excess);
        }
    }

    pub fn add(&mut self, role: Role, content: impl Into<String>) {
        self.add_message(ChatMessage {
            role,
            content: content.into(),
        });
    }

    /// System prompt (when set) followed by the history
    #[must_use]
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if !self.system_prompt.is_empty() {
            out.push(ChatMessage::system(self.system_prompt.clone()));
        }
        out.extend(self.messages.iter().cloned());
        out
    }

    /// History without the system prompt
    #[must_use]
    pub fn history(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.system_prompt.clear();
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new(super::MAX_MESSAGES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MAX_MESSAGES;

    #[test]
    fn trimming_keeps_anchors_and_recent() {
        let mut ctx = SessionContext::default();
        for i in 0..60 {
            ctx.add(Role::User, format!("m{i}"));
        }

        let history = ctx.history();
        assert_eq!(history.len(), MAX_MESSAGES);
        assert_eq!(history[0].content, "m0");
        assert_eq!(history[1].content, "m1");
        assert_eq!(history[2].content, "m12");
        assert_eq!(history[MAX_MESSAGES - 1].content, "m59");

        // Original relative order is preserved
        let numbers: Vec<usize> = history
            .iter()
            .map(|m| m.content[1..].parse().unwrap())
            .collect();
        assert!(numbers.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn system_prompt_is_kept_apart() {
        let mut ctx = SessionContext::new(3);
        ctx.set_system_prompt("sys");
        for i in 0..5 {
            ctx.add(Role::Assistant, i.to_string());
        }

        let messages = ctx.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], ChatMessage::system("sys"));
        assert_eq!(ctx.history().len(), 3);
        assert_eq!(ctx.history()[2].content, "4");
    }

    #[test]
    fn clear_drops_everything() {
        let mut ctx = SessionContext::default();
        ctx.set_system_prompt("sys");
        ctx.add(Role::User, "hi");
        ctx.clear();
        assert!(ctx.messages().is_empty());
    }
}
