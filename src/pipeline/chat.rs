//! Review and command dialogues streamed chunk by chunk
//!
//! A chat holds the device's session lock for the whole turn, so extraction
//! runs for the same device wait until the reply has finished streaming.

use futures::StreamExt;

use super::PipelineDeps;
use crate::db::{DateRange, DatedTranscript};
use crate::llm::{CompletionOptions, Role};
use crate::memory::MemoryManager;
use crate::persona::SoulManager;
use crate::prompt::{PromptContext, PromptMode, build_system_prompt};
use crate::protocol::{ChatStart, ChatTurn, Outbox, ServerMessage};
use crate::session::{Session, SessionGuard, SessionMode};
use crate::{Error, Result};

/// Seed text when the requested range has no records
pub const NO_RECORDS_SUFFIX: &str = "这段时间暂无录音记录。";

/// Opening turn when neither a range seed nor an initial message exists
const OPENING_TURN: &str = "请开始对话。";

/// Characters of each turn kept in the persona digest
const DIGEST_TURN_CHARS: usize = 200;

/// Streaming chat over the device session
#[derive(Clone)]
pub struct ChatPipeline {
    deps: PipelineDeps,
    memory: MemoryManager,
    soul: SoulManager,
}

impl ChatPipeline {
    #[must_use]
    pub fn new(deps: PipelineDeps) -> Self {
        Self {
            memory: deps.memory(),
            soul: deps.soul(),
            deps,
        }
    }

    /// Open a chat and stream the first assistant reply
    ///
    /// Any earlier history of the session is discarded.
    ///
    /// # Errors
    ///
    /// Returns error if the completion stream cannot be opened or fails
    /// mid-reply
    pub async fn start(&self, request: ChatStart, outbox: &Outbox) -> Result<String> {
        let device_id = request.device_id.as_str();
        let local = Some(&request.local_config);
        tracing::info!(device_id, mode = ?request.mode, range = ?request.date_range, "chat started");

        let mut session = self.deps.sessions.lock(device_id).await;
        session.mode = SessionMode::Chatting;
        session.context.clear();

        let soul = self.deps.resolve_soul(device_id, local).await;
        let skills = self.deps.active_skills(device_id, local).await;
        let memory = self
            .memory
            .load_context(device_id, &session.short_term, request.date_range.as_ref())
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(device_id, error = %e, "failed to load memory");
                Vec::new()
            });

        let system_prompt = build_system_prompt(&PromptContext {
            skills: &skills,
            soul: soul.as_deref(),
            memory: &memory,
            ..PromptContext::new(&self.deps.agent_prompt, PromptMode::Chat(request.mode))
        });
        session.context.set_system_prompt(system_prompt);

        if let Some(range) = &request.date_range {
            let transcripts = self
                .deps
                .store
                .transcripts_in_range(device_id, range)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(device_id, error = %e, "failed to load transcripts");
                    Vec::new()
                });
            session.context.add(Role::User, review_seed(range, &transcripts));
        }

        if let Some(initial) = request.initial_message.as_deref().filter(|m| !m.trim().is_empty()) {
            session.context.add(Role::User, initial);
            session.short_term.add(initial);
        }

        if session.context.history().is_empty() {
            session.context.add(Role::User, OPENING_TURN);
        }

        self.stream_reply(&mut session, outbox).await
    }

    /// Add a user turn and stream the reply
    ///
    /// # Errors
    ///
    /// Returns `No active chat session` if the device is not chatting, or
    /// the streaming error
    pub async fn message(&self, turn: ChatTurn, outbox: &Outbox) -> Result<String> {
        let mut session = self.deps.sessions.lock(&turn.device_id).await;
        if session.mode != SessionMode::Chatting {
            return Err(Error::Session("No active chat session".to_string()));
        }

        session.context.add(Role::User, turn.text.as_str());
        session.short_term.add(turn.text);
        self.stream_reply(&mut session, outbox).await
    }

    /// Close the chat and fold the dialogue into the persona
    ///
    /// Returns whether a chat was open.
    pub async fn end(&self, device_id: &str) -> bool {
        let mut session = self.deps.sessions.lock(device_id).await;
        if session.mode != SessionMode::Chatting {
            return false;
        }

        let digest = dialogue_digest(&session);
        session.mode = SessionMode::Idle;
        session.context.clear();
        drop(session);

        if let Some(digest) = digest {
            let soul = self.soul.clone();
            let device_id = device_id.to_string();
            self.deps.background.spawn("chat soul update", async move {
                soul.update(&device_id, &digest).await.map(|_| ())
            });
        }
        tracing::info!(device_id, "chat ended");
        true
    }

    async fn stream_reply(&self, session: &mut SessionGuard, outbox: &Outbox) -> Result<String> {
        let messages = session.context.messages();
        let mut stream = self
            .deps
            .llm
            .stream(&messages, &CompletionOptions::default())
            .await?;

        let mut full_text = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            full_text.push_str(&chunk);
            // A closed outbox means the client left; keep the reply for history
            let _ = outbox.send(ServerMessage::ChatChunk { text: chunk }).await;
        }

        session.context.add(Role::Assistant, full_text.as_str());
        let _ = outbox
            .send(ServerMessage::ChatDone {
                full_text: full_text.clone(),
            })
            .await;

        tracing::debug!(device_id = %session.device_id, len = full_text.len(), "chat reply streamed");
        Ok(full_text)
    }
}

fn review_seed(range: &DateRange, transcripts: &[DatedTranscript]) -> String {
    if transcripts.is_empty() {
        return format!("请开始 {} 到 {} 的复盘。{NO_RECORDS_SUFFIX}", range.start, range.end);
    }

    let records = transcripts
        .iter()
        .map(|t| format!("[{}] {}", t.created_at.get(..10).unwrap_or(&t.created_at), t.text))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "以下是 {} 到 {} 期间的记录内容：\n\n{records}\n\n请基于这些内容开始复盘对话。",
        range.start, range.end
    )
}

/// Condensed dialogue for the persona merge, `None` without history
fn dialogue_digest(session: &Session) -> Option<String> {
    let history = session.context.history();
    if history.is_empty() {
        return None;
    }

    let lines: Vec<String> = history
        .iter()
        .map(|m| {
            let content: String = m.content.chars().take(DIGEST_TURN_CHARS).collect();
            format!("{}: {content}", m.role.as_str())
        })
        .collect();
    Some(format!("[复盘对话] {}", lines.join("\n")))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn range() -> DateRange {
        DateRange {
            start: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2026, 3, 7).unwrap(),
        }
    }

    #[test]
    fn empty_range_seed_mentions_no_records() {
        assert_eq!(
            review_seed(&range(), &[]),
            "请开始 2026-03-01 到 2026-03-07 的复盘。这段时间暂无录音记录。"
        );
    }

    #[test]
    fn range_seed_lists_dated_transcripts() {
        let transcripts = [
            DatedTranscript {
                record_id: "r1".to_string(),
                text: "见了客户".to_string(),
                created_at: "2026-03-02 10:00:00".to_string(),
            },
            DatedTranscript {
                record_id: "r2".to_string(),
                text: "写完方案".to_string(),
                created_at: "2026-03-03 16:00:00".to_string(),
            },
        ];
        let seed = review_seed(&range(), &transcripts);
        assert!(seed.starts_with("以下是 2026-03-01 到 2026-03-07 期间的记录内容：\n\n"));
        assert!(seed.contains("[2026-03-02] 见了客户\n\n[2026-03-03] 写完方案"));
        assert!(seed.ends_with("请基于这些内容开始复盘对话。"));
    }
}
