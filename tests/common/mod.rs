//! Shared test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tokio::sync::mpsc;

use v2note_gateway::asr::{Recognizer, RecognizerCommand, RecognizerEvent};
use v2note_gateway::background::BackgroundTasks;
use v2note_gateway::db::{self, SqliteStore, Store};
use v2note_gateway::llm::{ChatMessage, CompletionClient, CompletionOptions, TextStream};
use v2note_gateway::pipeline::PipelineDeps;
use v2note_gateway::protocol::ServerMessage;
use v2note_gateway::session::SessionStore;
use v2note_gateway::skills::SkillLoader;
use v2note_gateway::tools::ToolRegistry;
use v2note_gateway::{DbPool, Error, Result};

/// Prompt markers used to route scripted replies
pub const PROCESS: &str = "转写清理规则";
pub const REVIEW_CHAT: &str = "复盘对话";
pub const COMMAND_CHAT: &str = "协助整理笔记";
pub const MEMORY_JUDGE: &str = "长期记忆";
pub const SOUL_MERGE: &str = "AI 助手的身份定义";
pub const ESTIMATE: &str = "时间管理助手";
pub const DIARY: &str = "日记条目";

/// Set up an in-memory store; the pool is returned for direct assertions
#[must_use]
pub fn setup_store() -> (DbPool, Arc<SqliteStore>) {
    let pool = db::init_memory().expect("failed to init test db");
    (pool.clone(), Arc::new(SqliteStore::new(pool)))
}

struct Rule {
    needle: String,
    replies: VecDeque<std::result::Result<String, String>>,
}

/// Completion client answering by system-prompt marker
///
/// Each rule holds a queue of replies; the last reply repeats. Prompts no
/// rule matches get `{}`.
#[derive(Default)]
pub struct ScriptedCompletion {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedCompletion {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a reply for prompts containing `needle`
    pub fn on(&self, needle: &str, reply: &str) -> &Self {
        self.push(needle, Ok(reply.to_string()))
    }

    /// Queue a failure for prompts containing `needle`
    pub fn fail_on(&self, needle: &str, message: &str) -> &Self {
        self.push(needle, Err(message.to_string()))
    }

    fn push(&self, needle: &str, reply: std::result::Result<String, String>) -> &Self {
        let mut rules = self.rules.lock().unwrap();
        match rules.iter_mut().find(|r| r.needle == needle) {
            Some(rule) => rule.replies.push_back(reply),
            None => rules.push(Rule {
                needle: needle.to_string(),
                replies: VecDeque::from([reply]),
            }),
        }
        self
    }

    /// Every message list sent so far, in call order
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls whose system prompt contains `needle`
    pub fn calls_for(&self, needle: &str) -> Vec<Vec<ChatMessage>> {
        self.calls()
            .into_iter()
            .filter(|messages| messages.first().is_some_and(|m| m.content.contains(needle)))
            .collect()
    }

    fn answer(&self, messages: &[ChatMessage]) -> Result<String> {
        self.calls.lock().unwrap().push(messages.to_vec());
        let system = messages.first().map(|m| m.content.as_str()).unwrap_or_default();

        let mut rules = self.rules.lock().unwrap();
        let Some(rule) = rules.iter_mut().find(|r| system.contains(&r.needle)) else {
            return Ok("{}".to_string());
        };
        let reply = if rule.replies.len() > 1 {
            rule.replies.pop_front().unwrap()
        } else {
            rule.replies.front().cloned().unwrap()
        };
        reply.map_err(Error::Llm)
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletion {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _options: &CompletionOptions,
    ) -> Result<String> {
        self.answer(messages)
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        _options: &CompletionOptions,
    ) -> Result<TextStream> {
        let text = self.answer(messages)?;
        // Two characters per chunk, like a slow upstream
        let chars: Vec<char> = text.chars().collect();
        let chunks: Vec<Result<String>> = chars
            .chunks(2)
            .map(|c| Ok(c.iter().collect::<String>()))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// One recognizer connection opened by the code under test
pub struct RecognizerTask {
    pub task_id: String,
    pub events: mpsc::Sender<RecognizerEvent>,
    pub commands: mpsc::UnboundedReceiver<RecognizerCommand>,
}

impl RecognizerTask {
    pub async fn emit(&self, event: RecognizerEvent) {
        self.events.send(event).await.expect("recognizer driver gone");
    }

    /// Next command, failing the test after a second
    pub async fn next_command(&mut self) -> Option<RecognizerCommand> {
        tokio::time::timeout(Duration::from_secs(1), self.commands.recv())
            .await
            .expect("timed out waiting for a recognizer command")
    }
}

/// Recognizer handing every opened task to the test
pub struct ScriptedRecognizer {
    tasks: mpsc::UnboundedSender<RecognizerTask>,
    failure: Mutex<Option<Error>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedRecognizer {
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RecognizerTask>) {
        let (tasks, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tasks,
                failure: Mutex::new(None),
                delay: Mutex::new(None),
            }),
            rx,
        )
    }

    /// Make the next connection attempt fail
    pub fn fail_next(&self, error: Error) {
        *self.failure.lock().unwrap() = Some(error);
    }

    /// Make the next connection attempt hang for `delay` first
    pub fn delay_next(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl Recognizer for ScriptedRecognizer {
    async fn start(
        &self,
        task_id: &str,
        commands: mpsc::UnboundedReceiver<RecognizerCommand>,
    ) -> Result<mpsc::Receiver<RecognizerEvent>> {
        let delay = self.delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failure.lock().unwrap().take() {
            return Err(error);
        }

        let (events, rx) = mpsc::channel(64);
        let _ = self.tasks.send(RecognizerTask {
            task_id: task_id.to_string(),
            events,
            commands,
        });
        Ok(rx)
    }
}

/// Pipeline collaborators over the given store and completion client
pub fn deps(store: Arc<dyn Store>, llm: Arc<dyn CompletionClient>) -> PipelineDeps {
    PipelineDeps {
        store,
        llm,
        tools: Arc::new(ToolRegistry::new()),
        skills: SkillLoader::new("/nonexistent/skills"),
        sessions: SessionStore::default(),
        background: BackgroundTasks::new(),
        agent_prompt: Arc::from("测试助手"),
    }
}

/// Next outbox message, failing the test after two seconds
pub async fn recv(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("outbox closed")
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
