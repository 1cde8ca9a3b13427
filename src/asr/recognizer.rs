//! Recognizer seam and the DashScope realtime implementation

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::protocol::{self, RecognizerEvent};
use crate::config::AsrConfig;
use crate::{Error, Result};

/// Buffered recognizer events per task
const EVENT_BUFFER: usize = 64;

/// Limit on opening the recognizer websocket
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Instruction for a running recognition task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerCommand {
    /// Raw PCM, forwarded verbatim
    Audio(Bytes),
    /// Ask the service to flush and finish
    Finish,
}

/// Remote speech recognizer
///
/// `start` opens one task. The task runs until the service finishes or
/// fails it, or until `commands` is closed, which tears the connection down.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Open a task and return its event stream
    ///
    /// # Errors
    ///
    /// Returns error if the connection or task setup fails
    async fn start(
        &self,
        task_id: &str,
        commands: mpsc::UnboundedReceiver<RecognizerCommand>,
    ) -> Result<mpsc::Receiver<RecognizerEvent>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// DashScope realtime recognition over a websocket
#[derive(Debug, Clone)]
pub struct DashScopeRecognizer {
    api_key: Option<String>,
    url: String,
    model: String,
    sample_rate: u32,
}

impl DashScopeRecognizer {
    #[must_use]
    pub fn new(config: &AsrConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            url: config.url.clone(),
            model: config.model.clone(),
            sample_rate: config.sample_rate,
        }
    }
}

#[async_trait]
impl Recognizer for DashScopeRecognizer {
    async fn start(
        &self,
        task_id: &str,
        commands: mpsc::UnboundedReceiver<RecognizerCommand>,
    ) -> Result<mpsc::Receiver<RecognizerEvent>> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| Error::Config("DASHSCOPE_API_KEY is not configured".to_string()))?;

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Config(format!("invalid ASR url: {e}")))?;
        let auth = HeaderValue::from_str(&format!("bearer {api_key}"))
            .map_err(|e| Error::Config(format!("invalid DASHSCOPE_API_KEY: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| {
                Error::Asr(format!(
                    "recognizer connection timed out after {}s",
                    CONNECT_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| Error::Asr(format!("recognizer connection failed: {e}")))?;
        let (mut sink, source) = ws.split();

        sink.send(Message::Text(
            protocol::run_task(task_id, &self.model, self.sample_rate).into(),
        ))
        .await
        .map_err(|e| Error::Asr(format!("failed to start recognition task: {e}")))?;

        tracing::debug!(task_id, model = %self.model, "recognition task requested");

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let pump = TaskPump {
            task_id: task_id.to_string(),
            sink,
            started: false,
            queued: Vec::new(),
            finish_requested: false,
        };
        tokio::spawn(pump.run(source, commands, events_tx));

        Ok(events_rx)
    }
}

/// Moves audio out and events in for one task
struct TaskPump {
    task_id: String,
    sink: WsSink,
    started: bool,
    /// Audio received before `task-started`
    queued: Vec<Bytes>,
    finish_requested: bool,
}

impl TaskPump {
    async fn run(
        mut self,
        mut source: WsSource,
        mut commands: mpsc::UnboundedReceiver<RecognizerCommand>,
        events: mpsc::Sender<RecognizerEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        // Session dropped or cancelled
                        tracing::debug!(task_id = %self.task_id, "closing recognizer connection");
                        let _ = self.sink.close().await;
                        return;
                    };
                    if let Err(e) = self.handle_command(command).await {
                        let _ = events.send(RecognizerEvent::ConnectionError(e.to_string())).await;
                        return;
                    }
                }
                frame = source.next() => {
                    let event = match frame {
                        Some(Ok(Message::Text(text))) => match protocol::parse_event(text.as_str()) {
                            Ok(Some(event)) => event,
                            Ok(None) => continue,
                            Err(e) => {
                                tracing::debug!(task_id = %self.task_id, error = %e, "skipping recognizer frame");
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => RecognizerEvent::ConnectionError(
                            "recognizer closed the connection".to_string(),
                        ),
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => RecognizerEvent::ConnectionError(e.to_string()),
                    };

                    if event == RecognizerEvent::Started
                        && let Err(e) = self.on_started().await
                    {
                        let _ = events.send(RecognizerEvent::ConnectionError(e.to_string())).await;
                        return;
                    }

                    let terminal = matches!(
                        event,
                        RecognizerEvent::Finished
                            | RecognizerEvent::Failed(_)
                            | RecognizerEvent::ConnectionError(_)
                    );
                    if events.send(event).await.is_err() || terminal {
                        let _ = self.sink.close().await;
                        return;
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: RecognizerCommand) -> Result<()> {
        match command {
            RecognizerCommand::Audio(chunk) if self.started => self.send_audio(chunk).await,
            RecognizerCommand::Audio(chunk) => {
                self.queued.push(chunk);
                Ok(())
            }
            RecognizerCommand::Finish if self.started => self.send_finish().await,
            RecognizerCommand::Finish => {
                self.finish_requested = true;
                Ok(())
            }
        }
    }

    async fn on_started(&mut self) -> Result<()> {
        self.started = true;
        tracing::debug!(task_id = %self.task_id, queued = self.queued.len(), "recognition task started");
        for chunk in std::mem::take(&mut self.queued) {
            self.send_audio(chunk).await?;
        }
        if self.finish_requested {
            self.send_finish().await?;
        }
        Ok(())
    }

    async fn send_audio(&mut self, chunk: Bytes) -> Result<()> {
        self.sink
            .send(Message::Binary(chunk))
            .await
            .map_err(|e| Error::Asr(format!("failed to forward audio: {e}")))
    }

    async fn send_finish(&mut self) -> Result<()> {
        self.sink
            .send(Message::Text(protocol::finish_task(&self.task_id).into()))
            .await
            .map_err(|e| Error::Asr(format!("failed to finish recognition task: {e}")))
    }
}
