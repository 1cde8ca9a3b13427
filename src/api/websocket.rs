//! WebSocket connection router
//!
//! Text frames carry JSON control messages, binary frames carry PCM audio
//! for the device this connection last started an ASR session for.
//! Everything sent back goes through a per-connection outbox drained by a
//! writer task.
//!
//! Pipeline messages (`process`, `chat.*`, `todo.aggregate`) run one at a
//! time, in arrival order, on a per-connection worker. The reader only
//! queues them, so audio intake and `asr.*` control never wait on a
//! model call.

use std::sync::{Arc, Mutex, PoisonError};

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};

use super::AppState;
use crate::protocol::{ClientMessage, Outbox, ServerMessage, parse_client_message};

/// Outgoing frames buffered per connection
const OUTBOX_CAPACITY: usize = 64;

/// Pipeline messages waiting for the worker
const PIPELINE_QUEUE: usize = 32;

/// Build WebSocket router; clients may connect on `/ws` or `/`
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/", get(ws_upgrade))
        .with_state(state)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-connection routing state
struct Connection {
    state: Arc<AppState>,
    outbox: Outbox,
    pipelines: mpsc::Sender<ClientMessage>,
    /// Device whose ASR session receives binary frames
    device_id: Arc<Mutex<Option<String>>>,
}

impl Connection {
    fn mapped_device(&self) -> Option<String> {
        self.device_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn map_device(&self, device_id: &str) {
        *self.device_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(device_id.to_string());
    }

    fn unmap_device(&self) {
        self.device_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    async fn send(&self, message: ServerMessage) {
        if self.outbox.send(message).await.is_err() {
            tracing::debug!("outbox closed, dropping message");
        }
    }

    fn handle_audio(&self, chunk: Bytes) {
        let Some(device_id) = self.mapped_device() else {
            tracing::trace!(len = chunk.len(), "audio without an ASR session");
            return;
        };
        if !self.state.asr.send_audio(&device_id, chunk) {
            tracing::trace!(device_id = %device_id, "audio dropped");
        }
    }

    async fn handle_text(&self, text: &str) {
        let message = match parse_client_message(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "rejected control frame");
                self.send(ServerMessage::error(e.to_string())).await;
                return;
            }
        };
        tracing::debug!(kind = message.kind(), device_id = message.device_id(), "control message");

        match message {
            ClientMessage::AsrStart(start) => {
                self.map_device(&start.device_id);
                self.state.asr.start(start, self.outbox.clone());
            }
            ClientMessage::AsrStop(stop) => {
                self.state.asr.stop(&stop.device_id, stop.save_audio);
            }
            ClientMessage::AsrCancel(cancel) => {
                self.state.asr.cancel(&cancel.device_id);
                self.unmap_device();
            }
            other => self.enqueue(other).await,
        }
    }

    async fn enqueue(&self, message: ClientMessage) {
        match self.pipelines.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                tracing::warn!(kind = message.kind(), device_id = message.device_id(), "pipeline queue full");
                self.send(ServerMessage::error("Too many pending requests")).await;
            }
            Err(TrySendError::Closed(_)) => tracing::debug!("pipeline worker gone"),
        }
    }
}

/// Drain queued pipeline messages one at a time
async fn run_pipelines(state: Arc<AppState>, outbox: Outbox, mut queue: mpsc::Receiver<ClientMessage>) {
    while let Some(message) = queue.recv().await {
        let kind = message.kind();
        if let Err(e) = run_pipeline(&state, &outbox, message).await {
            tracing::warn!(kind, error = %e, "handler failed");
            let _ = outbox.send(ServerMessage::error(e.to_string())).await;
        }
    }
}

async fn run_pipeline(state: &AppState, outbox: &Outbox, message: ClientMessage) -> crate::Result<()> {
    match message {
        ClientMessage::Process(request) => {
            let result = state.process.run(request).await;
            let _ = outbox.send(ServerMessage::ProcessResult(result)).await;
        }
        ClientMessage::ChatStart(start) => {
            state.chat.start(start, outbox).await?;
        }
        ClientMessage::ChatMessage(turn) => {
            state.chat.message(turn, outbox).await?;
        }
        ClientMessage::ChatEnd(end) => {
            state.chat.end(&end.device_id).await;
            let _ = outbox
                .send(ServerMessage::ChatDone {
                    full_text: String::new(),
                })
                .await;
        }
        ClientMessage::TodoAggregate(request) => {
            let diary_entry = state.todos.aggregate(&request.device_id).await?;
            let _ = outbox.send(ServerMessage::TodoResult { diary_entry }).await;
        }
        ClientMessage::AsrStart(_) | ClientMessage::AsrStop(_) | ClientMessage::AsrCancel(_) => {}
    }
    Ok(())
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (outbox, mut rx) = mpsc::channel::<ServerMessage>(OUTBOX_CAPACITY);

    tracing::info!("WebSocket connected");

    // Spawn task to forward messages from the outbox to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode message"),
            }
        }
    });

    // Ends once the connection is gone and the queue is drained
    let (pipelines, queue) = mpsc::channel(PIPELINE_QUEUE);
    tokio::spawn(run_pipelines(Arc::clone(&state), outbox.clone(), queue));

    let device_id = Arc::new(Mutex::new(None));
    let connection = Connection {
        state: Arc::clone(&state),
        outbox,
        pipelines,
        device_id: Arc::clone(&device_id),
    };

    // Handle incoming frames
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = receiver.next().await {
            match frame {
                Message::Text(text) => connection.handle_text(text.as_str()).await,
                Message::Binary(data) => connection.handle_audio(data),
                Message::Close(_) => {
                    tracing::info!("WebSocket closed by client");
                    break;
                }
                _ => {}
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let mapped = device_id.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(device_id) = mapped
        && state.asr.cancel(&device_id)
    {
        tracing::info!(device_id = %device_id, "cancelled ASR session of closed connection");
    }

    tracing::info!("WebSocket disconnected");
}
