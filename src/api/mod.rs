//! HTTP and WebSocket surface of the gateway

pub mod health;
pub mod process;
pub mod websocket;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::asr::{AsrManager, Recognizer};
use crate::pipeline::{ChatPipeline, PipelineDeps, ProcessPipeline, TodoAggregator};
use crate::storage::AudioStore;

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    pub asr: AsrManager,
    pub process: Arc<ProcessPipeline>,
    pub chat: ChatPipeline,
    pub todos: TodoAggregator,
}

impl AppState {
    /// Wire the pipelines and the ASR manager over shared collaborators
    #[must_use]
    pub fn new(
        deps: PipelineDeps,
        recognizer: Arc<dyn Recognizer>,
        audio: Arc<dyn AudioStore>,
    ) -> Self {
        let process = Arc::new(ProcessPipeline::new(deps.clone()));
        let asr = AsrManager::new(
            recognizer,
            Arc::clone(&deps.store),
            audio,
            Arc::clone(&process),
            deps.background,
        );

        Self {
            asr,
            process,
            chat: ChatPipeline::new(deps.clone()),
            todos: TodoAggregator::new(Arc::clone(&deps.store), Arc::clone(&deps.llm)),
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<AppState>,
    port: u16,
}

impl ApiServer {
    #[must_use]
    pub const fn new(state: Arc<AppState>, port: u16) -> Self {
        Self { state, port }
    }

    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .merge(websocket::router(Arc::clone(&self.state)))
            .merge(process::router(Arc::clone(&self.state)))
            .merge(health::router())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "gateway listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }
}
