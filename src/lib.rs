//! v2note Gateway - real-time dialogue gateway for voice journaling
//!
//! This library provides the core functionality of the gateway:
//! - Streaming speech recognition relayed from device audio
//! - Structured extraction of todos, requests, and tags from transcripts
//! - Streaming review and command chats over recorded history
//! - Per-device memory, persona, and skill configuration
//! - Tool servers the model may call during extraction
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Clients (WebSocket / HTTP)              │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  v2note Gateway                      │
//! │  Router │ ASR │ Process │ Chat │ Memory │ Skills     │
//! └───────┬────────────┬─────────────┬──────────────────┘
//!         │            │             │
//! ┌───────▼──────┐ ┌───▼────────┐ ┌──▼──────────────────┐
//! │  Recognizer  │ │ Completion │ │ Store │ Tool servers│
//! └──────────────┘ └────────────┘ └─────────────────────┘
//! ```

pub mod api;
pub mod asr;
pub mod background;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod memory;
pub mod persona;
pub mod pipeline;
pub mod prompt;
pub mod protocol;
pub mod session;
pub mod skills;
pub mod storage;
pub mod tools;

pub use config::Config;
pub use db::{DbConn, DbPool, SqliteStore, Store};
pub use error::{Error, Result};
pub use pipeline::{ChatPipeline, ProcessPipeline, ProcessRequest, ProcessResult};
pub use protocol::{ClientMessage, ServerMessage};
pub use skills::{Skill, SkillLoader, SkillMetadata};
