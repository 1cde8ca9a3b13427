//! Configuration management for the gateway
//!
//! Priority is env > TOML file > default.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::Result;

/// Default OpenAI-compatible endpoint of the hosted completion service
pub const DEFAULT_LLM_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

/// Default completion model
pub const DEFAULT_LLM_MODEL: &str = "qwen-plus";

/// Default realtime recognizer endpoint
pub const DEFAULT_ASR_URL: &str = "wss://dashscope.aliyuncs.com/api-ws/v1/inference/";

/// Default realtime recognizer model
pub const DEFAULT_ASR_MODEL: &str = "paraformer-realtime-v2";

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WebSocket server
    pub server: ServerConfig,

    /// Completion service
    pub llm: LlmConfig,

    /// Speech recognition service
    pub asr: AsrConfig,

    /// In-memory session lifetime
    pub session: SessionConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Database and saved audio live here
    pub data_dir: PathBuf,
    pub skills_dir: PathBuf,
    pub agent_prompt_path: Option<PathBuf>,
    pub tools_config_path: Option<PathBuf>,
}

/// Completion service configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub base_timeout: Duration,
}

/// Realtime recognizer configuration
#[derive(Debug, Clone)]
pub struct AsrConfig {
    pub api_key: Option<String>,
    pub url: String,
    pub model: String,
    pub sample_rate: u32,
}

/// Session lifetime configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Idle time after which a session is evicted
    pub ttl: Duration,
    pub sweep_interval: Duration,
    pub max_messages: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            max_messages: crate::session::MAX_MESSAGES,
        }
    }
}

/// Return the XDG data directory for the gateway
///
/// Uses `~/.local/share/v2note` on Linux
#[must_use]
pub fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/v2note"),
        |d| d.data_dir().join("v2note"),
    )
}

impl Config {
    /// Load configuration from the environment and the optional TOML file
    ///
    /// # Errors
    ///
    /// Returns error if an explicitly given config file cannot be loaded
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(config_path)?;
        let config = Self::from_sources(fc, |key| std::env::var(key).ok());

        if config.llm.api_key.is_none() {
            tracing::warn!("DASHSCOPE_API_KEY is not set, AI and ASR calls will fail");
        }

        Ok(config)
    }

    /// Merge a parsed config file with an environment lookup
    pub fn from_sources(
        fc: file::GatewayConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let api_key = env("DASHSCOPE_API_KEY").filter(|k| !k.is_empty());

        let server = ServerConfig {
            port: env("GATEWAY_PORT")
                .and_then(|s| s.parse().ok())
                .or(fc.server.port)
                .unwrap_or(3001),
            data_dir: env("V2NOTE_DATA_DIR")
                .or(fc.server.data_dir)
                .map_or_else(default_data_dir, PathBuf::from),
            skills_dir: env("V2NOTE_SKILLS_DIR")
                .or(fc.server.skills_dir)
                .map_or_else(|| PathBuf::from("skills"), PathBuf::from),
            agent_prompt_path: env("V2NOTE_AGENT_PROMPT")
                .or(fc.server.agent_prompt_path)
                .map(PathBuf::from),
            tools_config_path: env("V2NOTE_TOOLS_CONFIG")
                .or(fc.server.tools_config_path)
                .map(PathBuf::from),
        };

        let llm = LlmConfig {
            api_key: api_key.clone().or(fc.llm.api_key),
            base_url: env("AI_BASE_URL")
                .or(fc.llm.base_url)
                .unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string()),
            model: env("AI_MODEL")
                .or(fc.llm.model)
                .unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
            // AI_TIMEOUT is in milliseconds
            base_timeout: env("AI_TIMEOUT")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .or_else(|| fc.llm.base_timeout_secs.map(Duration::from_secs))
                .unwrap_or(crate::llm::BASE_TIMEOUT),
        };

        let asr = AsrConfig {
            api_key: api_key.or(fc.asr.api_key),
            url: env("ASR_WS_URL")
                .or(fc.asr.url)
                .unwrap_or_else(|| DEFAULT_ASR_URL.to_string()),
            model: fc.asr.model.unwrap_or_else(|| DEFAULT_ASR_MODEL.to_string()),
            sample_rate: fc.asr.sample_rate.unwrap_or(16_000),
        };

        let defaults = SessionConfig::default();
        let session = SessionConfig {
            ttl: fc.session.ttl_secs.map_or(defaults.ttl, Duration::from_secs),
            sweep_interval: fc
                .session
                .sweep_interval_secs
                .map_or(defaults.sweep_interval, Duration::from_secs),
            max_messages: fc.session.max_messages.unwrap_or(defaults.max_messages),
        };

        Self {
            server,
            llm,
            asr,
            session,
        }
    }

    /// Path of the `SQLite` database
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.server.data_dir.join("gateway.db")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_sources() {
        let config = Config::from_sources(file::GatewayConfigFile::default(), env_of(&[]));
        assert_eq!(config.server.port, 3001);
        assert_eq!(config.llm.model, DEFAULT_LLM_MODEL);
        assert_eq!(config.llm.base_url, DEFAULT_LLM_BASE_URL);
        assert_eq!(config.asr.sample_rate, 16_000);
        assert_eq!(config.session.max_messages, 50);
        assert_eq!(config.session.ttl, Duration::from_secs(1800));
        assert!(config.llm.api_key.is_none());
    }

    #[test]
    fn env_overrides_file() {
        let fc: file::GatewayConfigFile = toml::from_str(
            r#"
            [server]
            port = 4000
            [llm]
            model = "from-file"
            "#,
        )
        .unwrap();
        let config = Config::from_sources(
            fc,
            env_of(&[
                ("GATEWAY_PORT", "5000"),
                ("DASHSCOPE_API_KEY", "sk-test"),
                ("AI_TIMEOUT", "90000"),
            ]),
        );
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.llm.model, "from-file");
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.asr.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.llm.base_timeout, Duration::from_secs(90));
    }
}
