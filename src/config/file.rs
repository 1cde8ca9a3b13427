//! TOML configuration file loading
//!
//! Supports `~/.config/v2note/gateway.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct GatewayConfigFile {
    /// Server/runtime configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Completion service configuration
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Speech recognition configuration
    #[serde(default)]
    pub asr: AsrFileConfig,

    /// In-memory session configuration
    #[serde(default)]
    pub session: SessionFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// Listen port
    pub port: Option<u16>,
    /// Directory holding the database and saved audio
    pub data_dir: Option<String>,
    /// Directory of `<name>/SKILL.md` skill definitions
    pub skills_dir: Option<String>,
    /// Base persona prompt (`Agent.md`)
    pub agent_prompt_path: Option<String>,
    /// Tool server list (JSON or markdown)
    pub tools_config_path: Option<String>,
}

/// Completion service configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    /// Base timeout before the per-input-size allowance
    pub base_timeout_secs: Option<u64>,
}

/// Speech recognition configuration
#[derive(Debug, Default, Deserialize)]
pub struct AsrFileConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub model: Option<String>,
    pub sample_rate: Option<u32>,
}

/// Session lifetime configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    pub ttl_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub max_messages: Option<usize>,
}

/// Load the TOML config file
///
/// An explicit path must exist and parse. The default path is optional:
/// returns `GatewayConfigFile::default()` if it is missing or unreadable.
///
/// # Errors
///
/// Returns error if an explicitly given file cannot be read or parsed
pub fn load_config_file(explicit: Option<&Path>) -> Result<GatewayConfigFile> {
    if let Some(path) = explicit {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        return Ok(config);
    }

    let Some(path) = config_file_path() else {
        return Ok(GatewayConfigFile::default());
    };

    if !path.exists() {
        return Ok(GatewayConfigFile::default());
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                Ok(config)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                Ok(GatewayConfigFile::default())
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            Ok(GatewayConfigFile::default())
        }
    }
}

/// Return the config file path: `~/.config/v2note/gateway.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("v2note").join("gateway.toml"))
}
