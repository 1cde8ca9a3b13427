//! Request pipelines
//!
//! - [`ProcessPipeline`] extracts structured data from one transcript
//! - [`ChatPipeline`] streams review and command dialogues
//! - [`TodoAggregator`] folds pending todos into a diary entry
//!
//! Each pipeline locks the device's session for the whole run, so work for
//! one device is serialized while different devices proceed in parallel.

mod chat;
mod estimator;
mod process;
mod todo;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use chat::{ChatPipeline, NO_RECORDS_SUFFIX};
pub use estimator::{DEFAULT_MINUTES, DEFAULT_PRIORITY, TimeEstimate, TimeEstimator};
pub use process::{MAX_TOOL_ROUNDS, ProcessPipeline, ProcessRequest, ProcessResult, parse_extraction};
pub use todo::{NO_PENDING_TODOS, TodoAggregator};

use crate::background::BackgroundTasks;
use crate::db::{SkillToggle, Store};
use crate::llm::CompletionClient;
use crate::memory::MemoryManager;
use crate::persona::SoulManager;
use crate::session::SessionStore;
use crate::skills::{Skill, SkillLoader, filter_active_skills};
use crate::tools::ToolRegistry;

/// Device-local overrides sent along with a request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalConfig {
    #[serde(default)]
    pub soul: Option<LocalSoul>,
    #[serde(default)]
    pub skills: Option<LocalSkills>,
    /// Tag allow-list; extracted tags outside it are dropped
    #[serde(default)]
    pub existing_tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSoul {
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSkills {
    #[serde(default)]
    pub configs: Vec<SkillToggle>,
}

/// Collaborators shared by every pipeline
#[derive(Clone)]
pub struct PipelineDeps {
    pub store: Arc<dyn Store>,
    pub llm: Arc<dyn CompletionClient>,
    pub tools: Arc<ToolRegistry>,
    pub skills: SkillLoader,
    pub sessions: SessionStore,
    pub background: BackgroundTasks,
    /// Base persona prepended to every system prompt
    pub agent_prompt: Arc<str>,
}

impl PipelineDeps {
    #[must_use]
    pub fn memory(&self) -> MemoryManager {
        MemoryManager::new(Arc::clone(&self.store), Arc::clone(&self.llm))
    }

    #[must_use]
    pub fn soul(&self) -> SoulManager {
        SoulManager::new(Arc::clone(&self.store), Arc::clone(&self.llm))
    }

    /// Skills active for the device
    ///
    /// Local toggles win over the stored per-device configuration. An
    /// unreadable configuration leaves every skill active.
    pub(crate) async fn active_skills(
        &self,
        device_id: &str,
        local: Option<&LocalConfig>,
    ) -> Vec<Skill> {
        let skills = self.skills.load().await;

        let toggles = match local.and_then(|l| l.skills.as_ref()) {
            Some(local) => Some(local.configs.clone()),
            None => match self.store.skill_toggles(device_id).await {
                Ok(toggles) => Some(toggles),
                Err(e) => {
                    tracing::warn!(device_id, error = %e, "failed to load skill config");
                    None
                }
            },
        };

        let active = filter_active_skills(skills, toggles.as_deref());
        if active.is_empty() {
            tracing::warn!(device_id, "no active skills");
        }
        active
    }

    /// Persona text, local override first
    pub(crate) async fn resolve_soul(
        &self,
        device_id: &str,
        local: Option<&LocalConfig>,
    ) -> Option<String> {
        if let Some(soul) = local.and_then(|l| l.soul.as_ref()) {
            return Some(soul.content.clone());
        }

        self.soul().load(device_id).await.unwrap_or_else(|e| {
            tracing::warn!(device_id, error = %e, "failed to load soul");
            None
        })
    }
}
