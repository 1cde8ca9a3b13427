//! Skill type definitions

use serde::{Deserialize, Serialize};

/// A declarative extraction skill loaded from `<dir>/<name>/SKILL.md`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// Markdown body, injected into the system prompt
    pub instructions: String,
    pub metadata: SkillMetadata,
}

/// What a skill asks the model to produce
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SkillMetadata {
    /// Output fields requested from the model (e.g. `todos`)
    pub extract_fields: Vec<String>,
    /// Active regardless of per-device toggles
    pub always: bool,
}

/// YAML frontmatter of a SKILL.md file
#[derive(Debug, Default, Deserialize)]
pub(crate) struct Frontmatter {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Option<FrontmatterMetadata>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct FrontmatterMetadata {
    /// Extraction settings live under the `openclaw` key
    #[serde(default, rename = "openclaw")]
    pub extraction: Option<ExtractionMetadata>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ExtractionMetadata {
    #[serde(default)]
    pub extract_fields: Vec<String>,
    #[serde(default)]
    pub always: bool,
}
