//! Skill loader
//!
//! Skills are markdown files with YAML frontmatter, one per subdirectory:
//!
//! ```text
//! skills/
//!   todo-extract/SKILL.md
//!   customer-request/SKILL.md
//! ```
//!
//! They are read at request time so edits apply without a restart.

mod types;

use std::path::{Path, PathBuf};

pub use types::{Skill, SkillMetadata};
use types::Frontmatter;

use crate::db::SkillToggle;
use crate::{Error, Result};

/// File name of a skill definition inside its directory
pub const SKILL_FILE: &str = "SKILL.md";

/// Reads skill definitions from a directory
#[derive(Debug, Clone)]
pub struct SkillLoader {
    dir: PathBuf,
}

impl SkillLoader {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load every skill, reading the filesystem off the async workers
    pub async fn load(&self) -> Vec<Skill> {
        let dir = self.dir.clone();
        match tokio::task::spawn_blocking(move || load_skills(&dir)).await {
            Ok(skills) => skills,
            Err(e) => {
                tracing::warn!(error = %e, "skill loading task failed");
                Vec::new()
            }
        }
    }
}

/// Load all `<subdir>/SKILL.md` files under `dir`, sorted by directory name
///
/// A missing directory yields no skills. Unreadable or malformed files are
/// skipped with a warning.
#[must_use]
pub fn load_skills(dir: &Path) -> Vec<Skill> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        tracing::debug!(dir = %dir.display(), "skills directory not found");
        return Vec::new();
    };

    let mut subdirs: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    subdirs.sort();

    let mut skills = Vec::new();
    for subdir in subdirs {
        let path = subdir.join(SKILL_FILE);
        if !path.exists() {
            continue;
        }

        let fallback_name = subdir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let parsed = std::fs::read_to_string(&path)
            .map_err(Error::from)
            .and_then(|raw| parse_skill(&raw, &fallback_name));

        match parsed {
            Ok(skill) => skills.push(skill),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping invalid skill");
            }
        }
    }

    tracing::debug!(count = skills.len(), "loaded skills");
    skills
}

/// Parse a SKILL.md document; the directory name stands in for a missing `name`
///
/// # Errors
///
/// Returns error if the frontmatter is unclosed or not valid YAML
pub fn parse_skill(content: &str, fallback_name: &str) -> Result<Skill> {
    let (frontmatter, body) = parse_frontmatter(content)?;
    let extraction = frontmatter
        .metadata
        .and_then(|m| m.extraction)
        .unwrap_or_default();

    Ok(Skill {
        name: frontmatter
            .name
            .unwrap_or_else(|| fallback_name.to_string()),
        description: frontmatter.description.unwrap_or_default(),
        instructions: body,
        metadata: SkillMetadata {
            extract_fields: extraction.extract_fields,
            always: extraction.always,
        },
    })
}

/// Split YAML frontmatter from the markdown body
///
/// A document without frontmatter is all body.
fn parse_frontmatter(content: &str) -> Result<(Frontmatter, String)> {
    let content = content.trim();

    let Some(rest) = content.strip_prefix("---") else {
        return Ok((Frontmatter::default(), content.to_string()));
    };

    let end = rest
        .find("\n---")
        .ok_or_else(|| Error::Skill("unclosed frontmatter".to_string()))?;

    let frontmatter = &rest[..end];
    let body = rest[end + 4..].trim().to_string();

    let parsed: Frontmatter = if frontmatter.trim().is_empty() {
        Frontmatter::default()
    } else {
        serde_yaml::from_str(frontmatter).map_err(|e| Error::Skill(e.to_string()))?
    };

    Ok((parsed, body))
}

/// Select the active skills
///
/// Without toggles every skill is active. With toggles, a skill is active
/// when its toggle says so or when it has no toggle. `always` skills stay
/// active regardless.
#[must_use]
pub fn filter_active_skills(skills: Vec<Skill>, toggles: Option<&[SkillToggle]>) -> Vec<Skill> {
    let Some(toggles) = toggles else {
        return skills;
    };

    skills
        .into_iter()
        .filter(|skill| {
            skill.metadata.always
                || toggles
                    .iter()
                    .find(|t| t.name == skill.name)
                    .is_none_or(|t| t.enabled)
        })
        .collect()
}
