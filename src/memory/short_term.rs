//! In-session memory ring

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

/// Entries kept before the oldest is dropped
pub const SHORT_TERM_CAPACITY: usize = 20;

/// One piece of recent context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortTermEntry {
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Bounded buffer of the latest in-session context
#[derive(Debug, Clone, Default)]
pub struct ShortTermMemory {
    entries: VecDeque<ShortTermEntry>,
}

impl ShortTermMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, content: impl Into<String>) {
        if self.entries.len() == SHORT_TERM_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(ShortTermEntry {
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn entries(&self) -> impl Iterator<Item = &ShortTermEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All contents, oldest first, one per line
    #[must_use]
    pub fn summary(&self) -> String {
        self.entries
            .iter()
            .map(|e| e.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
