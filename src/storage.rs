//! Audio blob storage for recordings kept with `saveAudio`

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

/// Destination for raw recorded audio
#[async_trait]
pub trait AudioStore: Send + Sync {
    /// Persist the chunks as one blob and return its location
    async fn save(&self, device_id: &str, chunks: &[Bytes]) -> Result<String>;
}

/// Writes raw PCM to `<root>/<device_id>/<uuid>.pcm`
#[derive(Debug, Clone)]
pub struct FsAudioStore {
    root: PathBuf,
}

impl FsAudioStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl AudioStore for FsAudioStore {
    async fn save(&self, device_id: &str, chunks: &[Bytes]) -> Result<String> {
        // Device ids are opaque; keep them from escaping the root
        let dir_name: String = device_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let dir = self.root.join(dir_name);
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(format!("{}.pcm", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, chunks.concat()).await?;

        tracing::debug!(device_id, path = %path.display(), "saved recording");
        Ok(path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concatenates_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAudioStore::new(dir.path());
        let path = store
            .save("dev/../1", &[Bytes::from_static(b"ab"), Bytes::from_static(b"cd")])
            .await
            .unwrap();

        assert!(path.starts_with(&dir.path().display().to_string()));
        assert!(!path.contains(".."));
        assert_eq!(std::fs::read(&path).unwrap(), b"abcd");
    }
}
