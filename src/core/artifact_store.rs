//! File-backed artifact storage.
//!
//! Artifacts live under `<runs>/<run-id>/artifacts/<job>/<name>`, with a
//! sidecar `.meta.json` recording digest, size, and creation time. Content
//! is write-once: a second put for the same handle is rejected. Run
//! directories (events and artifacts together) are garbage collected once
//! they age past the configured retention window.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::fs;

use crate::domain::{ArtifactHandle, ArtifactMeta};

/// Errors from artifact storage
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Artifact {handle} not found")]
    NotFound { handle: ArtifactHandle },

    #[error("Artifact {handle} already stored (content is immutable)")]
    AlreadyExists { handle: ArtifactHandle },

    #[error("Artifact metadata for {handle} is unreadable: {reason}")]
    CorruptMeta { handle: ArtifactHandle, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Artifact store rooted at the runs base directory
pub struct ArtifactStore {
    base_dir: PathBuf,
}

impl ArtifactStore {
    /// Create a store over an explicit runs directory
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Create a store over the configured runs directory
    pub fn open_default() -> anyhow::Result<Self> {
        Ok(Self::new(crate::config::runs_dir()?))
    }

    fn blob_path(&self, handle: &ArtifactHandle) -> PathBuf {
        self.base_dir
            .join(handle.run_id.to_string())
            .join("artifacts")
            .join(&handle.job_id)
            .join(&handle.name)
    }

    fn meta_path(&self, handle: &ArtifactHandle) -> PathBuf {
        let mut path = self.blob_path(handle).into_os_string();
        path.push(".meta.json");
        PathBuf::from(path)
    }

    /// Store an artifact. Content is immutable once stored.
    pub async fn put(
        &self,
        handle: ArtifactHandle,
        content: &[u8],
    ) -> Result<ArtifactMeta, ArtifactError> {
        let blob_path = self.blob_path(&handle);

        if blob_path.exists() {
            return Err(ArtifactError::AlreadyExists { handle });
        }

        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let meta = ArtifactMeta::for_content(handle, content);
        let meta_json =
            serde_json::to_vec_pretty(&meta).map_err(|e| ArtifactError::CorruptMeta {
                handle: meta.handle.clone(),
                reason: e.to_string(),
            })?;
        fs::write(&blob_path, content).await?;
        fs::write(self.meta_path(&meta.handle), meta_json).await?;

        Ok(meta)
    }

    /// Retrieve an artifact's content
    pub async fn get(&self, handle: &ArtifactHandle) -> Result<Vec<u8>, ArtifactError> {
        let blob_path = self.blob_path(handle);

        if !blob_path.exists() {
            return Err(ArtifactError::NotFound {
                handle: handle.clone(),
            });
        }

        Ok(fs::read(&blob_path).await?)
    }

    /// Retrieve an artifact's stored metadata
    pub async fn meta(&self, handle: &ArtifactHandle) -> Result<ArtifactMeta, ArtifactError> {
        let meta_path = self.meta_path(handle);

        if !meta_path.exists() {
            return Err(ArtifactError::NotFound {
                handle: handle.clone(),
            });
        }

        let bytes = fs::read(&meta_path).await?;
        serde_json::from_slice(&bytes).map_err(|e| ArtifactError::CorruptMeta {
            handle: handle.clone(),
            reason: e.to_string(),
        })
    }

    /// List artifact names stored by one job in one run
    pub async fn list(&self, run_id: uuid::Uuid, job_id: &str) -> Result<Vec<String>, ArtifactError> {
        let job_dir = self
            .base_dir
            .join(run_id.to_string())
            .join("artifacts")
            .join(job_id);

        let mut names = Vec::new();
        if !job_dir.exists() {
            return Ok(names);
        }

        let mut entries = fs::read_dir(&job_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(".meta.json") {
                    names.push(name.to_string());
                }
            }
        }

        names.sort_unstable();
        Ok(names)
    }

    /// Delete run directories older than the retention window.
    ///
    /// Age is judged by the run directory's modification time. Returns the
    /// number of run directories removed.
    pub async fn sweep_expired(&self, retention: Duration) -> Result<usize, ArtifactError> {
        if !self.base_dir.exists() {
            return Ok(0);
        }

        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0usize;

        let mut entries = fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if uuid::Uuid::parse_str(name).is_err() {
                continue;
            }

            let modified = entry.metadata().await?.modified()?;
            if modified < cutoff {
                fs::remove_dir_all(entry.path()).await?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// The runs directory this store is rooted at
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}
