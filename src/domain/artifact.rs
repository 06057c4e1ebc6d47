//! Artifacts produced by jobs.
//!
//! An artifact is a named, immutable blob written once by its producing job
//! and readable by any downstream job that declares a fetch for it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Stable handle addressing one artifact within a run.
///
/// Unique per (run, job, name); valid for the lifetime of the run directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactHandle {
    /// The run the artifact belongs to
    pub run_id: Uuid,

    /// Job that produced the artifact
    pub job_id: String,

    /// Artifact name (unique within the producing job)
    pub name: String,
}

impl ArtifactHandle {
    pub fn new(run_id: Uuid, job_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            run_id,
            job_id: job_id.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ArtifactHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.run_id, self.job_id, self.name)
    }
}

/// Metadata recorded when an artifact is stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    /// Handle addressing the artifact
    pub handle: ArtifactHandle,

    /// SHA-256 digest of the content (hex)
    pub digest: String,

    /// Size in bytes
    pub size_bytes: u64,

    /// When the artifact was stored
    pub created_at: DateTime<Utc>,
}

impl ArtifactMeta {
    /// Build metadata for freshly stored content
    pub fn for_content(handle: ArtifactHandle, content: &[u8]) -> Self {
        Self {
            handle,
            digest: digest(content),
            size_bytes: content.len() as u64,
            created_at: Utc::now(),
        }
    }
}

/// SHA-256 digest of a byte slice, hex-encoded
pub fn digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}
