//! Artifacts persisted from stage outputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A named output blob produced by a stage.
///
/// Artifacts are immutable once created. A later stage execution may
/// produce a newer artifact with the same name; the older one is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Unique identifier.
    pub id: Uuid,

    /// The owning run.
    pub run_id: Uuid,

    /// The stage execution that produced it, if still known.
    pub execution_id: Option<Uuid>,

    /// Type tag (e.g. "openapi", "sql", "code", "qa_report").
    #[serde(rename = "type")]
    pub artifact_type: String,

    /// Artifact name, usually a file name.
    pub name: String,

    /// The content.
    pub content: String,

    /// Lowercase hex SHA-256 of `content`.
    pub content_hash: String,

    /// Additional metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,

    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Creates a new artifact and computes its content hash.
    #[must_use]
    pub fn new(
        run_id: Uuid,
        execution_id: Option<Uuid>,
        artifact_type: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        Self {
            id: Uuid::new_v4(),
            run_id,
            execution_id,
            artifact_type: artifact_type.into(),
            name: name.into(),
            content_hash: content_hash(&content),
            content,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    /// Attaches metadata to the artifact.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Returns true if `content` still matches `content_hash`.
    #[must_use]
    pub fn verify(&self) -> bool {
        content_hash(&self.content) == self.content_hash
    }
}

/// Hashes artifact content.
#[must_use]
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}
