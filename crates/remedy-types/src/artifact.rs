//! Artifact metadata. Content lives in a blob store; the row is the pointer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Timestamp, now};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub run_action_id: Uuid,
    /// Blob path, `playbooks/{run_id}/{declared_path}`.
    pub path: String,
    pub size: u64,
    pub content_type: String,
    /// Lowercase hex SHA-256 of the content.
    pub checksum: String,
    /// Blob connection the content was written to.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub connection: Option<String>,
    #[serde(default)]
    pub is_pushed: bool,
    #[serde(default)]
    pub is_data_pushed: bool,
    pub created_at: Timestamp,
}

impl Artifact {
    pub fn new(run_action_id: Uuid, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_action_id,
            path: path.into(),
            size: 0,
            content_type: "application/octet-stream".to_string(),
            checksum: String::new(),
            connection: None,
            is_pushed: false,
            is_data_pushed: false,
            created_at: now(),
        }
    }

    /// File name portion of the path.
    pub fn filename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}
