//! Pipeline domain types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stored pipeline
///
/// `content` holds the JSON definition document. Pipelines are created and
/// soft-deleted elsewhere; the orchestrator only reads them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub content: String,
    pub clone_url: String,
    pub username: String,
    pub access_token: String,
    pub deleted: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Pipeline {
    /// Whether the stored definition document has anything to build
    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }
}
