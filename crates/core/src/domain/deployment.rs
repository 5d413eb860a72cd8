use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::version::Version;

/// A named pin of a `Version` behind a stable identifier (spec §3, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub agent_id: String,
    pub version: Version,
    pub metadata: serde_json::Value,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}
