use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::WorkStatus;

/// One row of the link database: a video URL waiting to be processed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub owner_id: String,
    pub source_url: String,
    pub tag: String,
    pub status: WorkStatus,
    pub updated_at: DateTime<Utc>,
    /// Number of times the item was requeued after stalling. Advisory only.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl WorkItem {
    /// Create a new pending item with a random id
    pub fn new(owner_id: impl Into<String>, source_url: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            source_url: source_url.into(),
            tag: tag.into(),
            status: WorkStatus::Pending,
            updated_at: Utc::now(),
            retry_count: 0,
            error_message: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Returns a timestamp strictly after `previous`, normally `Utc::now()`
pub fn next_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + chrono::Duration::milliseconds(1)
    }
}
