use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncStatusCode {
    Running,
    Ok,
    Ko,
}

/// Progress report of the current or last offer synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub request_id: String,
    /// Cleared together with `end_date` being set.
    pub running: bool,
    pub source_offer: String,
    pub target_offer: String,
    pub container: String,
    pub start_offset: u64,
    /// Last log sequence whose batch was fully applied to the target.
    pub current_offset: u64,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub status: SyncStatusCode,
    pub written: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub conflicts: u64,
    pub last_error: Option<String>,
}
