//! Entries of the per-container append-only offer log.

use crate::errors::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OfferLogAction {
    Write,
    Delete,
}

impl OfferLogAction {
    pub fn as_str(self) -> &'static str {
        match self {
            OfferLogAction::Write => "WRITE",
            OfferLogAction::Delete => "DELETE",
        }
    }
}

impl FromStr for OfferLogAction {
    type Err = StorageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "WRITE" => Ok(OfferLogAction::Write),
            "DELETE" => Ok(OfferLogAction::Delete),
            other => Err(StorageError::Internal(format!(
                "unknown offer log action `{}`",
                other
            ))),
        }
    }
}

/// Direction in which the log is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

/// One mutation recorded by an offer. Sequences are strictly increasing
/// within a container and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferLogEntry {
    pub sequence: u64,
    pub container: String,
    pub object_id: String,
    pub action: OfferLogAction,
    pub time: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
pub(crate) struct OfferLogRow {
    pub sequence: i64,
    pub container: String,
    pub object_id: String,
    pub action: String,
    pub logged_at: DateTime<Utc>,
}

impl TryFrom<OfferLogRow> for OfferLogEntry {
    type Error = StorageError;

    fn try_from(row: OfferLogRow) -> StorageResult<Self> {
        Ok(Self {
            sequence: u64::try_from(row.sequence)
                .map_err(|_| StorageError::Internal("negative log sequence".into()))?,
            container: row.container,
            object_id: row.object_id,
            action: row.action.parse()?,
            time: row.logged_at,
        })
    }
}
