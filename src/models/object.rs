//! Stored object metadata and the request/response shapes around it.

use crate::{
    errors::{StorageError, StorageResult},
    services::digest::DigestAlgorithm,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::io;

/// Owned byte stream handed between staging, offers and callers.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Where the bytes to archive currently live in the staging workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDescription {
    pub workspace_container: String,
    pub workspace_object_uri: String,
}

impl ObjectDescription {
    pub fn new(container: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            workspace_container: container.into(),
            workspace_object_uri: uri.into(),
        }
    }
}

/// Metadata an offer keeps for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObjectInfo {
    pub object_id: String,
    pub digest: String,
    pub digest_algorithm: DigestAlgorithm,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

/// Raw `objects` row.
#[derive(Debug, FromRow)]
pub(crate) struct ObjectRow {
    pub object_id: String,
    pub digest: String,
    pub digest_algorithm: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl TryFrom<ObjectRow> for StoredObjectInfo {
    type Error = StorageError;

    fn try_from(row: ObjectRow) -> StorageResult<Self> {
        Ok(Self {
            digest_algorithm: row.digest_algorithm.parse()?,
            size: u64::try_from(row.size_bytes).map_err(|_| {
                StorageError::Internal(format!(
                    "negative size recorded for `{}`",
                    row.object_id
                ))
            })?,
            object_id: row.object_id,
            digest: row.digest,
            created_at: row.created_at,
            last_modified: row.last_modified,
            last_accessed: row.last_accessed,
        })
    }
}

/// How an offer handled a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOutcome {
    Created,
    Replaced,
    /// Identical content was already stored. Nothing was written or logged.
    Unchanged,
    /// Metadata matched but the bytes on disk did not, so they were rewritten.
    Repaired,
}

#[derive(Debug, Clone)]
pub struct PutObjectResult {
    pub info: StoredObjectInfo,
    pub outcome: WriteOutcome,
}

/// Result of a successful distributed store.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredInfoResult {
    pub object_id: String,
    pub info: String,
    pub digest: String,
    pub digest_algorithm: DigestAlgorithm,
    pub size: u64,
    pub offer_ids: Vec<String>,
    pub creation_time: DateTime<Utc>,
    pub last_modified_time: DateTime<Utc>,
    pub last_access_time: DateTime<Utc>,
    pub last_checked_time: DateTime<Utc>,
}

/// One page of a container listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectListPage {
    pub objects: Vec<StoredObjectInfo>,
    /// Cursor for the next page, absent once the listing is exhausted.
    pub next_cursor: Option<String>,
}

/// Space figures one offer reports for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferCapacity {
    pub usable_space: u64,
    pub used_space: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInformation {
    pub offer_id: String,
    pub usable_space: u64,
    pub used_space: u64,
    pub object_count: u64,
    /// Number of copies the strategy keeps, one per enabled offer.
    pub nbc: u64,
}
