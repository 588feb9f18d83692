//! Staging workspace: where producers leave the bytes the distribution
//! layer then copies to every offer.

use crate::{
    errors::{StorageError, StorageResult},
    models::object::ByteStream,
    services::offer::{ensure_container_safe, ensure_object_id_safe},
};
use async_trait::async_trait;
use futures::StreamExt;
use std::{io::ErrorKind, path::PathBuf};
use tokio::fs::File;
use tokio_util::io::ReaderStream;

/// An opened staging object.
pub struct StagedObject {
    /// Length known up front, when the source can tell.
    pub size: Option<u64>,
    pub stream: ByteStream,
}

/// Source of the bytes to archive. Opening twice yields the same bytes.
#[async_trait]
pub trait StagingSource: Send + Sync {
    async fn open(&self, container: &str, uri: &str) -> StorageResult<StagedObject>;
}

/// Staging area laid out as `root/{container}/{uri}`.
#[derive(Debug, Clone)]
pub struct FileSystemStaging {
    root: PathBuf,
}

impl FileSystemStaging {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_of(&self, container: &str, uri: &str) -> PathBuf {
        self.root.join(container).join(uri)
    }
}

#[async_trait]
impl StagingSource for FileSystemStaging {
    async fn open(&self, container: &str, uri: &str) -> StorageResult<StagedObject> {
        ensure_container_safe(container)?;
        ensure_object_id_safe(uri)?;
        let path = self.path_of(container, uri);
        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::StagingNotFound {
                    container: container.to_string(),
                    path: uri.to_string(),
                }
            } else {
                StorageError::Io(err)
            }
        })?;
        let size = file.metadata().await?.len();
        Ok(StagedObject {
            size: Some(size),
            stream: ReaderStream::new(file).boxed(),
        })
    }
}
