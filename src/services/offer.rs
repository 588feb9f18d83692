//! src/services/offer.rs
//!
//! Offers are independent object stores. Each one keeps, per container, the
//! objects themselves and an append-only log of every mutation. The
//! `FileSystemOffer` keeps metadata and the log in SQLite and object payloads
//! on disk, sharded beneath `base_path/{container}/{shard}/{shard}/{object_id}`.

use crate::{
    db,
    errors::{StorageError, StorageResult},
    models::{
        category::DataCategory,
        object::{ByteStream, ObjectRow, OfferCapacity, PutObjectResult, StoredObjectInfo, WriteOutcome},
        offer_log::{OfferLogAction, OfferLogEntry, OfferLogRow, Order},
    },
    services::digest::{Digest, DigestAlgorithm, digest_file},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};
use tempfile::TempPath;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex, PoisonError},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::{Mutex, OwnedMutexGuard},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

const OFFER_DATABASE: &str = "offer.db";
const MAX_OBJECT_ID_LEN: usize = 1024;
const MAX_CONTAINER_LEN: usize = 255;

/// Parameters of a single-offer write. The payload travels separately.
#[derive(Debug, Clone)]
pub struct PutObjectRequest {
    pub container: String,
    pub object_id: String,
    pub category: DataCategory,
    /// Size announced by the producer, checked against the bytes received.
    pub declared_size: Option<u64>,
    pub digest_algorithm: DigestAlgorithm,
    /// Digest the received bytes must hash to.
    pub expected_digest: Option<String>,
}

impl PutObjectRequest {
    pub fn new(
        container: impl Into<String>,
        object_id: impl Into<String>,
        category: DataCategory,
    ) -> Self {
        Self {
            container: container.into(),
            object_id: object_id.into(),
            category,
            declared_size: None,
            digest_algorithm: DigestAlgorithm::default(),
            expected_digest: None,
        }
    }

    pub fn with_digest_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.digest_algorithm = algorithm;
        self
    }

    pub fn with_expected_digest(mut self, digest: impl Into<String>) -> Self {
        self.expected_digest = Some(digest.into());
        self
    }

    pub fn with_declared_size(mut self, size: u64) -> Self {
        self.declared_size = Some(size);
        self
    }
}

/// A storage backend holding one full copy of the data it is given.
#[async_trait]
pub trait Offer: Send + Sync {
    fn id(&self) -> &str;

    /// Store the bytes of `stream`. Every write except an identical no-op
    /// appends a `WRITE` entry to the container log.
    async fn create(
        &self,
        request: PutObjectRequest,
        stream: ByteStream,
    ) -> StorageResult<PutObjectResult>;

    async fn read(
        &self,
        container: &str,
        object_id: &str,
    ) -> StorageResult<(StoredObjectInfo, ByteStream)>;

    async fn exists(&self, container: &str, object_id: &str) -> StorageResult<bool>;

    /// Remove an object. Returns `false`, and logs nothing, when it was absent.
    async fn delete(&self, container: &str, object_id: &str) -> StorageResult<bool>;

    /// Recorded metadata, or freshly recomputed digest and size when `refresh`.
    async fn get_info(
        &self,
        container: &str,
        object_id: &str,
        refresh: bool,
    ) -> StorageResult<StoredObjectInfo>;

    /// Whether the stored bytes hash to `digest` under `algorithm`.
    async fn check_object(
        &self,
        container: &str,
        object_id: &str,
        digest: &str,
        algorithm: DigestAlgorithm,
    ) -> StorageResult<bool>;

    /// Ascending reads return entries strictly after `offset`; descending
    /// reads return entries strictly before it, or from the newest when `None`.
    async fn list_log(
        &self,
        container: &str,
        offset: Option<u64>,
        limit: usize,
        order: Order,
    ) -> StorageResult<Vec<OfferLogEntry>>;

    /// Objects ordered by id, strictly after `after`.
    async fn list_objects(
        &self,
        container: &str,
        after: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<StoredObjectInfo>>;

    async fn count_objects(&self, container: &str) -> StorageResult<u64>;

    async fn capacity(&self, container: &str) -> StorageResult<OfferCapacity>;

    /// Cheap end-to-end probe of the metadata store and the payload disk.
    async fn ping(&self) -> StorageResult<()>;
}

/// Lazily page through a container log in ascending order, one batch per item.
/// The stream ends after the first short or empty batch.
pub fn log_batches(
    offer: Arc<dyn Offer>,
    container: String,
    offset: Option<u64>,
    batch_size: usize,
) -> BoxStream<'static, StorageResult<Vec<OfferLogEntry>>> {
    let batch_size = batch_size.max(1);
    stream::try_unfold(Some(offset), move |cursor| {
        next_log_batch(offer.clone(), container.clone(), cursor, batch_size)
    })
    .boxed()
}

type LogCursor = Option<Option<u64>>;

/// `None` cursor means the previous batch was short and the log is exhausted.
async fn next_log_batch(
    offer: Arc<dyn Offer>,
    container: String,
    cursor: LogCursor,
    batch_size: usize,
) -> StorageResult<Option<(Vec<OfferLogEntry>, LogCursor)>> {
    let Some(offset) = cursor else {
        return Ok(None);
    };
    let batch = offer
        .list_log(&container, offset, batch_size, Order::Asc)
        .await?;
    if batch.is_empty() {
        return Ok(None);
    }
    let next = if batch.len() < batch_size {
        None
    } else {
        Some(batch.last().map(|entry| entry.sequence))
    };
    Ok(Some((batch, next)))
}

/// Per-object async locks, dropped from the table once nobody holds them.
#[derive(Default)]
struct ObjectLocks {
    inner: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ObjectLocks {
    async fn lock(&self, key: String) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            table.retain(|_, lock| Arc::strong_count(lock) > 1);
            table.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }
}

enum Decision {
    /// Identical content already stored and intact.
    Keep(StoredObjectInfo),
    Write {
        digest: String,
        size: u64,
        outcome: WriteOutcome,
        created_at: Option<DateTime<Utc>>,
    },
}

/// Offer backed by a local directory: SQLite for metadata and the log,
/// plain files for payloads.
pub struct FileSystemOffer {
    id: String,
    db: SqlitePool,
    base_path: PathBuf,
    /// Quota reported as usable space, shared by all containers.
    capacity_bytes: u64,
    locks: ObjectLocks,
    /// Serializes sequence allocation so log order matches commit order.
    log_lock: Mutex<()>,
}

impl FileSystemOffer {
    /// Open the offer rooted at `base_path`, creating the directory and the
    /// metadata schema when missing.
    pub async fn open(
        id: impl Into<String>,
        base_path: impl Into<PathBuf>,
        capacity_bytes: u64,
    ) -> StorageResult<Self> {
        let id = id.into();
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await?;
        let db = db::open_file(&base_path.join(OFFER_DATABASE)).await?;
        db::run_migrations(&db, db::OFFER_MIGRATIONS).await?;
        info!(offer = %id, path = %base_path.display(), "offer opened");
        Ok(Self {
            id,
            db,
            base_path,
            capacity_bytes,
            locks: ObjectLocks::default(),
            log_lock: Mutex::new(()),
        })
    }

    fn container_root(&self, container: &str) -> PathBuf {
        self.base_path.join(container)
    }

    /// Two-level shard directories from MD5(container/object_id).
    fn object_shards(container: &str, object_id: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", container, object_id));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Payload location. Parent directories may not exist yet.
    pub fn object_path(&self, container: &str, object_id: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(container, object_id);
        let mut path = self.container_root(container);
        path.push(shard_a);
        path.push(shard_b);
        path.push(object_id);
        path
    }

    async fn fetch_object(
        &self,
        container: &str,
        object_id: &str,
    ) -> StorageResult<Option<StoredObjectInfo>> {
        let row = sqlx::query_as::<_, ObjectRow>(
            "SELECT object_id, digest, digest_algorithm, size_bytes, created_at,
                    last_modified, last_accessed
             FROM objects WHERE container = ? AND object_id = ?",
        )
        .bind(container)
        .bind(object_id)
        .fetch_optional(&self.db)
        .await?;
        row.map(StoredObjectInfo::try_from).transpose()
    }

    async fn require_object(
        &self,
        container: &str,
        object_id: &str,
    ) -> StorageResult<StoredObjectInfo> {
        self.fetch_object(container, object_id)
            .await?
            .ok_or_else(|| StorageError::object_not_found(container, object_id))
    }

    async fn digest_payload(
        &self,
        container: &str,
        object_id: &str,
        algorithm: DigestAlgorithm,
    ) -> StorageResult<(String, u64)> {
        digest_file(algorithm, &self.object_path(container, object_id))
            .await
            .map_err(|err| payload_error(err, container, object_id))
    }

    /// Receive the payload into `tmp_path` and decide what the write means
    /// for the object currently stored.
    async fn stage(
        &self,
        request: &PutObjectRequest,
        tmp_path: &Path,
        stream: ByteStream,
    ) -> StorageResult<Decision> {
        let (digest, size) = write_temp(tmp_path, stream, request.digest_algorithm).await?;

        if let Some(declared) = request.declared_size {
            if declared != size {
                return Err(StorageError::SizeMismatch {
                    object_id: request.object_id.clone(),
                    declared,
                    actual: size,
                });
            }
        }
        if let Some(expected) = request.expected_digest.as_deref() {
            if !expected.eq_ignore_ascii_case(&digest) {
                return Err(StorageError::DigestMismatch {
                    object_id: request.object_id.clone(),
                    expected: expected.to_string(),
                    actual: digest,
                });
            }
        }

        let Some(current) = self
            .fetch_object(&request.container, &request.object_id)
            .await?
        else {
            return Ok(Decision::Write {
                digest,
                size,
                outcome: WriteOutcome::Created,
                created_at: None,
            });
        };

        let on_disk = match self
            .digest_payload(&request.container, &request.object_id, request.digest_algorithm)
            .await
        {
            Ok((on_disk, _)) => Some(on_disk),
            Err(StorageError::ObjectNotFound { .. }) => None,
            Err(err) => return Err(err),
        };
        let disk_same = on_disk.as_deref() == Some(digest.as_str());
        let recorded_same = if current.digest_algorithm == request.digest_algorithm {
            current.digest.eq_ignore_ascii_case(&digest)
        } else {
            disk_same
        };

        let outcome = if recorded_same && disk_same {
            return Ok(Decision::Keep(current));
        } else if recorded_same {
            warn!(
                offer = %self.id,
                container = %request.container,
                object_id = %request.object_id,
                "stored bytes do not match recorded digest, rewriting"
            );
            WriteOutcome::Repaired
        } else if request.category.is_rewritable() {
            WriteOutcome::Replaced
        } else {
            return Err(StorageError::AlreadyExists {
                container: request.container.clone(),
                object_id: request.object_id.clone(),
            });
        };

        Ok(Decision::Write {
            digest,
            size,
            outcome,
            created_at: Some(current.created_at),
        })
    }

    /// Upsert metadata and log the write in one transaction.
    async fn record_write(&self, container: &str, info: &StoredObjectInfo) -> StorageResult<()> {
        let _log = self.log_lock.lock().await;
        let mut tx = self.db.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO objects (
                container, object_id, digest, digest_algorithm, size_bytes,
                created_at, last_modified, last_accessed
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(container, object_id) DO UPDATE SET
                digest = excluded.digest,
                digest_algorithm = excluded.digest_algorithm,
                size_bytes = excluded.size_bytes,
                last_modified = excluded.last_modified,
                last_accessed = excluded.last_accessed
            "#,
        )
        .bind(container)
        .bind(&info.object_id)
        .bind(&info.digest)
        .bind(info.digest_algorithm.as_str())
        .bind(info.size as i64)
        .bind(info.created_at)
        .bind(info.last_modified)
        .bind(info.last_accessed)
        .execute(&mut *tx)
        .await?;
        append_log_entry(
            &mut tx,
            container,
            &info.object_id,
            OfferLogAction::Write,
            info.last_modified,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_delete(&self, container: &str, object_id: &str) -> StorageResult<()> {
        let _log = self.log_lock.lock().await;
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM objects WHERE container = ? AND object_id = ?")
            .bind(container)
            .bind(object_id)
            .execute(&mut *tx)
            .await?;
        append_log_entry(&mut tx, container, object_id, OfferLogAction::Delete, Utc::now())
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Recursively remove empty directories up to the container root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Offer for FileSystemOffer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create(
        &self,
        request: PutObjectRequest,
        stream: ByteStream,
    ) -> StorageResult<PutObjectResult> {
        ensure_container_safe(&request.container)?;
        ensure_object_id_safe(&request.object_id)?;
        let _guard = self
            .locks
            .lock(format!("{}/{}", request.container, request.object_id))
            .await;

        let file_path = self.object_path(&request.container, &request.object_id);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        // Removed on drop unless renamed into place, including when the
        // caller drops this future on timeout.
        let tmp_path = TempPath::from_path(parent.join(format!(".tmp-{}", Uuid::new_v4())));

        let decision = self.stage(&request, &tmp_path, stream).await?;
        let (digest, size, outcome, created_at) = match decision {
            Decision::Keep(info) => {
                debug!(
                    offer = %self.id,
                    container = %request.container,
                    object_id = %request.object_id,
                    "identical object already stored"
                );
                return Ok(PutObjectResult {
                    info,
                    outcome: WriteOutcome::Unchanged,
                });
            }
            Decision::Write {
                digest,
                size,
                outcome,
                created_at,
            } => (digest, size, outcome, created_at),
        };

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() != ErrorKind::AlreadyExists {
                return Err(StorageError::Io(err));
            }
            fs::remove_file(&file_path).await?;
            fs::rename(&tmp_path, &file_path).await?;
        }
        // Renamed, nothing left to clean up.
        let _ = tmp_path.keep();

        let now = Utc::now();
        let info = StoredObjectInfo {
            object_id: request.object_id.clone(),
            digest,
            digest_algorithm: request.digest_algorithm,
            size,
            created_at: created_at.unwrap_or(now),
            last_modified: now,
            last_accessed: now,
        };
        if let Err(err) = self.record_write(&request.container, &info).await {
            if outcome == WriteOutcome::Created {
                let _ = fs::remove_file(&file_path).await;
            }
            return Err(err);
        }

        info!(
            offer = %self.id,
            container = %request.container,
            object_id = %request.object_id,
            size,
            ?outcome,
            "object written"
        );
        Ok(PutObjectResult { info, outcome })
    }

    async fn read(
        &self,
        container: &str,
        object_id: &str,
    ) -> StorageResult<(StoredObjectInfo, ByteStream)> {
        ensure_container_safe(container)?;
        ensure_object_id_safe(object_id)?;
        let mut info = self.require_object(container, object_id).await?;

        let file = File::open(self.object_path(container, object_id))
            .await
            .map_err(|err| payload_error(err, container, object_id))?;

        let now = Utc::now();
        sqlx::query("UPDATE objects SET last_accessed = ? WHERE container = ? AND object_id = ?")
            .bind(now)
            .bind(container)
            .bind(object_id)
            .execute(&self.db)
            .await?;
        info.last_accessed = now;

        Ok((info, ReaderStream::new(file).boxed()))
    }

    async fn exists(&self, container: &str, object_id: &str) -> StorageResult<bool> {
        ensure_container_safe(container)?;
        ensure_object_id_safe(object_id)?;
        if self.fetch_object(container, object_id).await?.is_none() {
            return Ok(false);
        }
        Ok(fs::try_exists(self.object_path(container, object_id)).await?)
    }

    async fn delete(&self, container: &str, object_id: &str) -> StorageResult<bool> {
        ensure_container_safe(container)?;
        ensure_object_id_safe(object_id)?;
        let _guard = self.locks.lock(format!("{}/{}", container, object_id)).await;

        let file_path = self.object_path(container, object_id);
        let recorded = self.fetch_object(container, object_id).await?.is_some();

        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.container_root(container))
                .await;
        }

        if !recorded {
            return Ok(false);
        }
        self.record_delete(container, object_id).await?;
        info!(offer = %self.id, container, object_id, "object deleted");
        Ok(true)
    }

    async fn get_info(
        &self,
        container: &str,
        object_id: &str,
        refresh: bool,
    ) -> StorageResult<StoredObjectInfo> {
        ensure_container_safe(container)?;
        ensure_object_id_safe(object_id)?;
        let mut info = self.require_object(container, object_id).await?;
        if refresh {
            let (digest, size) = self
                .digest_payload(container, object_id, info.digest_algorithm)
                .await?;
            info.digest = digest;
            info.size = size;
        }
        Ok(info)
    }

    async fn check_object(
        &self,
        container: &str,
        object_id: &str,
        digest: &str,
        algorithm: DigestAlgorithm,
    ) -> StorageResult<bool> {
        ensure_container_safe(container)?;
        ensure_object_id_safe(object_id)?;
        self.require_object(container, object_id).await?;
        let (actual, _) = self.digest_payload(container, object_id, algorithm).await?;
        let matches = actual.eq_ignore_ascii_case(digest);
        if !matches {
            warn!(
                offer = %self.id,
                container,
                object_id,
                expected = digest,
                actual = %actual,
                "object digest check failed"
            );
        }
        Ok(matches)
    }

    async fn list_log(
        &self,
        container: &str,
        offset: Option<u64>,
        limit: usize,
        order: Order,
    ) -> StorageResult<Vec<OfferLogEntry>> {
        ensure_container_safe(container)?;
        if limit == 0 {
            return Err(StorageError::invalid("log listing limit must be positive"));
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT sequence, container, object_id, action, logged_at \
             FROM offer_log WHERE container = ",
        );
        builder.push_bind(container);
        match order {
            Order::Asc => {
                builder.push(" AND sequence > ");
                builder.push_bind(to_sql_offset(offset.unwrap_or(0)));
                builder.push(" ORDER BY sequence ASC");
            }
            Order::Desc => {
                if let Some(offset) = offset {
                    builder.push(" AND sequence < ");
                    builder.push_bind(to_sql_offset(offset));
                }
                builder.push(" ORDER BY sequence DESC");
            }
        }
        builder.push(" LIMIT ");
        builder.push_bind(limit as i64);

        let rows: Vec<OfferLogRow> = builder.build_query_as().fetch_all(&self.db).await?;
        rows.into_iter().map(OfferLogEntry::try_from).collect()
    }

    async fn list_objects(
        &self,
        container: &str,
        after: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<StoredObjectInfo>> {
        ensure_container_safe(container)?;
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT object_id, digest, digest_algorithm, size_bytes, created_at, \
             last_modified, last_accessed FROM objects WHERE container = ",
        );
        builder.push_bind(container);
        if let Some(after) = after {
            builder.push(" AND object_id > ");
            builder.push_bind(after);
        }
        builder.push(" ORDER BY object_id ASC LIMIT ");
        builder.push_bind(limit as i64);

        let rows: Vec<ObjectRow> = builder.build_query_as().fetch_all(&self.db).await?;
        rows.into_iter().map(StoredObjectInfo::try_from).collect()
    }

    async fn count_objects(&self, container: &str) -> StorageResult<u64> {
        ensure_container_safe(container)?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM objects WHERE container = ?")
            .bind(container)
            .fetch_one(&self.db)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn capacity(&self, container: &str) -> StorageResult<OfferCapacity> {
        ensure_container_safe(container)?;
        let used: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM objects WHERE container = ?",
        )
        .bind(container)
        .fetch_one(&self.db)
        .await?;
        let total: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(size_bytes), 0) FROM objects")
            .fetch_one(&self.db)
            .await?;
        Ok(OfferCapacity {
            usable_space: self.capacity_bytes.saturating_sub(total.max(0) as u64),
            used_space: used.max(0) as u64,
        })
    }

    async fn ping(&self) -> StorageResult<()> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.db).await?;
        if one != 1 {
            return Err(StorageError::Internal(format!(
                "unexpected sqlite result: {}",
                one
            )));
        }

        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read_back = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read_back? != b"readyz" {
            return Err(StorageError::Internal("file content mismatch".into()));
        }
        Ok(())
    }
}

/// Stream `stream` into a fresh file at `path`, hashing as it goes, and fsync.
async fn write_temp(
    path: &Path,
    mut stream: ByteStream,
    algorithm: DigestAlgorithm,
) -> StorageResult<(String, u64)> {
    let mut file = File::create(path).await?;
    let mut size: u64 = 0;
    let mut digest = Digest::new(algorithm);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        size += chunk.len() as u64;
        digest.update(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok((digest.finalize_hex(), size))
}

async fn append_log_entry(
    tx: &mut Transaction<'_, Sqlite>,
    container: &str,
    object_id: &str,
    action: OfferLogAction,
    time: DateTime<Utc>,
) -> StorageResult<u64> {
    let sequence: i64 = sqlx::query_scalar(
        "INSERT INTO offer_sequences (container, last_sequence) VALUES (?, 1)
         ON CONFLICT(container) DO UPDATE SET last_sequence = last_sequence + 1
         RETURNING last_sequence",
    )
    .bind(container)
    .fetch_one(&mut **tx)
    .await?;

    sqlx::query(
        "INSERT INTO offer_log (container, sequence, object_id, action, logged_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(container)
    .bind(sequence)
    .bind(object_id)
    .bind(action.as_str())
    .bind(time)
    .execute(&mut **tx)
    .await?;

    Ok(sequence as u64)
}

fn to_sql_offset(offset: u64) -> i64 {
    i64::try_from(offset).unwrap_or(i64::MAX)
}

fn payload_error(err: io::Error, container: &str, object_id: &str) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::object_not_found(container, object_id)
    } else {
        StorageError::Io(err)
    }
}

/// Object ids double as relative paths, so reject anything that could
/// escape the shard directory.
pub(crate) fn ensure_object_id_safe(object_id: &str) -> StorageResult<()> {
    if object_id.is_empty() {
        return Err(StorageError::invalid("object id must not be empty"));
    }
    if object_id.len() > MAX_OBJECT_ID_LEN {
        return Err(StorageError::invalid("object id is too long"));
    }
    if object_id.starts_with('/')
        || object_id.contains("..")
        || object_id.split('/').any(|segment| segment.is_empty() || segment == ".")
    {
        return Err(StorageError::invalid(format!(
            "object id `{}` is not a safe relative path",
            object_id
        )));
    }
    if object_id
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(StorageError::invalid(
            "object id contains control characters or backslashes",
        ));
    }
    Ok(())
}

pub(crate) fn ensure_container_safe(container: &str) -> StorageResult<()> {
    if container.is_empty() || container.len() > MAX_CONTAINER_LEN {
        return Err(StorageError::invalid(format!(
            "container name must be 1 to {} characters",
            MAX_CONTAINER_LEN
        )));
    }
    if container.starts_with('.')
        || !container
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(StorageError::invalid(format!(
            "container name `{}` is invalid",
            container
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::ErrorKind as StorageErrorKind, services::digest::digest_bytes};
    use bytes::Bytes;
    use futures::TryStreamExt;
    use std::time::Duration;
    use tempfile::TempDir;

    const UNITS: &str = "0_unit";
    const OBJECTS: &str = "0_object";

    fn payload(data: &[u8]) -> ByteStream {
        let chunks: Vec<io::Result<Bytes>> = data
            .chunks(3)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        stream::iter(chunks).boxed()
    }

    async fn read_all(stream: ByteStream) -> Vec<u8> {
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        chunks.concat()
    }

    async fn offer(dir: &TempDir) -> FileSystemOffer {
        FileSystemOffer::open("offer-a", dir.path().join("offer-a"), 1_000)
            .await
            .unwrap()
    }

    async fn put(
        offer: &FileSystemOffer,
        container: &str,
        object_id: &str,
        category: DataCategory,
        data: &[u8],
    ) -> StorageResult<PutObjectResult> {
        offer
            .create(
                PutObjectRequest::new(container, object_id, category),
                payload(data),
            )
            .await
    }

    fn leftover_temp_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
                    .count()
            })
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn create_then_read_back() {
        let dir = TempDir::new().unwrap();
        let offer = offer(&dir).await;

        let result = put(&offer, UNITS, "file1", DataCategory::Unit, b"data1")
            .await
            .unwrap();
        assert_eq!(result.outcome, WriteOutcome::Created);
        assert_eq!(result.info.size, 5);
        assert_eq!(
            result.info.digest,
            digest_bytes(DigestAlgorithm::Sha512, b"data1")
        );

        let (info, stream) = offer.read(UNITS, "file1").await.unwrap();
        assert_eq!(info.digest, result.info.digest);
        assert_eq!(read_all(stream).await, b"data1");
        assert!(offer.exists(UNITS, "file1").await.unwrap());

        let log = offer.list_log(UNITS, None, 10, Order::Asc).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].sequence, 1);
        assert_eq!(log[0].action, OfferLogAction::Write);
        assert_eq!(log[0].object_id, "file1");
    }

    #[tokio::test]
    async fn identical_write_is_not_logged_twice() {
        let dir = TempDir::new().unwrap();
        let offer = offer(&dir).await;

        put(&offer, OBJECTS, "obj", DataCategory::Object, b"payload")
            .await
            .unwrap();
        let again = put(&offer, OBJECTS, "obj", DataCategory::Object, b"payload")
            .await
            .unwrap();
        assert_eq!(again.outcome, WriteOutcome::Unchanged);

        let log = offer.list_log(OBJECTS, None, 10, Order::Asc).await.unwrap();
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn write_once_category_rejects_new_content() {
        let dir = TempDir::new().unwrap();
        let offer = offer(&dir).await;

        put(&offer, OBJECTS, "obj", DataCategory::Object, b"first")
            .await
            .unwrap();
        let err = put(&offer, OBJECTS, "obj", DataCategory::Object, b"second")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
        assert_eq!(err.kind(), StorageErrorKind::Conflict);

        let (_, stream) = offer.read(OBJECTS, "obj").await.unwrap();
        assert_eq!(read_all(stream).await, b"first");
        let parent = offer.object_path(OBJECTS, "obj");
        assert_eq!(leftover_temp_files(parent.parent().unwrap()), 0);
    }

    #[tokio::test]
    async fn rewritable_category_replaces_and_logs_each_write() {
        let dir = TempDir::new().unwrap();
        let offer = offer(&dir).await;

        let first = put(&offer, UNITS, "file1", DataCategory::Unit, b"data1")
            .await
            .unwrap();
        let second = put(&offer, UNITS, "file1", DataCategory::Unit, b"data1-V2")
            .await
            .unwrap();
        assert_eq!(second.outcome, WriteOutcome::Replaced);
        assert_eq!(second.info.created_at, first.info.created_at);
        assert_eq!(second.info.size, 8);

        let log = offer.list_log(UNITS, None, 10, Order::Asc).await.unwrap();
        let sequences: Vec<u64> = log.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let offer = offer(&dir).await;

        put(&offer, UNITS, "file1", DataCategory::Unit, b"data1")
            .await
            .unwrap();
        assert!(offer.delete(UNITS, "file1").await.unwrap());
        assert!(!offer.delete(UNITS, "file1").await.unwrap());
        assert!(!offer.exists(UNITS, "file1").await.unwrap());

        let err = offer.read(UNITS, "file1").await.err().unwrap();
        assert!(err.is_not_found());

        let log = offer.list_log(UNITS, None, 10, Order::Asc).await.unwrap();
        let actions: Vec<_> = log.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![OfferLogAction::Write, OfferLogAction::Delete]);
    }

    #[tokio::test]
    async fn log_offsets_in_both_directions() {
        let dir = TempDir::new().unwrap();
        let offer = offer(&dir).await;
        for i in 1..=5 {
            put(&offer, UNITS, &format!("obj-{}", i), DataCategory::Unit, b"x")
                .await
                .unwrap();
        }

        let seqs = |entries: Vec<OfferLogEntry>| -> Vec<u64> {
            entries.into_iter().map(|e| e.sequence).collect()
        };
        assert_eq!(
            seqs(offer.list_log(UNITS, Some(2), 2, Order::Asc).await.unwrap()),
            vec![3, 4]
        );
        assert_eq!(
            seqs(offer.list_log(UNITS, None, 2, Order::Desc).await.unwrap()),
            vec![5, 4]
        );
        assert_eq!(
            seqs(offer.list_log(UNITS, Some(3), 10, Order::Desc).await.unwrap()),
            vec![2, 1]
        );
        assert!(
            offer
                .list_log(UNITS, Some(5), 10, Order::Asc)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(offer.list_log(UNITS, None, 0, Order::Asc).await.is_err());
    }

    #[tokio::test]
    async fn sequences_are_per_container() {
        let dir = TempDir::new().unwrap();
        let offer = offer(&dir).await;
        put(&offer, UNITS, "a", DataCategory::Unit, b"1").await.unwrap();
        put(&offer, UNITS, "b", DataCategory::Unit, b"2").await.unwrap();
        put(&offer, OBJECTS, "c", DataCategory::Object, b"3")
            .await
            .unwrap();

        let objects = offer.list_log(OBJECTS, None, 10, Order::Asc).await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].sequence, 1);
    }

    #[tokio::test]
    async fn rejected_payloads_leave_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let offer = offer(&dir).await;

        let err = offer
            .create(
                PutObjectRequest::new(UNITS, "sized", DataCategory::Unit).with_declared_size(99),
                payload(b"short"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SizeMismatch { actual: 5, .. }));
        assert_eq!(err.kind(), StorageErrorKind::Technical);

        let err = offer
            .create(
                PutObjectRequest::new(UNITS, "hashed", DataCategory::Unit)
                    .with_expected_digest("00"),
                payload(b"short"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DigestMismatch { .. }));

        assert!(!offer.exists(UNITS, "sized").await.unwrap());
        assert!(!offer.exists(UNITS, "hashed").await.unwrap());
        assert!(
            offer
                .list_log(UNITS, None, 10, Order::Asc)
                .await
                .unwrap()
                .is_empty()
        );
        let path = offer.object_path(UNITS, "sized");
        assert_eq!(leftover_temp_files(path.parent().unwrap()), 0);
    }

    #[tokio::test]
    async fn cancelled_write_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let offer = offer(&dir).await;

        let stalled: ByteStream = stream::iter(vec![Ok(Bytes::from_static(b"part"))])
            .chain(stream::pending())
            .boxed();
        let write = offer.create(
            PutObjectRequest::new(UNITS, "slow", DataCategory::Unit),
            stalled,
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(50), write)
                .await
                .is_err()
        );

        let path = offer.object_path(UNITS, "slow");
        assert_eq!(leftover_temp_files(path.parent().unwrap()), 0);
        assert!(!offer.exists(UNITS, "slow").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_writes_to_one_object_are_serialized() {
        let dir = TempDir::new().unwrap();
        let offer = offer(&dir).await;

        let (first, second) = tokio::join!(
            put(&offer, UNITS, "shared", DataCategory::Unit, b"first version"),
            put(&offer, UNITS, "shared", DataCategory::Unit, b"second version"),
        );
        first.unwrap();
        second.unwrap();

        let recorded = offer.get_info(UNITS, "shared", false).await.unwrap();
        let candidates = [
            digest_bytes(DigestAlgorithm::Sha512, b"first version"),
            digest_bytes(DigestAlgorithm::Sha512, b"second version"),
        ];
        assert!(candidates.contains(&recorded.digest));
        let on_disk = offer.get_info(UNITS, "shared", true).await.unwrap();
        assert_eq!(on_disk.digest, recorded.digest);
        assert_eq!(
            offer.list_log(UNITS, None, 10, Order::Asc).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn corrupted_payload_is_detected_and_repaired() {
        let dir = TempDir::new().unwrap();
        let offer = offer(&dir).await;
        let stored = put(&offer, OBJECTS, "obj", DataCategory::Object, b"original")
            .await
            .unwrap();

        tokio::fs::write(offer.object_path(OBJECTS, "obj"), b"tampered")
            .await
            .unwrap();

        let recorded = offer.get_info(OBJECTS, "obj", false).await.unwrap();
        assert_eq!(recorded.digest, stored.info.digest);
        let refreshed = offer.get_info(OBJECTS, "obj", true).await.unwrap();
        assert_ne!(refreshed.digest, stored.info.digest);
        assert!(
            !offer
                .check_object(OBJECTS, "obj", &stored.info.digest, DigestAlgorithm::Sha512)
                .await
                .unwrap()
        );

        let repaired = put(&offer, OBJECTS, "obj", DataCategory::Object, b"original")
            .await
            .unwrap();
        assert_eq!(repaired.outcome, WriteOutcome::Repaired);
        assert!(
            offer
                .check_object(OBJECTS, "obj", &stored.info.digest, DigestAlgorithm::Sha512)
                .await
                .unwrap()
        );
        let log = offer.list_log(OBJECTS, None, 10, Order::Asc).await.unwrap();
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn capacity_and_counts() {
        let dir = TempDir::new().unwrap();
        let offer = offer(&dir).await;
        put(&offer, UNITS, "a", DataCategory::Unit, &[1u8; 10])
            .await
            .unwrap();
        put(&offer, OBJECTS, "b", DataCategory::Object, &[2u8; 20])
            .await
            .unwrap();

        let capacity = offer.capacity(UNITS).await.unwrap();
        assert_eq!(capacity.used_space, 10);
        assert_eq!(capacity.usable_space, 970);
        assert_eq!(offer.count_objects(UNITS).await.unwrap(), 1);
        assert_eq!(offer.count_objects("0_report").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lists_objects_after_a_marker() {
        let dir = TempDir::new().unwrap();
        let offer = offer(&dir).await;
        for id in ["c", "a", "b", "d"] {
            put(&offer, UNITS, id, DataCategory::Unit, id.as_bytes())
                .await
                .unwrap();
        }
        let ids = |objects: Vec<StoredObjectInfo>| -> Vec<String> {
            objects.into_iter().map(|o| o.object_id).collect()
        };
        assert_eq!(
            ids(offer.list_objects(UNITS, None, 2).await.unwrap()),
            vec!["a", "b"]
        );
        assert_eq!(
            ids(offer.list_objects(UNITS, Some("b"), 10).await.unwrap()),
            vec!["c", "d"]
        );
    }

    #[tokio::test]
    async fn log_batches_page_lazily() {
        let dir = TempDir::new().unwrap();
        let offer = Arc::new(offer(&dir).await);
        for i in 1..=5 {
            put(&offer, UNITS, &format!("obj-{}", i), DataCategory::Unit, b"x")
                .await
                .unwrap();
        }
        let batches: Vec<Vec<OfferLogEntry>> = log_batches(offer.clone(), UNITS.into(), None, 2)
            .try_collect()
            .await
            .unwrap();
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        let resumed: Vec<Vec<OfferLogEntry>> =
            log_batches(offer, UNITS.into(), Some(4), 2).try_collect().await.unwrap();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0][0].sequence, 5);
    }

    #[tokio::test]
    async fn unsafe_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let offer = offer(&dir).await;
        for id in ["", "../escape", "/abs", "back\\slash", "dir/", ".", "a//b", "a/./b"] {
            let err = put(&offer, UNITS, id, DataCategory::Unit, b"x")
                .await
                .unwrap_err();
            assert_eq!(err.kind(), StorageErrorKind::InvalidArgument, "id {:?}", id);
        }
        let err = put(&offer, "a/b", "ok", DataCategory::Unit, b"x")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidArgument);
        offer.ping().await.unwrap();
    }
}
