//! src/services/synchronization.rs
//!
//! Offer synchronization replays the log of a source offer onto a target
//! offer, batch by batch, in sequence order. At most one job runs at a time;
//! its progress is readable while it runs and after it ends, and the last
//! applied sequence is persisted after every batch so a later job can resume.

use crate::{
    config::StorageConfig,
    errors::{ErrorKind, StorageError, StorageResult},
    models::{
        category::DataCategory,
        offer_log::{OfferLogAction, OfferLogEntry},
        sync_status::{SyncStatus, SyncStatusCode},
    },
    services::{
        offer::{Offer, PutObjectRequest, log_batches},
        offer_registry::OfferRegistry,
        offset_store::OffsetStore,
    },
};
use chrono::Utc;
use futures::TryStreamExt;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub source_offer: String,
    pub target_offer: String,
    pub category: DataCategory,
    pub tenant: u32,
    /// Replay entries strictly after this sequence. `None` starts from the
    /// beginning of the log.
    pub start_offset: Option<u64>,
}

struct SyncJob {
    source: Arc<dyn Offer>,
    target: Arc<dyn Offer>,
    container: String,
    category: DataCategory,
    start_offset: u64,
}

enum JobEnd {
    Completed,
    Stopped,
}

#[derive(Default)]
struct BatchProgress {
    written: u64,
    deleted: u64,
    skipped: u64,
    conflicts: u64,
}

/// Single-flight synchronization between two offers.
#[derive(Clone)]
pub struct OfferSyncService {
    registry: Arc<OfferRegistry>,
    offsets: Arc<dyn OffsetStore>,
    config: StorageConfig,
    running: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    status: Arc<RwLock<Option<SyncStatus>>>,
}

impl OfferSyncService {
    pub fn new(
        registry: Arc<OfferRegistry>,
        offsets: Arc<dyn OffsetStore>,
        config: StorageConfig,
    ) -> Self {
        Self {
            registry,
            offsets,
            config,
            running: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            status: Arc::new(RwLock::new(None)),
        }
    }

    /// Start a background job and return its request id. Rejected with
    /// `SynchronizationRunning` while another job is active.
    pub async fn start_synchronization(&self, request: SyncRequest) -> StorageResult<String> {
        if request.source_offer == request.target_offer {
            return Err(StorageError::invalid("source and target offers must differ"));
        }
        let source = self.known_offer(&request.source_offer)?;
        let target = self.known_offer(&request.target_offer)?;
        let container = request
            .category
            .container_name(request.tenant, self.config.container_environment());

        // The flag only changes under the status lock, so a status snapshot
        // and the flag never disagree.
        let mut current = self.status.write().await;
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(
                source_offer = %request.source_offer,
                target_offer = %request.target_offer,
                "synchronization already running, request rejected"
            );
            return Err(StorageError::SynchronizationRunning);
        }
        self.stop_requested.store(false, Ordering::SeqCst);

        let request_id = Uuid::new_v4().to_string();
        let start_offset = request.start_offset.unwrap_or(0);
        *current = Some(SyncStatus {
            request_id: request_id.clone(),
            running: true,
            source_offer: request.source_offer.clone(),
            target_offer: request.target_offer.clone(),
            container: container.clone(),
            start_offset,
            current_offset: start_offset,
            start_date: Utc::now(),
            end_date: None,
            status: SyncStatusCode::Running,
            written: 0,
            deleted: 0,
            skipped: 0,
            conflicts: 0,
            last_error: None,
        });
        drop(current);
        info!(
            request_id = %request_id,
            source_offer = %request.source_offer,
            target_offer = %request.target_offer,
            container = %container,
            start_offset,
            "synchronization started"
        );

        let job = SyncJob {
            source,
            target,
            container,
            category: request.category,
            start_offset,
        };
        let service = self.clone();
        tokio::spawn(async move { service.run(job).await });
        Ok(request_id)
    }

    /// Start from the offset persisted by the previous job for the same
    /// source, target and container.
    pub async fn resume_synchronization(
        &self,
        source_offer: &str,
        target_offer: &str,
        category: DataCategory,
        tenant: u32,
    ) -> StorageResult<String> {
        let container = category.container_name(tenant, self.config.container_environment());
        let offset = self
            .offsets
            .load(source_offer, target_offer, &container)
            .await?
            .unwrap_or(0);
        self.start_synchronization(SyncRequest {
            source_offer: source_offer.to_string(),
            target_offer: target_offer.to_string(),
            category,
            tenant,
            start_offset: Some(offset),
        })
        .await
    }

    /// Ask the running job to end before its next batch.
    pub fn stop_synchronization(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        info!("synchronization stop requested");
        true
    }

    pub fn is_synchronization_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn get_last_synchronization_status(&self) -> Option<SyncStatus> {
        self.status.read().await.clone()
    }

    fn known_offer(&self, offer_id: &str) -> StorageResult<Arc<dyn Offer>> {
        self.registry
            .get(offer_id)
            .map_err(|_| StorageError::invalid(format!("unknown offer `{}`", offer_id)))
    }

    async fn run(self, job: SyncJob) {
        let outcome = self.replay(&job).await;

        {
            let mut guard = self.status.write().await;
            if let Some(status) = guard.as_mut() {
                status.running = false;
                status.end_date = Some(Utc::now());
                match &outcome {
                    Ok(JobEnd::Completed) => {
                        status.status = SyncStatusCode::Ok;
                        info!(
                            request_id = %status.request_id,
                            current_offset = status.current_offset,
                            written = status.written,
                            deleted = status.deleted,
                            skipped = status.skipped,
                            conflicts = status.conflicts,
                            "synchronization completed"
                        );
                    }
                    Ok(JobEnd::Stopped) => {
                        status.status = SyncStatusCode::Ko;
                        status.last_error = Some("stopped".into());
                        warn!(
                            request_id = %status.request_id,
                            current_offset = status.current_offset,
                            "synchronization stopped"
                        );
                    }
                    Err(err) => {
                        status.status = SyncStatusCode::Ko;
                        status.last_error = Some(err.to_string());
                        error!(
                            request_id = %status.request_id,
                            current_offset = status.current_offset,
                            error = %err,
                            "synchronization failed"
                        );
                    }
                }
            }
            self.running.store(false, Ordering::SeqCst);
        }
    }

    async fn replay(&self, job: &SyncJob) -> StorageResult<JobEnd> {
        let mut batches = log_batches(
            job.source.clone(),
            job.container.clone(),
            Some(job.start_offset),
            self.config.sync_batch_size,
        );

        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                return Ok(JobEnd::Stopped);
            }
            let Some(batch) = batches
                .try_next()
                .await
                .map_err(|err| err.for_offer(job.source.id()))?
            else {
                return Ok(JobEnd::Completed);
            };

            let mut progress = BatchProgress::default();
            for entry in &batch {
                self.apply(job, entry, &mut progress).await?;
            }
            let Some(last) = batch.last().map(|entry| entry.sequence) else {
                continue;
            };
            self.offsets
                .save(job.source.id(), job.target.id(), &job.container, last)
                .await?;

            if let Some(status) = self.status.write().await.as_mut() {
                status.current_offset = last;
                status.written += progress.written;
                status.deleted += progress.deleted;
                status.skipped += progress.skipped;
                status.conflicts += progress.conflicts;
            }
            debug!(
                container = %job.container,
                sequence = last,
                entries = batch.len(),
                "synchronization batch applied"
            );
        }
    }

    async fn apply(
        &self,
        job: &SyncJob,
        entry: &OfferLogEntry,
        progress: &mut BatchProgress,
    ) -> StorageResult<()> {
        match entry.action {
            OfferLogAction::Write => {
                let (info, stream) = match job.source.read(&job.container, &entry.object_id).await {
                    Ok(found) => found,
                    Err(err) if err.is_not_found() => {
                        debug!(
                            object_id = %entry.object_id,
                            sequence = entry.sequence,
                            "object gone from source, skipping write"
                        );
                        progress.skipped += 1;
                        return Ok(());
                    }
                    Err(err) => return Err(err.for_offer(job.source.id())),
                };

                let put = PutObjectRequest::new(
                    job.container.clone(),
                    entry.object_id.clone(),
                    job.category,
                )
                .with_digest_algorithm(info.digest_algorithm)
                .with_expected_digest(info.digest.clone())
                .with_declared_size(info.size);
                let timeout = self.config.transfer_timeout(info.size);
                let written = tokio::time::timeout(timeout, job.target.create(put, stream))
                    .await
                    .map_err(|_| StorageError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    })
                    .and_then(|result| result);
                match written {
                    Ok(_) => progress.written += 1,
                    Err(err) if err.kind() == ErrorKind::Conflict => {
                        warn!(
                            object_id = %entry.object_id,
                            sequence = entry.sequence,
                            target_offer = %job.target.id(),
                            "target holds different content for write-once object"
                        );
                        progress.conflicts += 1;
                    }
                    Err(err) => return Err(err.for_offer(job.target.id())),
                }
            }
            OfferLogAction::Delete => {
                let timeout = self.config.minimum_timeout;
                tokio::time::timeout(timeout, job.target.delete(&job.container, &entry.object_id))
                    .await
                    .map_err(|_| StorageError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    })
                    .and_then(|result| result)
                    .map_err(|err| err.for_offer(job.target.id()))?;
                progress.deleted += 1;
            }
        }
        Ok(())
    }
}
