//! src/services/distribution.rs
//!
//! The distribution layer runs one logical operation against every offer of
//! a storage strategy: it fans writes and deletes out concurrently, checks
//! that all offers end up with the same digest and attributes every failure
//! to the offer that produced it. It keeps no state between calls.

use crate::{
    config::StorageConfig,
    errors::{ErrorKind, StorageError, StorageResult},
    models::{
        category::DataCategory,
        object::{
            ByteStream, ContainerInformation, ObjectDescription, ObjectListPage, PutObjectResult,
            StoredInfoResult, StoredObjectInfo,
        },
        offer_log::{OfferLogEntry, Order},
    },
    services::{
        digest::{DigestAlgorithm, digest_stream},
        offer::{Offer, PutObjectRequest},
        offer_registry::{OfferRegistry, StrategyProvider},
        staging::StagingSource,
    },
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use futures::future::join_all;
use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct StoreDataRequest {
    pub strategy_id: String,
    pub tenant: u32,
    pub object_id: String,
    pub category: DataCategory,
    pub description: Option<ObjectDescription>,
    /// Who asked for the write. Only logged.
    pub requester: String,
    /// Restrict the write to these offers of the strategy.
    pub offer_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct DeleteObjectRequest {
    pub strategy_id: String,
    pub tenant: u32,
    pub object_id: String,
    pub category: DataCategory,
    /// Digest the live object must have for the delete to proceed.
    pub digest: String,
    pub digest_algorithm: DigestAlgorithm,
    pub offer_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy)]
pub struct OfferLogQuery {
    pub offset: Option<u64>,
    pub limit: usize,
    pub order: Order,
}

/// Object bytes served by the first offer that could provide them.
pub struct ContainerObject {
    pub offer_id: String,
    pub info: StoredObjectInfo,
    pub stream: ByteStream,
}

#[derive(Clone)]
pub struct StorageDistribution {
    registry: Arc<OfferRegistry>,
    strategies: Arc<dyn StrategyProvider>,
    staging: Arc<dyn StagingSource>,
    config: StorageConfig,
    permits: Arc<Semaphore>,
}

impl StorageDistribution {
    pub fn new(
        registry: Arc<OfferRegistry>,
        strategies: Arc<dyn StrategyProvider>,
        staging: Arc<dyn StagingSource>,
        config: StorageConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_parallel_transfers.max(1)));
        Self {
            registry,
            strategies,
            staging,
            config,
            permits,
        }
    }

    pub fn container(&self, tenant: u32, category: DataCategory) -> String {
        category.container_name(tenant, self.config.container_environment())
    }

    /// Enabled offers of the strategy, or the requested subset of them.
    fn resolve_offers(
        &self,
        strategy_id: &str,
        offer_ids: Option<&[String]>,
    ) -> StorageResult<Vec<Arc<dyn Offer>>> {
        if strategy_id.trim().is_empty() {
            return Err(StorageError::invalid("strategy id is required"));
        }
        let strategy = self.strategies.strategy(strategy_id)?;
        let enabled = strategy.enabled_offer_ids();
        if enabled.is_empty() {
            return Err(StorageError::NoOffer(strategy_id.to_string()));
        }

        let ids = match offer_ids {
            None => enabled,
            Some([]) => return Err(StorageError::invalid("offer id list is empty")),
            Some(subset) => {
                if let Some(outsider) = subset.iter().find(|id| !strategy.is_offer_enabled(id)) {
                    return Err(StorageError::invalid(format!(
                        "offer `{}` is not an enabled offer of strategy `{}`",
                        outsider, strategy_id
                    )));
                }
                subset.to_vec()
            }
        };
        ids.iter().map(|id| self.registry.get(id)).collect()
    }

    /// Run `op` once per offer, concurrently within the transfer permit
    /// budget. Results come back in offer order.
    async fn fan_out<T, F, Fut>(
        &self,
        offers: &[Arc<dyn Offer>],
        op: F,
    ) -> Vec<(String, StorageResult<T>)>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn Offer>) -> Fut,
        Fut: Future<Output = StorageResult<T>> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for (index, offer) in offers.iter().enumerate() {
            let permits = self.permits.clone();
            let task = op(offer.clone());
            tasks.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => task.await,
                    Err(_) => Err(StorageError::Internal("transfer pool closed".into())),
                };
                (index, result)
            });
        }

        let mut results: Vec<Option<StorageResult<T>>> = offers.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(err) => error!(error = %err, "offer task did not complete"),
            }
        }

        offers
            .iter()
            .zip(results)
            .map(|(offer, result)| {
                let result = result.unwrap_or_else(|| {
                    Err(StorageError::Internal("offer task did not complete".into()))
                });
                (offer.id().to_string(), result)
            })
            .collect()
    }

    /// Hash the staged bytes once, before any offer is touched.
    async fn upstream_digest(
        &self,
        description: &ObjectDescription,
    ) -> StorageResult<(String, u64)> {
        let algorithm = self.config.digest_algorithm;
        with_retries(self.config.transfer_attempts, "staging read", || async move {
            let staged = self
                .staging
                .open(
                    &description.workspace_container,
                    &description.workspace_object_uri,
                )
                .await?;
            let timeout = self.config.transfer_timeout(staged.size.unwrap_or(0));
            let (digest, size) = tokio::time::timeout(timeout, digest_stream(algorithm, staged.stream))
                .await
                .map_err(|_| timeout_error(timeout))??;
            if let Some(declared) = staged.size {
                if declared != size {
                    return Err(StorageError::SizeMismatch {
                        object_id: description.workspace_object_uri.clone(),
                        declared,
                        actual: size,
                    });
                }
            }
            Ok((digest, size))
        })
        .await
    }

    /// A write-once object must not already hold other content on any offer.
    async fn ensure_no_conflict(
        &self,
        offers: &[Arc<dyn Offer>],
        container: &str,
        object_id: &str,
        digest: &str,
    ) -> StorageResult<()> {
        let algorithm = self.config.digest_algorithm;
        let checks = offers.iter().map(|offer| async move {
            let same = match offer.get_info(container, object_id, false).await {
                Ok(info) if info.digest_algorithm == algorithm => {
                    info.digest.eq_ignore_ascii_case(digest)
                }
                Ok(_) => {
                    offer
                        .check_object(container, object_id, digest, algorithm)
                        .await?
                }
                Err(err) if err.is_not_found() => true,
                Err(err) => return Err(err),
            };
            if same {
                Ok(())
            } else {
                Err(StorageError::AlreadyExists {
                    container: container.to_string(),
                    object_id: object_id.to_string(),
                })
            }
        });
        let results = join_all(checks).await;
        let labelled = offers
            .iter()
            .map(|offer| offer.id().to_string())
            .zip(results)
            .collect();
        split_results(labelled, "conflict check").map(|_| ())
    }

    /// Copy the staged object to every offer of the strategy and verify that
    /// all of them hold the upstream digest.
    pub async fn store_data(&self, request: StoreDataRequest) -> StorageResult<StoredInfoResult> {
        let description = validate_store_request(&request)?;
        let offers = self.resolve_offers(&request.strategy_id, request.offer_ids.as_deref())?;
        let container = self.container(request.tenant, request.category);
        let algorithm = self.config.digest_algorithm;

        let (digest, size) = self.upstream_digest(&description).await?;
        debug!(
            object_id = %request.object_id,
            container = %container,
            requester = %request.requester,
            size,
            "upstream digest computed"
        );

        if !request.category.is_rewritable() {
            self.ensure_no_conflict(&offers, &container, &request.object_id, &digest)
                .await?;
        }

        let put = PutObjectRequest::new(container.clone(), request.object_id.clone(), request.category)
            .with_digest_algorithm(algorithm)
            .with_expected_digest(digest.clone())
            .with_declared_size(size);
        let timeout = self.config.transfer_timeout(size);
        let attempts = self.config.transfer_attempts;
        let results = self
            .fan_out(&offers, |offer| {
                let staging = self.staging.clone();
                let description = description.clone();
                let put = put.clone();
                async move {
                    with_retries(attempts, "offer transfer", || {
                        transfer(
                            offer.as_ref(),
                            staging.as_ref(),
                            &description,
                            put.clone(),
                            timeout,
                        )
                    })
                    .await
                }
            })
            .await;
        let stored: Vec<(String, PutObjectResult)> = split_results(results, "store")?;

        for (offer_id, result) in &stored {
            if result.info.digest_algorithm == algorithm
                && !result.info.digest.eq_ignore_ascii_case(&digest)
            {
                return Err(StorageError::OffersDisagree {
                    object_id: request.object_id.clone(),
                    details: format!(
                        "offer `{}` holds {} but upstream is {}",
                        offer_id, result.info.digest, digest
                    ),
                });
            }
        }

        let checked = &offers[0];
        if !checked
            .check_object(&container, &request.object_id, &digest, algorithm)
            .await
            .map_err(|err| err.for_offer(checked.id()))?
        {
            return Err(StorageError::OffersDisagree {
                object_id: request.object_id.clone(),
                details: format!("read-back from offer `{}` does not match", checked.id()),
            }
            .for_offer(checked.id()));
        }

        let first = &stored[0].1.info;
        let result = StoredInfoResult {
            object_id: request.object_id.clone(),
            info: format!("Object with id '{}' stored successfully", request.object_id),
            digest,
            digest_algorithm: algorithm,
            size,
            offer_ids: stored.iter().map(|(offer_id, _)| offer_id.clone()).collect(),
            creation_time: first.created_at,
            last_modified_time: first.last_modified,
            last_access_time: first.last_accessed,
            last_checked_time: Utc::now(),
        };
        info!(
            object_id = %result.object_id,
            container = %container,
            offers = ?result.offer_ids,
            size,
            "object stored"
        );
        Ok(result)
    }

    /// Delete an object from the strategy's offers once its live digest has
    /// been confirmed. Offers that do not hold it are skipped.
    pub async fn delete_object(&self, request: DeleteObjectRequest) -> StorageResult<()> {
        if request.object_id.trim().is_empty() {
            return Err(StorageError::invalid("object id is required"));
        }
        if request.digest.trim().is_empty() {
            return Err(StorageError::invalid("expected digest is required"));
        }
        let offers = self.resolve_offers(&request.strategy_id, request.offer_ids.as_deref())?;
        let container = self.container(request.tenant, request.category);

        let mut verified = false;
        for offer in &offers {
            match offer
                .check_object(
                    &container,
                    &request.object_id,
                    &request.digest,
                    request.digest_algorithm,
                )
                .await
            {
                Ok(true) => {
                    verified = true;
                    break;
                }
                Ok(false) => {
                    return Err(StorageError::LiveDigestMismatch {
                        object_id: request.object_id.clone(),
                        expected: request.digest.clone(),
                    }
                    .for_offer(offer.id()));
                }
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.for_offer(offer.id())),
            }
        }
        if !verified {
            debug!(object_id = %request.object_id, container = %container, "nothing to delete");
            return Ok(());
        }

        let timeout = self.config.minimum_timeout;
        let results = self
            .fan_out(&offers, |offer| {
                let container = container.clone();
                let object_id = request.object_id.clone();
                async move {
                    tokio::time::timeout(timeout, offer.delete(&container, &object_id))
                        .await
                        .map_err(|_| timeout_error(timeout))?
                }
            })
            .await;
        split_results(results, "delete")?;
        info!(object_id = %request.object_id, container = %container, "object deleted");
        Ok(())
    }

    /// Metadata of the object on each listed offer. Offers that do not hold
    /// it are left out of the map.
    pub async fn get_information(
        &self,
        strategy_id: &str,
        tenant: u32,
        category: DataCategory,
        object_id: &str,
        offer_ids: &[String],
        force_refresh: bool,
    ) -> StorageResult<BTreeMap<String, StoredObjectInfo>> {
        let offers = self.resolve_offers(strategy_id, Some(offer_ids))?;
        let container = self.container(tenant, category);
        let results = self
            .fan_out(&offers, |offer| {
                let container = container.clone();
                let object_id = object_id.to_string();
                async move {
                    match offer.get_info(&container, &object_id, force_refresh).await {
                        Ok(info) => Ok(Some(info)),
                        Err(err) if err.is_not_found() => Ok(None),
                        Err(err) => Err(err),
                    }
                }
            })
            .await;
        Ok(split_results(results, "get information")?
            .into_iter()
            .filter_map(|(offer_id, info)| info.map(|info| (offer_id, info)))
            .collect())
    }

    /// Replicate one object from `source_offer` to `target_offer`, applying
    /// the category rewrite policy on the target.
    pub async fn copy_object_to_one_offer_another(
        &self,
        tenant: u32,
        object_id: &str,
        category: DataCategory,
        source_offer: &str,
        target_offer: &str,
    ) -> StorageResult<StoredObjectInfo> {
        if source_offer == target_offer {
            return Err(StorageError::invalid("source and target offers must differ"));
        }
        let source = self.registry.get(source_offer)?;
        let target = self.registry.get(target_offer)?;
        let container = self.container(tenant, category);

        let (info, stream) = source
            .read(&container, object_id)
            .await
            .map_err(|err| err.for_offer(source_offer))?;
        let put = PutObjectRequest::new(container.clone(), object_id, category)
            .with_digest_algorithm(info.digest_algorithm)
            .with_expected_digest(info.digest.clone())
            .with_declared_size(info.size);
        let timeout = self.config.transfer_timeout(info.size);
        let copied = tokio::time::timeout(timeout, target.create(put, stream))
            .await
            .map_err(|_| timeout_error(timeout))
            .and_then(|result| result)
            .map_err(|err| err.for_offer(target_offer))?;

        if !copied.info.digest.eq_ignore_ascii_case(&info.digest) {
            return Err(StorageError::DigestMismatch {
                object_id: object_id.to_string(),
                expected: info.digest,
                actual: copied.info.digest,
            }
            .for_offer(target_offer));
        }
        info!(
            object_id,
            container = %container,
            source_offer,
            target_offer,
            outcome = ?copied.outcome,
            "object copied"
        );
        Ok(copied.info)
    }

    /// One page of the container as seen by the first offer of the strategy.
    pub async fn list_container_objects(
        &self,
        strategy_id: &str,
        tenant: u32,
        category: DataCategory,
        cursor: Option<&str>,
    ) -> StorageResult<ObjectListPage> {
        let offers = self.resolve_offers(strategy_id, None)?;
        let offer = &offers[0];
        let container = self.container(tenant, category);
        let after = match cursor.filter(|c| !c.is_empty()) {
            Some(cursor) => Some(decode_cursor(cursor)?),
            None => None,
        };

        let page_size = self.config.list_page_size.max(1);
        let mut objects = offer
            .list_objects(&container, after.as_deref(), page_size + 1)
            .await
            .map_err(|err| err.for_offer(offer.id()))?;
        let next_cursor = if objects.len() > page_size {
            objects.truncate(page_size);
            objects.last().map(|last| encode_cursor(&last.object_id))
        } else {
            None
        };
        Ok(ObjectListPage {
            objects,
            next_cursor,
        })
    }

    /// Bytes of the object from the highest-priority offer holding it.
    pub async fn get_container_object(
        &self,
        strategy_id: &str,
        tenant: u32,
        category: DataCategory,
        object_id: &str,
    ) -> StorageResult<ContainerObject> {
        let offers = self.resolve_offers(strategy_id, None)?;
        let container = self.container(tenant, category);
        for offer in &offers {
            match offer.read(&container, object_id).await {
                Ok((info, stream)) => {
                    return Ok(ContainerObject {
                        offer_id: offer.id().to_string(),
                        info,
                        stream,
                    });
                }
                Err(err) if err.kind() == ErrorKind::Technical => {
                    warn!(
                        offer_id = %offer.id(),
                        object_id,
                        error = %err,
                        "read failed, trying next offer"
                    );
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.for_offer(offer.id())),
            }
        }
        Err(StorageError::object_not_found(&container, object_id))
    }

    pub async fn get_container_information(
        &self,
        strategy_id: &str,
        tenant: u32,
        category: DataCategory,
    ) -> StorageResult<Vec<ContainerInformation>> {
        let offers = self.resolve_offers(strategy_id, None)?;
        let container = self.container(tenant, category);
        let copies = offers.len() as u64;
        let results = self
            .fan_out(&offers, |offer| {
                let container = container.clone();
                async move {
                    let capacity = offer.capacity(&container).await?;
                    let object_count = offer.count_objects(&container).await?;
                    Ok(ContainerInformation {
                        offer_id: offer.id().to_string(),
                        usable_space: capacity.usable_space,
                        used_space: capacity.used_space,
                        object_count,
                        nbc: copies,
                    })
                }
            })
            .await;
        Ok(split_results(results, "container information")?
            .into_iter()
            .map(|(_, information)| information)
            .collect())
    }

    pub async fn get_offer_logs(
        &self,
        strategy_id: &str,
        offer_id: &str,
        tenant: u32,
        category: DataCategory,
        query: OfferLogQuery,
    ) -> StorageResult<Vec<OfferLogEntry>> {
        let offers = self.resolve_offers(strategy_id, Some(&[offer_id.to_string()]))?;
        let container = self.container(tenant, category);
        offers[0]
            .list_log(&container, query.offset, query.limit, query.order)
            .await
            .map_err(|err| err.for_offer(offer_id))
    }
}

fn validate_store_request(request: &StoreDataRequest) -> StorageResult<ObjectDescription> {
    if request.strategy_id.trim().is_empty() {
        return Err(StorageError::invalid("strategy id is required"));
    }
    if request.object_id.trim().is_empty() {
        return Err(StorageError::invalid("object id is required"));
    }
    let description = request
        .description
        .as_ref()
        .ok_or_else(|| StorageError::invalid("object description is required"))?;
    if description.workspace_container.trim().is_empty()
        || description.workspace_object_uri.trim().is_empty()
    {
        return Err(StorageError::invalid(
            "object description needs a workspace container and uri",
        ));
    }
    Ok(description.clone())
}

/// Open the staged bytes and stream them into one offer, within `timeout`.
async fn transfer(
    offer: &dyn Offer,
    staging: &dyn StagingSource,
    description: &ObjectDescription,
    put: PutObjectRequest,
    timeout: Duration,
) -> StorageResult<PutObjectResult> {
    let attempt = async {
        let staged = staging
            .open(
                &description.workspace_container,
                &description.workspace_object_uri,
            )
            .await?;
        offer.create(put, staged.stream).await
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| timeout_error(timeout))?
}

/// Retry `op` on technical failures, up to `attempts` calls in total.
async fn with_retries<T, F, Fut>(attempts: u32, what: &str, mut op: F) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_retryable() && attempt < attempts => {
                warn!(attempt, attempts, error = %err, "{} failed, retrying", what);
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Keep successes, or return the most significant failure. A conflict or a
/// missing object is reported over a technical error so callers do not retry
/// something that cannot succeed.
fn split_results<T>(
    results: Vec<(String, StorageResult<T>)>,
    action: &str,
) -> StorageResult<Vec<(String, T)>> {
    let mut successes = Vec::with_capacity(results.len());
    let mut failures = Vec::new();
    for (offer_id, result) in results {
        match result {
            Ok(value) => successes.push((offer_id, value)),
            Err(err) => {
                warn!(offer_id = %offer_id, error = %err, "{} failed on offer", action);
                failures.push(err.for_offer(&offer_id));
            }
        }
    }
    match failures.into_iter().min_by_key(|err| severity(err.kind())) {
        Some(err) => {
            error!(error = %err, "{} aborted", action);
            Err(err)
        }
        None => Ok(successes),
    }
}

fn severity(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::Conflict => 0,
        ErrorKind::NotFound => 1,
        ErrorKind::InvalidArgument => 2,
        ErrorKind::Technical => 3,
    }
}

fn timeout_error(timeout: Duration) -> StorageError {
    StorageError::Timeout {
        timeout_ms: timeout.as_millis() as u64,
    }
}

fn encode_cursor(object_id: &str) -> String {
    URL_SAFE_NO_PAD.encode(object_id.as_bytes())
}

fn decode_cursor(cursor: &str) -> StorageResult<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| StorageError::invalid("listing cursor is not valid base64"))?;
    String::from_utf8(bytes).map_err(|_| StorageError::invalid("listing cursor is not valid utf-8"))
}
