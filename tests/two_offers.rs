//! End-to-end scenarios over two filesystem offers sharing one strategy.

use archive_storage::{
    config::StorageConfig,
    errors::ErrorKind,
    models::{
        category::DataCategory,
        object::ObjectDescription,
        offer_log::Order,
        strategy::{OfferReference, StorageStrategy},
        sync_status::{SyncStatus, SyncStatusCode},
    },
    services::{
        digest::{DigestAlgorithm, digest_bytes},
        distribution::{DeleteObjectRequest, OfferLogQuery, StorageDistribution, StoreDataRequest},
        offer::{FileSystemOffer, Offer},
        offer_registry::{OfferRegistry, StaticStrategyProvider},
        offset_store::SqliteOffsetStore,
        staging::FileSystemStaging,
        synchronization::{OfferSyncService, SyncRequest},
    },
};
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;

const STRATEGY: &str = "two-offers";
const A: &str = "offer-a";
const B: &str = "offer-b";

struct Node {
    _dir: TempDir,
    workspace: FileSystemStaging,
    a: Arc<FileSystemOffer>,
    b: Arc<FileSystemOffer>,
    distribution: StorageDistribution,
    sync: OfferSyncService,
}

impl Node {
    async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let a = Arc::new(
            FileSystemOffer::open(A, dir.path().join(A), 1 << 30)
                .await
                .unwrap(),
        );
        let b = Arc::new(
            FileSystemOffer::open(B, dir.path().join(B), 1 << 30)
                .await
                .unwrap(),
        );
        let mut registry = OfferRegistry::new();
        registry.register(a.clone());
        registry.register(b.clone());
        let registry = Arc::new(registry);

        let strategies = StaticStrategyProvider::new([StorageStrategy::new(
            STRATEGY,
            vec![OfferReference::new(A).referent(), OfferReference::new(B)],
        )]);
        let workspace = FileSystemStaging::new(dir.path().join("workspace"));
        let config = StorageConfig::default();
        let distribution = StorageDistribution::new(
            registry.clone(),
            Arc::new(strategies),
            Arc::new(workspace.clone()),
            config.clone(),
        );

        let url = format!("sqlite://{}", dir.path().join("offsets.db").display());
        let offsets = SqliteOffsetStore::connect(&url).await.unwrap();
        let sync = OfferSyncService::new(registry, Arc::new(offsets), config);

        Self {
            _dir: dir,
            workspace,
            a,
            b,
            distribution,
            sync,
        }
    }

    async fn store(
        &self,
        object_id: &str,
        category: DataCategory,
        data: &[u8],
        offers: Option<&[&str]>,
    ) -> archive_storage::errors::StorageResult<String> {
        let path = self.workspace.path_of("ingest", object_id);
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&path, data).await.unwrap();
        let result = self
            .distribution
            .store_data(StoreDataRequest {
                strategy_id: STRATEGY.into(),
                tenant: 0,
                object_id: object_id.into(),
                category,
                description: Some(ObjectDescription::new("ingest", object_id)),
                requester: "two-offers".into(),
                offer_ids: offers.map(ids),
            })
            .await?;
        Ok(result.digest)
    }

    async fn digests(&self, category: DataCategory, object_id: &str) -> Vec<String> {
        self.distribution
            .get_information(STRATEGY, 0, category, object_id, &ids(&[A, B]), true)
            .await
            .unwrap()
            .into_values()
            .map(|info| info.digest)
            .collect()
    }

    async fn log_len(&self, offer_id: &str, category: DataCategory) -> usize {
        self.distribution
            .get_offer_logs(
                STRATEGY,
                offer_id,
                0,
                category,
                OfferLogQuery {
                    offset: None,
                    limit: 1000,
                    order: Order::Asc,
                },
            )
            .await
            .unwrap()
            .len()
    }

    async fn wait_for_sync(&self) -> SyncStatus {
        for _ in 0..500 {
            if !self.sync.is_synchronization_running() {
                return self.sync.get_last_synchronization_status().await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("synchronization did not finish");
    }
}

fn ids(offers: &[&str]) -> Vec<String> {
    offers.iter().map(|id| id.to_string()).collect()
}

fn sha512(data: &[u8]) -> String {
    digest_bytes(DigestAlgorithm::Sha512, data)
}

#[tokio::test]
async fn rewritable_file_follows_its_latest_content_on_both_offers() {
    let node = Node::start().await;

    let digest = node
        .store("file1", DataCategory::Unit, b"data1", None)
        .await
        .unwrap();
    assert_eq!(digest, sha512(b"data1"));
    assert_eq!(node.digests(DataCategory::Unit, "file1").await, vec![
        sha512(b"data1"),
        sha512(b"data1")
    ]);

    let digest = node
        .store("file1", DataCategory::Unit, b"data1-V2", None)
        .await
        .unwrap();
    assert_eq!(digest, sha512(b"data1-V2"));
    assert_eq!(node.digests(DataCategory::Unit, "file1").await, vec![
        sha512(b"data1-V2"),
        sha512(b"data1-V2")
    ]);

    // Same content again is a no-op and leaves the logs untouched.
    node.store("file1", DataCategory::Unit, b"data1-V2", None)
        .await
        .unwrap();
    assert_eq!(node.log_len(A, DataCategory::Unit).await, 2);
    assert_eq!(node.log_len(B, DataCategory::Unit).await, 2);
}

#[tokio::test]
async fn write_once_object_keeps_its_first_content_everywhere() {
    let node = Node::start().await;
    node.store("obj", DataCategory::Object, b"contentA", None)
        .await
        .unwrap();

    // Idempotent with identical bytes.
    node.store("obj", DataCategory::Object, b"contentA", None)
        .await
        .unwrap();

    let err = node
        .store("obj", DataCategory::Object, b"contentB", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(node.digests(DataCategory::Object, "obj").await, vec![
        sha512(b"contentA"),
        sha512(b"contentA")
    ]);
}

#[tokio::test]
async fn synchronization_replays_then_resumes() {
    let node = Node::start().await;
    for id in ["o1", "o2", "o3", "o4"] {
        node.store(id, DataCategory::Unit, id.as_bytes(), Some(&[A]))
            .await
            .unwrap();
    }
    node.distribution
        .delete_object(DeleteObjectRequest {
            strategy_id: STRATEGY.into(),
            tenant: 0,
            object_id: "o2".into(),
            category: DataCategory::Unit,
            digest: sha512(b"o2"),
            digest_algorithm: DigestAlgorithm::Sha512,
            offer_ids: Some(ids(&[A])),
        })
        .await
        .unwrap();
    assert_eq!(node.b.count_objects("0_unit").await.unwrap(), 0);

    node.sync
        .start_synchronization(SyncRequest {
            source_offer: A.into(),
            target_offer: B.into(),
            category: DataCategory::Unit,
            tenant: 0,
            start_offset: None,
        })
        .await
        .unwrap();
    let status = node.wait_for_sync().await;
    assert_eq!(status.status, SyncStatusCode::Ok);
    assert_eq!(status.current_offset, 5);

    let on_b: Vec<String> = node
        .b
        .list_objects("0_unit", None, 100)
        .await
        .unwrap()
        .into_iter()
        .map(|info| info.object_id)
        .collect();
    assert_eq!(on_b, vec!["o1", "o3", "o4"]);

    node.store("o5", DataCategory::Unit, b"o5", Some(&[A]))
        .await
        .unwrap();
    node.sync
        .resume_synchronization(A, B, DataCategory::Unit, 0)
        .await
        .unwrap();
    let status = node.wait_for_sync().await;
    assert_eq!(status.start_offset, 5);
    assert_eq!(status.current_offset, 6);
    assert_eq!(status.written, 1);
    assert!(node.b.exists("0_unit", "o5").await.unwrap());
}

#[tokio::test]
async fn copy_repairs_a_damaged_copy() {
    let node = Node::start().await;
    node.store("report", DataCategory::Report, b"quarterly", None)
        .await
        .unwrap();

    let path = node.b.object_path("0_report", "report");
    tokio::fs::write(&path, b"bit rot").await.unwrap();
    let digest = sha512(b"quarterly");
    assert!(
        !node
            .b
            .check_object("0_report", "report", &digest, DigestAlgorithm::Sha512)
            .await
            .unwrap()
    );

    let info = node
        .distribution
        .copy_object_to_one_offer_another(0, "report", DataCategory::Report, A, B)
        .await
        .unwrap();
    assert_eq!(info.digest, digest);
    assert!(
        node.b
            .check_object("0_report", "report", &digest, DigestAlgorithm::Sha512)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn delete_on_one_offer_leaves_the_other_copy() {
    let node = Node::start().await;
    node.store("logbook-1", DataCategory::Logbook, b"events", None)
        .await
        .unwrap();

    node.distribution
        .delete_object(DeleteObjectRequest {
            strategy_id: STRATEGY.into(),
            tenant: 0,
            object_id: "logbook-1".into(),
            category: DataCategory::Logbook,
            digest: sha512(b"events"),
            digest_algorithm: DigestAlgorithm::Sha512,
            offer_ids: Some(ids(&[A])),
        })
        .await
        .unwrap();

    assert!(!node.a.exists("0_logbook", "logbook-1").await.unwrap());
    assert!(node.b.exists("0_logbook", "logbook-1").await.unwrap());

    let served = node
        .distribution
        .get_container_object(STRATEGY, 0, DataCategory::Logbook, "logbook-1")
        .await
        .unwrap();
    assert_eq!(served.offer_id, B);
}
