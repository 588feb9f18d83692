use crate::{
    models::strategy::{OfferReference, StorageStrategy},
    services::digest::DigestAlgorithm,
};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{collections::HashSet, env, path::PathBuf, str::FromStr, time::Duration};

/// Tunables of the distribution layer and the synchronization service.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Prefix of every container name, e.g. `prod` gives `prod_0_object`.
    pub environment: Option<String>,
    pub digest_algorithm: DigestAlgorithm,
    /// Transfer budget per KiB of payload.
    pub ms_per_kb: u64,
    pub minimum_timeout: Duration,
    pub transfer_attempts: u32,
    pub max_parallel_transfers: usize,
    pub list_page_size: usize,
    pub sync_batch_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            environment: None,
            digest_algorithm: DigestAlgorithm::Sha512,
            ms_per_kb: 100,
            minimum_timeout: Duration::from_secs(10),
            transfer_attempts: 3,
            max_parallel_transfers: 8,
            list_page_size: 100,
            sync_batch_size: 1000,
        }
    }
}

impl StorageConfig {
    /// Time allowed to move `size` bytes to one offer.
    pub fn transfer_timeout(&self, size: u64) -> Duration {
        let scaled = Duration::from_millis((size / 1024).saturating_mul(self.ms_per_kb));
        scaled.max(self.minimum_timeout)
    }

    pub fn container_environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub workspace_dir: String,
    pub offers: Vec<String>,
    pub offer_capacity_bytes: u64,
    pub strategy_id: String,
    pub sync_database_url: String,
    pub storage: StorageConfig,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Archive storage offers, distribution and synchronization")]
pub struct Args {
    /// Host to bind to (overrides ARCHIVE_STORAGE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides ARCHIVE_STORAGE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Root directory; each offer lives in a subdirectory named after it
    /// (overrides ARCHIVE_STORAGE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Staging workspace read by storeData (overrides ARCHIVE_STORAGE_WORKSPACE_DIR)
    #[arg(long)]
    pub workspace_dir: Option<String>,

    /// Comma-separated offer ids, the first one is the referent
    /// (overrides ARCHIVE_STORAGE_OFFERS)
    #[arg(long, value_delimiter = ',')]
    pub offers: Vec<String>,

    /// Capacity of each offer in bytes (overrides ARCHIVE_STORAGE_OFFER_CAPACITY)
    #[arg(long)]
    pub offer_capacity: Option<u64>,

    /// Name of the strategy spanning all offers (overrides ARCHIVE_STORAGE_STRATEGY)
    #[arg(long)]
    pub strategy: Option<String>,

    /// Container name prefix (overrides ARCHIVE_STORAGE_ENVIRONMENT)
    #[arg(long)]
    pub environment: Option<String>,

    /// MD5, SHA-256, SHA-384 or SHA-512 (overrides ARCHIVE_STORAGE_DIGEST)
    #[arg(long)]
    pub digest: Option<String>,

    /// Transfer timeout per KiB in ms (overrides ARCHIVE_STORAGE_MS_PER_KB)
    #[arg(long)]
    pub ms_per_kb: Option<u64>,

    /// Lower bound of the transfer timeout in ms (overrides ARCHIVE_STORAGE_MIN_TIMEOUT_MS)
    #[arg(long)]
    pub min_timeout_ms: Option<u64>,

    /// Concurrent offer transfers (overrides ARCHIVE_STORAGE_MAX_PARALLEL)
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Log entries per synchronization batch (overrides ARCHIVE_STORAGE_SYNC_BATCH)
    #[arg(long)]
    pub sync_batch: Option<usize>,

    /// Database of synchronization offsets (overrides ARCHIVE_STORAGE_SYNC_DATABASE_URL)
    #[arg(long)]
    pub sync_database_url: Option<String>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<Self> {
        let defaults = StorageConfig::default();

        // --- Environment fallback ---
        let env_host = env::var("ARCHIVE_STORAGE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("ARCHIVE_STORAGE_PORT", 3000u16)?;
        let env_storage =
            env::var("ARCHIVE_STORAGE_STORAGE_DIR").unwrap_or_else(|_| "./data/offers".into());
        let env_workspace =
            env::var("ARCHIVE_STORAGE_WORKSPACE_DIR").unwrap_or_else(|_| "./data/workspace".into());
        let env_offers = env::var("ARCHIVE_STORAGE_OFFERS")
            .unwrap_or_else(|_| "offer-fs-1,offer-fs-2".into());
        let env_capacity = env_parse("ARCHIVE_STORAGE_OFFER_CAPACITY", 100 * 1024 * 1024 * 1024u64)?;
        let env_strategy =
            env::var("ARCHIVE_STORAGE_STRATEGY").unwrap_or_else(|_| "default".into());
        let env_environment = env::var("ARCHIVE_STORAGE_ENVIRONMENT").ok();
        let env_digest = env_parse("ARCHIVE_STORAGE_DIGEST", defaults.digest_algorithm)?;
        let env_ms_per_kb = env_parse("ARCHIVE_STORAGE_MS_PER_KB", defaults.ms_per_kb)?;
        let env_min_timeout = env_parse(
            "ARCHIVE_STORAGE_MIN_TIMEOUT_MS",
            defaults.minimum_timeout.as_millis() as u64,
        )?;
        let env_parallel =
            env_parse("ARCHIVE_STORAGE_MAX_PARALLEL", defaults.max_parallel_transfers)?;
        let env_batch = env_parse("ARCHIVE_STORAGE_SYNC_BATCH", defaults.sync_batch_size)?;
        let env_sync_db = env::var("ARCHIVE_STORAGE_SYNC_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/sync/offsets.db".into());

        // --- Merge ---
        let offers = if args.offers.is_empty() {
            split_offers(&env_offers)
        } else {
            args.offers
                .iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect()
        };
        let digest_algorithm = match args.digest {
            Some(value) => value
                .parse::<DigestAlgorithm>()
                .with_context(|| format!("parsing --digest value `{}`", value))?,
            None => env_digest,
        };

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            workspace_dir: args.workspace_dir.unwrap_or(env_workspace),
            offers,
            offer_capacity_bytes: args.offer_capacity.unwrap_or(env_capacity),
            strategy_id: args.strategy.unwrap_or(env_strategy),
            sync_database_url: args.sync_database_url.unwrap_or(env_sync_db),
            storage: StorageConfig {
                environment: args.environment.or(env_environment),
                digest_algorithm,
                ms_per_kb: args.ms_per_kb.unwrap_or(env_ms_per_kb),
                minimum_timeout: Duration::from_millis(args.min_timeout_ms.unwrap_or(env_min_timeout)),
                max_parallel_transfers: args.max_parallel.unwrap_or(env_parallel),
                sync_batch_size: args.sync_batch.unwrap_or(env_batch),
                ..defaults
            },
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.offers.is_empty() {
            bail!("at least one offer must be configured");
        }
        let mut seen = HashSet::new();
        for offer in &self.offers {
            if !seen.insert(offer.as_str()) {
                bail!("offer `{}` is configured twice", offer);
            }
        }
        if self.storage.max_parallel_transfers == 0 {
            bail!("max parallel transfers must be at least 1");
        }
        if self.storage.sync_batch_size == 0 {
            bail!("sync batch size must be at least 1");
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn offer_path(&self, offer_id: &str) -> PathBuf {
        PathBuf::from(&self.storage_dir).join(offer_id)
    }

    /// Single strategy spanning every configured offer, first one as referent.
    pub fn strategy(&self) -> StorageStrategy {
        let offers = self
            .offers
            .iter()
            .enumerate()
            .map(|(index, id)| {
                let offer = OfferReference::new(id.clone());
                if index == 0 { offer.referent() } else { offer }
            })
            .collect();
        StorageStrategy::new(self.strategy_id.clone(), offers)
    }
}

fn split_offers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
