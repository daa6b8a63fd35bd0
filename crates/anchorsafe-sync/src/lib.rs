//! SimPro -> AnchorSafe sync pipeline: cache refresh, reconciliation and scheduling.

mod fetch;
mod jobs;
mod reconcile;
mod store;

pub use fetch::{FetchReport, ResourceFetcher};
pub use jobs::{SyncJobRegistry, SyncJobSnapshot, SyncJobState, DEFAULT_JOB_RETENTION};
pub use reconcile::{InspectionUsers, ReconcileCounts, Reconciler};
pub use store::{
    ClientRow, InspectionRow, LocalStore, LocationRow, LogRow, LogType, NewClient, NewInspection,
    NewLocation, NewSite, SiteRow, DEFAULT_INSPECTION_STATUS_ID,
};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anchorsafe_core::{EntityKind, ResourceKind};
use anchorsafe_simpro::{SimProClient, SimProSettings, MAX_PAGE_SIZE};
use anchorsafe_storage::{BackoffPolicy, CacheStore, HttpClientConfig, HttpFetcher};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub const CRATE_NAME: &str = "anchorsafe-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub cache_dir: PathBuf,
    pub simpro: SimProSettings,
    pub cron_token: Option<String>,
    pub admin_user_id: i64,
    pub unassigned_user_id: i64,
    pub max_retries: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://anchorsafe.db?mode=rwc".to_string(),
            cache_dir: PathBuf::from("./cache"),
            simpro: SimProSettings::default(),
            cron_token: None,
            admin_user_id: 1,
            unassigned_user_id: 1,
            max_retries: 3,
            http_timeout_secs: 30,
            user_agent: "anchorsafe-sync/0.1".to_string(),
            scheduler_enabled: false,
            sync_cron: "0 0 */6 * * *".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            cache_dir: std::env::var("SIMPRO_API_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            simpro: SimProSettings {
                base_url: std::env::var("SIMPRO_API_BASE_URL").unwrap_or_default(),
                version: std::env::var("SIMPRO_API_VERSION")
                    .unwrap_or(defaults.simpro.version),
                key: std::env::var("SIMPRO_API_KEY").unwrap_or_default(),
                company_id: env_parse("SIMPRO_API_COMPANY_ID", 0),
                page_size: env_parse("SIMPRO_PAGE_SIZE", MAX_PAGE_SIZE),
                page_concurrency: env_parse("SIMPRO_PAGE_CONCURRENCY", 4),
            },
            cron_token: std::env::var("AS_API_CRON_TOKEN")
                .ok()
                .filter(|v| !v.is_empty()),
            admin_user_id: env_parse("AS_API_ADMIN_USER_ID", defaults.admin_user_id),
            unassigned_user_id: env_parse("AS_API_UNASSIGNED_USER_ID", defaults.unassigned_user_id),
            max_retries: env_parse("SIMPRO_MAX_RETRIES", defaults.max_retries),
            http_timeout_secs: env_parse("ANCHORSAFE_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            user_agent: std::env::var("ANCHORSAFE_USER_AGENT").unwrap_or(defaults.user_agent),
            scheduler_enabled: std::env::var("ANCHORSAFE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or(defaults.sync_cron),
        }
    }

    pub fn inspection_users(&self) -> InspectionUsers {
        InspectionUsers {
            admin_user_id: self.admin_user_id,
            unassigned_user_id: self.unassigned_user_id,
        }
    }

    fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            concurrency: self.simpro.page_concurrency.max(1),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..BackoffPolicy::default()
            },
        }
    }
}

/// Result of a `DataRefresh` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// None of the selected resources returned any items.
    NoData { elapsed: Duration },
    Refreshed {
        counts: ReconcileCounts,
        elapsed: Duration,
    },
}

/// `{minutes}:{seconds:02}.{hundredths:02}`
pub fn format_process_time(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    format!(
        "{}:{:02}.{:02}",
        total_secs / 60,
        total_secs % 60,
        elapsed.subsec_millis() / 10
    )
}

pub fn refresh_log_message(counts: &ReconcileCounts, elapsed: Duration) -> String {
    format!(
        "Refresh Data (SimPro) - New data added: {} Client(s), {} Site(s), {} Location(s), {} Inspection(s). Time elapsed (milliseconds): {}",
        counts.clients,
        counts.sites,
        counts.locations,
        counts.inspections,
        elapsed.as_secs_f64() * 1000.0
    )
}

/// Labels reported by `LastDataRefresh`, keyed by the local entity they feed.
const REFRESH_LABELS: [(&str, ResourceKind); 4] = [
    ("Clients", ResourceKind::Customers),
    ("Sites", ResourceKind::Sites),
    ("Locations", ResourceKind::Assets),
    ("Jobs", ResourceKind::Jobs),
];

pub struct SyncPipeline {
    config: SyncConfig,
    cache: Arc<CacheStore>,
    fetcher: ResourceFetcher,
    store: LocalStore,
}

impl SyncPipeline {
    /// Build a pipeline around an already opened store.
    pub fn new(config: SyncConfig, store: LocalStore) -> Result<Self> {
        let cache = Arc::new(CacheStore::new(config.cache_dir.clone()));
        let http = HttpFetcher::new(config.http_config())?;
        let client = SimProClient::new(config.simpro.clone(), Arc::new(http));
        let fetcher = ResourceFetcher::new(client, cache.clone());
        Ok(Self {
            config,
            cache,
            fetcher,
            store,
        })
    }

    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let store = LocalStore::connect(&config.database_url).await?;
        Self::new(config, store)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn fetcher(&self) -> &ResourceFetcher {
        &self.fetcher
    }

    /// `true` when `token` matches the configured cron token.
    pub fn token_matches(&self, token: &str) -> bool {
        self.config
            .cron_token
            .as_deref()
            .is_some_and(|expected| expected == token)
    }

    /// Refresh the cache for `kinds`; `true` when at least one resource was written.
    pub async fn fetch_remote(&self, kinds: &[ResourceKind], incremental: bool) -> Result<bool> {
        let report = self.fetcher.get_data(kinds, 1, incremental).await?;
        Ok(report.any())
    }

    /// Incrementally fetch the resources behind `entities`, then reconcile
    /// them in dependency order and record the outcome in `as_logs`.
    pub async fn data_refresh(
        &self,
        entities: &[EntityKind],
        user_id: Option<i64>,
    ) -> Result<RefreshOutcome> {
        let started = Instant::now();
        let selected: Vec<EntityKind> = EntityKind::ALL
            .into_iter()
            .filter(|kind| entities.contains(kind))
            .collect();
        let resources: Vec<ResourceKind> = selected.iter().map(|kind| kind.source()).collect();

        let report = self.fetcher.get_data(&resources, 1, true).await?;
        if !report.any() {
            let elapsed = started.elapsed();
            info!(elapsed_ms = elapsed.as_millis() as u64, "refresh fetched no data");
            return Ok(RefreshOutcome::NoData { elapsed });
        }

        let reconciler = Reconciler::new(&self.cache, &self.store, self.config.inspection_users());
        let mut counts = ReconcileCounts::default();
        for kind in selected {
            let added = reconciler
                .reconcile(kind)
                .await
                .with_context(|| format!("reconciling {kind}"))?;
            counts.record(kind, added);
        }

        let elapsed = started.elapsed();
        let message = refresh_log_message(&counts, elapsed);
        self.store
            .add_log_entry(&message, LogType::DataPull, user_id)
            .await?;
        info!(
            clients = counts.clients,
            sites = counts.sites,
            locations = counts.locations,
            inspections = counts.inspections,
            elapsed_ms = elapsed.as_millis() as u64,
            "refresh complete"
        );
        Ok(RefreshOutcome::Refreshed { counts, elapsed })
    }

    /// `LastUpdated` of every cache file present, keyed by report label.
    pub async fn last_data_refresh(&self) -> Result<BTreeMap<&'static str, DateTime<Utc>>> {
        let mut out = BTreeMap::new();
        for (label, kind) in REFRESH_LABELS {
            if let Some(stamp) = self
                .cache
                .last_updated(kind.name())
                .await
                .with_context(|| format!("reading {kind} freshness"))?
            {
                out.insert(label, stamp);
            }
        }
        Ok(out)
    }

    pub async fn cached_raw(&self, kind: ResourceKind) -> Result<Option<String>> {
        self.cache
            .read_raw(kind.name())
            .await
            .with_context(|| format!("reading {kind} cache"))
    }

    pub async fn test_remote(&self) -> bool {
        self.fetcher.client().test().await
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.as_str();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.data_refresh(&EntityKind::ALL, None).await {
                    Ok(outcome) => info!(?outcome, "scheduled refresh finished"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled refresh failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}
