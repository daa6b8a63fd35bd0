use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anchorsafe_core::EntityKind;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use crate::{RefreshOutcome, SyncPipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncJobState {
    Pending,
    Running,
    Complete,
    Failed,
}

/// Point-in-time view of a background sync job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SyncJobSnapshot {
    pub task_id: Uuid,
    pub state: SyncJobState,
    pub job_started: Option<DateTime<Utc>>,
    pub job_completed: Option<DateTime<Utc>>,
    pub messages: Vec<String>,
}

impl SyncJobSnapshot {
    fn pending(task_id: Uuid) -> Self {
        Self {
            task_id,
            state: SyncJobState::Pending,
            job_started: None,
            job_completed: None,
            messages: Vec::new(),
        }
    }
}

/// How long a finished job stays queryable.
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(60 * 60);

/// In-process registry of refreshes started in the background.
#[derive(Debug, Clone)]
pub struct SyncJobRegistry {
    jobs: Arc<Mutex<HashMap<Uuid, SyncJobSnapshot>>>,
    retention: Duration,
}

impl Default for SyncJobRegistry {
    fn default() -> Self {
        Self::with_retention(DEFAULT_JOB_RETENTION)
    }
}

impl SyncJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            retention,
        }
    }

    /// Drop jobs that finished more than the retention period ago.
    pub async fn prune(&self) -> usize {
        let Ok(retention) = ChronoDuration::from_std(self.retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, job| job.job_completed.map_or(true, |done| done > cutoff));
        let pruned = before - jobs.len();
        if pruned > 0 {
            info!(pruned, "pruned finished sync jobs");
        }
        pruned
    }

    pub async fn get(&self, task_id: Uuid) -> Option<SyncJobSnapshot> {
        self.jobs.lock().await.get(&task_id).cloned()
    }

    /// Register a job and run the refresh for `entities` on a tokio task.
    pub async fn start(&self, pipeline: Arc<SyncPipeline>, entities: Vec<EntityKind>) -> Uuid {
        self.prune().await;
        let task_id = self.register().await;
        info!(%task_id, entities = ?entities, "registered sync job");

        let registry = self.clone();
        self.track(task_id, async move {
            registry.run(task_id, pipeline, entities).await;
        });
        task_id
    }

    async fn register(&self) -> Uuid {
        let task_id = Uuid::new_v4();
        self.jobs
            .lock()
            .await
            .insert(task_id, SyncJobSnapshot::pending(task_id));
        task_id
    }

    /// Spawn `work` and mark the job failed if the task panics or is cancelled.
    fn track(&self, task_id: Uuid, work: impl Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(work);
        let registry = self.clone();
        tokio::spawn(async move {
            if let Err(err) = handle.await {
                error!(%task_id, error = %err, "sync task aborted");
                registry
                    .update(task_id, |job| {
                        job.messages.push(format!("Sync task aborted: {err}"));
                        job.state = SyncJobState::Failed;
                        job.job_completed = Some(Utc::now());
                    })
                    .await;
            }
        });
    }

    async fn update(&self, task_id: Uuid, apply: impl FnOnce(&mut SyncJobSnapshot)) {
        if let Some(job) = self.jobs.lock().await.get_mut(&task_id) {
            apply(job);
        }
    }

    async fn run(&self, task_id: Uuid, pipeline: Arc<SyncPipeline>, entities: Vec<EntityKind>) {
        self.update(task_id, |job| {
            job.state = SyncJobState::Running;
            job.job_started = Some(Utc::now());
            job.messages.push("Starting sync process".to_string());
        })
        .await;

        let outcome = pipeline.data_refresh(&entities, None).await;

        self.update(task_id, |job| {
            match outcome {
                Ok(RefreshOutcome::Refreshed { counts, elapsed }) => {
                    for kind in EntityKind::ALL.iter().filter(|k| entities.contains(*k)) {
                        let added = match kind {
                            EntityKind::Clients => counts.clients,
                            EntityKind::Sites => counts.sites,
                            EntityKind::Locations => counts.locations,
                            EntityKind::Inspections => counts.inspections,
                        };
                        job.messages.push(format!("Synced {kind}: {added} added"));
                    }
                    job.messages.push(format!(
                        "Sync finished in {}",
                        crate::format_process_time(elapsed)
                    ));
                    job.state = SyncJobState::Complete;
                }
                Ok(RefreshOutcome::NoData { .. }) => {
                    job.messages.push("Couldn't get data.".to_string());
                    job.state = SyncJobState::Failed;
                }
                Err(err) => {
                    let detail = format!("{err:#}");
                    error!(%task_id, error = %detail, "sync job failed");
                    job.messages.push(detail);
                    job.state = SyncJobState::Failed;
                }
            }
            job.job_completed = Some(Utc::now());
        })
        .await;

        info!(%task_id, "sync job finished");
    }
}
