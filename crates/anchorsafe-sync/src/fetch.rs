use std::collections::BTreeMap;
use std::sync::Arc;

use anchorsafe_core::{
    AssetListItem, CacheContainer, CustomerListItem, EmployeeListItem, HasIdentity, JobListItem,
    ResourceKind, SiteListItem,
};
use anchorsafe_simpro::SimProClient;
use anchorsafe_storage::CacheStore;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Per-resource outcome of a fetch round: `true` when a cache file was written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchReport {
    pub resources: BTreeMap<ResourceKind, bool>,
}

impl FetchReport {
    pub fn any(&self) -> bool {
        self.resources.values().any(|written| *written)
    }
}

/// Pulls resources from SimPro into the JSON cache.
#[derive(Debug, Clone)]
pub struct ResourceFetcher {
    client: SimProClient,
    cache: Arc<CacheStore>,
}

impl ResourceFetcher {
    pub fn new(client: SimProClient, cache: Arc<CacheStore>) -> Self {
        Self { client, cache }
    }

    pub fn client(&self) -> &SimProClient {
        &self.client
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub async fn fetch(&self, kind: ResourceKind, start_page: u32, incremental: bool) -> Result<bool> {
        match kind {
            ResourceKind::Jobs => {
                self.fetch_resource::<JobListItem>(kind, start_page, incremental)
                    .await
            }
            ResourceKind::Customers => {
                self.fetch_resource::<CustomerListItem>(kind, start_page, incremental)
                    .await
            }
            ResourceKind::Employees => {
                self.fetch_resource::<EmployeeListItem>(kind, start_page, incremental)
                    .await
            }
            ResourceKind::Sites => {
                self.fetch_resource::<SiteListItem>(kind, start_page, incremental)
                    .await
            }
            ResourceKind::Assets => {
                self.fetch_resource::<AssetListItem>(kind, start_page, incremental)
                    .await
            }
        }
    }

    /// Fetch each resource in turn. The first failure aborts the round.
    pub async fn get_data(
        &self,
        kinds: &[ResourceKind],
        start_page: u32,
        incremental: bool,
    ) -> Result<FetchReport> {
        let mut report = FetchReport::default();
        for kind in kinds {
            if report.resources.contains_key(kind) {
                continue;
            }
            let written = self.fetch(*kind, start_page, incremental).await?;
            report.resources.insert(*kind, written);
        }
        Ok(report)
    }

    /// Fetch one resource and rewrite its cache file.
    ///
    /// An incremental fetch asks only for items changed since the stored
    /// `LastUpdated` and merges them over the cached items; a resource with no
    /// cache file yet is fetched in full. Returns `false`, leaving the cache
    /// untouched, when the remote returns no items.
    pub async fn fetch_resource<T>(
        &self,
        kind: ResourceKind,
        start_page: u32,
        incremental: bool,
    ) -> Result<bool>
    where
        T: DeserializeOwned + Serialize + HasIdentity,
    {
        let name = kind.name();
        let _guard = self.cache.lock(name).await;

        let previous = self
            .cache
            .last_updated(name)
            .await
            .with_context(|| format!("reading {name} freshness"))?;
        let since = if incremental { previous } else { None };

        let descriptor = self.client.registry().descriptor(kind);
        let query = descriptor.query(self.client.settings().page_size);
        let items: Vec<T> = self
            .client
            .request_data(&descriptor.endpoint, None, &query, start_page, true, since)
            .await
            .with_context(|| format!("fetching {name} from SimPro"))?;

        if items.is_empty() {
            info!(resource = name, incremental, "no new items");
            return Ok(false);
        }
        let fetched = items.len();

        let items = if incremental {
            self.cache
                .merge(name, items)
                .await
                .with_context(|| format!("merging {name} cache"))?
        } else {
            items
        };

        let now = Utc::now();
        let stamp = previous.map_or(now, |prev| prev.max(now));
        let cached = items.len();
        self.cache
            .write(name, &CacheContainer::new(stamp, items))
            .await
            .with_context(|| format!("writing {name} cache"))?;

        info!(resource = name, incremental, fetched, cached, "cache refreshed");
        Ok(true)
    }
}
