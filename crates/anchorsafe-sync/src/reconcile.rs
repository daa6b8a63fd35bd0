use std::collections::HashSet;

use anchorsafe_core::{
    AssetListItem, CacheContainer, CustomerListItem, EntityKind, HasIdentity, JobListItem,
    JobStage, ResourceKind, SiteListItem, BUILDING_FIELD_NAME,
};
use anchorsafe_storage::CacheStore;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::store::{
    LocalStore, NewClient, NewInspection, NewLocation, NewSite, DEFAULT_INSPECTION_STATUS_ID,
};

/// Users stamped on inspections created from remote jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InspectionUsers {
    pub admin_user_id: i64,
    pub unassigned_user_id: i64,
}

impl Default for InspectionUsers {
    fn default() -> Self {
        Self {
            admin_user_id: 1,
            unassigned_user_id: 1,
        }
    }
}

/// Rows added per entity during one reconciliation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileCounts {
    pub clients: usize,
    pub sites: usize,
    pub locations: usize,
    pub inspections: usize,
}

impl ReconcileCounts {
    pub fn record(&mut self, kind: EntityKind, added: usize) {
        match kind {
            EntityKind::Clients => self.clients += added,
            EntityKind::Sites => self.sites += added,
            EntityKind::Locations => self.locations += added,
            EntityKind::Inspections => self.inspections += added,
        }
    }

    pub fn total(&self) -> usize {
        self.clients + self.sites + self.locations + self.inspections
    }
}

fn trimmed(value: Option<&str>) -> String {
    value.unwrap_or_default().trim().to_string()
}

/// Inserts cached remote items that have no local row yet. Parents must be
/// reconciled before children; rows whose parents cannot be resolved are
/// skipped and picked up by a later run.
pub struct Reconciler<'a> {
    cache: &'a CacheStore,
    store: &'a LocalStore,
    users: InspectionUsers,
}

impl<'a> Reconciler<'a> {
    pub fn new(cache: &'a CacheStore, store: &'a LocalStore, users: InspectionUsers) -> Self {
        Self {
            cache,
            store,
            users,
        }
    }

    pub async fn reconcile(&self, kind: EntityKind) -> Result<usize> {
        let added = match kind {
            EntityKind::Clients => self.clients().await?,
            EntityKind::Sites => self.sites().await?,
            EntityKind::Locations => self.locations().await?,
            EntityKind::Inspections => self.inspections().await?,
        };
        info!(entity = %kind, added, "reconciled");
        Ok(added)
    }

    /// Cached items of `resource` whose remote id is not linked to a `kind` row.
    async fn pending<T>(&self, resource: ResourceKind, kind: EntityKind) -> Result<Vec<T>>
    where
        T: DeserializeOwned + HasIdentity,
    {
        let Some(CacheContainer { items, .. }) = self
            .cache
            .read::<T>(resource.name())
            .await
            .with_context(|| format!("reading {resource} cache"))?
        else {
            debug!(resource = %resource, "no cache file; nothing to reconcile");
            return Ok(Vec::new());
        };
        let existing: HashSet<i64> = self.store.simpro_ids(kind).await?;
        Ok(items
            .into_iter()
            .filter(|item| !existing.contains(&item.identity()))
            .collect())
    }

    async fn clients(&self) -> Result<usize> {
        let customers: Vec<CustomerListItem> =
            self.pending(ResourceKind::Customers, EntityKind::Clients).await?;
        let mut added = 0;
        for customer in customers {
            let client = NewClient {
                client_name: trimmed(customer.company_name.as_deref()),
                simpro_id: customer.id,
            };
            if self.store.insert_client(&client).await? {
                added += 1;
            }
        }
        Ok(added)
    }

    async fn sites(&self) -> Result<usize> {
        let sites: Vec<SiteListItem> = self.pending(ResourceKind::Sites, EntityKind::Sites).await?;
        let mut added = 0;
        for site in sites {
            let mut client_id = None;
            for customer in &site.customers {
                if let Some(id) = self
                    .store
                    .id_for_simpro_id(EntityKind::Clients, customer.id)
                    .await?
                {
                    client_id = Some(id);
                    break;
                }
            }
            let Some(client_id) = client_id else {
                debug!(simpro_id = site.id, "site has no reconciled customer; skipping");
                continue;
            };

            let address = site.address.clone().unwrap_or_default();
            let row = NewSite {
                client_id,
                site_name: trimmed(site.name.as_deref()),
                street: trimmed(address.street_address.as_deref()),
                city: trimmed(address.city.as_deref()),
                state: trimmed(address.state.as_deref()),
                post_code: trimmed(address.postal_code.as_deref()),
                is_active: !site.archived,
                simpro_id: site.id,
            };
            if self.store.insert_site(&row).await? {
                added += 1;
            }
        }
        Ok(added)
    }

    async fn locations(&self) -> Result<usize> {
        let assets: Vec<AssetListItem> =
            self.pending(ResourceKind::Assets, EntityKind::Locations).await?;
        let mut added = 0;
        for asset in assets {
            let Some(building) = asset.custom_field_value(BUILDING_FIELD_NAME) else {
                continue;
            };
            let Some(site) = &asset.site else {
                continue;
            };
            let Some(site_id) = self.store.id_for_simpro_id(EntityKind::Sites, site.id).await? else {
                debug!(simpro_id = asset.id, site = site.id, "asset site not reconciled; skipping");
                continue;
            };

            let row = NewLocation {
                site_id,
                location_name: building.trim().to_string(),
                simpro_id: asset.id,
            };
            if self.store.insert_location(&row).await? {
                added += 1;
            }
        }
        Ok(added)
    }

    async fn inspections(&self) -> Result<usize> {
        let jobs: Vec<JobListItem> =
            self.pending(ResourceKind::Jobs, EntityKind::Inspections).await?;
        let mut added = 0;
        for job in jobs {
            let (Some(customer), Some(site)) = (&job.customer, &job.site) else {
                debug!(simpro_id = job.id, "job without customer or site; skipping");
                continue;
            };
            let client_id = self.store.id_for_simpro_id(EntityKind::Clients, customer.id).await?;
            let site_id = self.store.id_for_simpro_id(EntityKind::Sites, site.id).await?;
            let (Some(client_id), Some(site_id)) = (client_id, site_id) else {
                info!(
                    simpro_id = job.id,
                    customer = customer.id,
                    site = site.id,
                    "job does not match a local client and site; skipping"
                );
                continue;
            };

            let row = NewInspection {
                client_id,
                site_id,
                inspection_status_id: self.status_for_stage(job.stage.as_deref()).await?,
                user_id: self.users.unassigned_user_id,
                created_user_id: self.users.admin_user_id,
                modified_user_id: self.users.admin_user_id,
                simpro_id: job.id,
            };
            if self.store.insert_inspection(&row).await? {
                added += 1;
            }
        }
        Ok(added)
    }

    async fn status_for_stage(&self, stage: Option<&str>) -> Result<i64> {
        let Some(stage) = stage.filter(|s| !s.trim().is_empty()) else {
            return Ok(DEFAULT_INSPECTION_STATUS_ID);
        };
        let stage = match stage.trim().parse::<JobStage>() {
            Ok(stage) => stage,
            Err(err) => {
                warn!(error = %err, "falling back to default inspection status");
                return Ok(DEFAULT_INSPECTION_STATUS_ID);
            }
        };
        Ok(self
            .store
            .inspection_status_id(stage.status_description())
            .await?
            .unwrap_or(DEFAULT_INSPECTION_STATUS_ID))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::tempdir;

    async fn seed<T: Serialize>(cache: &CacheStore, resource: ResourceKind, items: Vec<T>) {
        cache
            .write(resource.name(), &CacheContainer::new(Utc::now(), items))
            .await
            .expect("seed cache");
    }

    fn value_items(values: serde_json::Value) -> Vec<serde_json::Value> {
        values.as_array().cloned().unwrap_or_default()
    }

    async fn seed_fixture(cache: &CacheStore) {
        seed(
            cache,
            ResourceKind::Customers,
            value_items(json!([
                {"ID": 10, "CompanyName": "  Acme Corp "},
                {"ID": 20, "CompanyName": "Globex"}
            ])),
        )
        .await;
        seed(
            cache,
            ResourceKind::Sites,
            value_items(json!([
                {
                    "ID": 100,
                    "Name": "Acme HQ",
                    "Address": {"Address": " 1 Main St ", "City": "Perth", "State": "WA", "PostalCode": "6000"},
                    "Customers": [{"ID": 99}, {"ID": 10, "CompanyName": "Acme Corp"}],
                    "Archived": false
                },
                {"ID": 200, "Name": "Orphan", "Customers": [{"ID": 77}], "Archived": true}
            ])),
        )
        .await;
        seed(
            cache,
            ResourceKind::Assets,
            value_items(json!([
                {
                    "ID": 500,
                    "Site": {"ID": 100},
                    "CustomFields": [
                        {"CustomField": {"ID": 1, "Name": "Building Name / Number"}, "Value": ""},
                        {"CustomField": {"ID": 1, "Name": "Building Name / Number"}, "Value": " Tower A "}
                    ]
                },
                {"ID": 501, "Site": {"ID": 100}, "CustomFields": []},
                {"ID": 502, "Site": {"ID": 200}, "CustomFields": [
                    {"CustomField": {"ID": 1, "Name": "Building Name / Number"}, "Value": "Shed"}
                ]}
            ])),
        )
        .await;
        seed(
            cache,
            ResourceKind::Jobs,
            value_items(json!([
                {"ID": 900, "Stage": "Progress", "Customer": {"ID": 10}, "Site": {"ID": 100}},
                {"ID": 901, "Stage": "Mystery", "Customer": {"ID": 10}, "Site": {"ID": 100}},
                {"ID": 902, "Stage": "Pending", "Customer": {"ID": 10}, "Site": {"ID": 999}},
                {"ID": 903, "Stage": "Complete", "Customer": null, "Site": {"ID": 100}}
            ])),
        )
        .await;
    }

    fn users() -> InspectionUsers {
        InspectionUsers {
            admin_user_id: 7,
            unassigned_user_id: 3,
        }
    }

    #[tokio::test]
    async fn dependency_order_resolves_foreign_keys() {
        let dir = tempdir().expect("tempdir");
        let cache = CacheStore::new(dir.path());
        let store = LocalStore::connect_in_memory().await.expect("store");
        seed_fixture(&cache).await;

        let reconciler = Reconciler::new(&cache, &store, users());
        let mut counts = ReconcileCounts::default();
        for kind in EntityKind::ALL {
            counts.record(kind, reconciler.reconcile(kind).await.unwrap());
        }

        assert_eq!(
            counts,
            ReconcileCounts {
                clients: 2,
                sites: 1,
                locations: 1,
                inspections: 2,
            }
        );

        let clients = store.list_clients().await.unwrap();
        assert_eq!(clients[0].client_name, "Acme Corp");
        let acme_id = clients[0].id;

        let sites = store.list_sites().await.unwrap();
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].client_id, acme_id);
        assert_eq!(sites[0].street, "1 Main St");
        assert_eq!(sites[0].post_code, "6000");
        assert!(sites[0].is_active);

        let locations = store.list_locations().await.unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].location_name, "Tower A");
        assert_eq!(locations[0].simpro_id, Some(500));

        let inspections = store.list_inspections().await.unwrap();
        assert_eq!(inspections.len(), 2);
        assert_eq!(inspections[0].simpro_id, Some(900));
        assert_eq!(inspections[0].inspection_status_id, 2);
        assert_eq!(inspections[0].client_id, acme_id);
        assert_eq!(inspections[0].site_id, sites[0].id);
        assert_eq!(inspections[0].user_id, 3);
        assert_eq!(inspections[0].created_user_id, 7);
        assert_eq!(inspections[0].modified_user_id, 7);
        // unknown stage falls back to Unassigned
        assert_eq!(inspections[1].inspection_status_id, 1);
    }

    #[tokio::test]
    async fn inspections_before_parents_are_skipped_then_picked_up() {
        let dir = tempdir().expect("tempdir");
        let cache = CacheStore::new(dir.path());
        let store = LocalStore::connect_in_memory().await.expect("store");
        seed_fixture(&cache).await;

        let reconciler = Reconciler::new(&cache, &store, users());
        assert_eq!(reconciler.reconcile(EntityKind::Inspections).await.unwrap(), 0);
        assert!(store.list_inspections().await.unwrap().is_empty());

        reconciler.reconcile(EntityKind::Clients).await.unwrap();
        reconciler.reconcile(EntityKind::Sites).await.unwrap();
        assert_eq!(reconciler.reconcile(EntityKind::Inspections).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rerun_adds_nothing() {
        let dir = tempdir().expect("tempdir");
        let cache = CacheStore::new(dir.path());
        let store = LocalStore::connect_in_memory().await.expect("store");
        seed_fixture(&cache).await;

        let reconciler = Reconciler::new(&cache, &store, users());
        for kind in EntityKind::ALL {
            reconciler.reconcile(kind).await.unwrap();
        }
        let mut second = ReconcileCounts::default();
        for kind in EntityKind::ALL {
            second.record(kind, reconciler.reconcile(kind).await.unwrap());
        }
        assert_eq!(second.total(), 0);
    }

    #[tokio::test]
    async fn missing_cache_reconciles_nothing() {
        let dir = tempdir().expect("tempdir");
        let cache = CacheStore::new(dir.path());
        let store = LocalStore::connect_in_memory().await.expect("store");
        let reconciler = Reconciler::new(&cache, &store, InspectionUsers::default());
        assert_eq!(reconciler.reconcile(EntityKind::Clients).await.unwrap(), 0);
    }
}
