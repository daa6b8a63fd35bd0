//! JSON resource cache + HTTP transport utilities for AnchorSafe.

mod http;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anchorsafe_core::{dedup_by_identity, CacheContainer, CacheStamp, HasIdentity};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "anchorsafe-storage";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed cache file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding cache for {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One `{name}_data.json` document per resource under a single directory.
///
/// Writers take [`CacheStore::lock`] for the whole read/merge/write cycle of a
/// resource; the individual methods do not lock on their own.
#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}_data.json"))
    }

    /// Single-writer guard for one resource's cache file.
    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.locks.lock().await;
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    /// Raw file contents, `None` when the file is missing or blank.
    pub async fn read_raw(&self, name: &str) -> Result<Option<String>, CacheError> {
        let path = self.cache_path(name);
        match fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => Ok(None),
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(&path)(err)),
        }
    }

    pub async fn read<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Option<CacheContainer<T>>, CacheError> {
        let Some(text) = self.read_raw(name).await? else {
            return Ok(None);
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| CacheError::Malformed {
                path: self.cache_path(name),
                source,
            })
    }

    /// The stored `LastUpdated` stamp, if a cache file exists.
    pub async fn last_updated(&self, name: &str) -> Result<Option<DateTime<Utc>>, CacheError> {
        let Some(text) = self.read_raw(name).await? else {
            return Ok(None);
        };
        let stamp: CacheStamp =
            serde_json::from_str(&text).map_err(|source| CacheError::Malformed {
                path: self.cache_path(name),
                source,
            })?;
        Ok(Some(stamp.last_updated))
    }

    /// Like [`CacheStore::last_updated`] but falls back to the current time.
    pub async fn last_cache_update(&self, name: &str) -> Result<DateTime<Utc>, CacheError> {
        Ok(self.last_updated(name).await?.unwrap_or_else(Utc::now))
    }

    /// Union of freshly fetched items with the cached ones. New items come
    /// first, so they win any identity clash.
    pub async fn merge<T>(&self, name: &str, new_items: Vec<T>) -> Result<Vec<T>, CacheError>
    where
        T: DeserializeOwned + HasIdentity,
    {
        let mut merged = new_items;
        if let Some(existing) = self.read::<T>(name).await? {
            merged.extend(existing.items);
        }
        Ok(dedup_by_identity(merged))
    }

    /// Replace the cache file via temp file + rename.
    pub async fn write<T: Serialize>(
        &self,
        name: &str,
        container: &CacheContainer<T>,
    ) -> Result<PathBuf, CacheError> {
        let bytes = serde_json::to_vec(container).map_err(|source| CacheError::Encode {
            name: name.to_string(),
            source,
        })?;

        fs::create_dir_all(&self.root)
            .await
            .map_err(io_error(&self.root))?;

        let target = self.cache_path(name);
        let temp_path = self.root.join(format!(".{name}.{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_error(&temp_path))?;
        file.write_all(&bytes).await.map_err(io_error(&temp_path))?;
        file.flush().await.map_err(io_error(&temp_path))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_error(&target)(err));
        }

        debug!(resource = name, bytes = bytes.len(), path = %target.display(), "cache written");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchorsafe_core::SimpleCustomer;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn customer(id: i64, name: &str) -> SimpleCustomer {
        SimpleCustomer {
            id,
            company_name: Some(name.to_string()),
        }
    }

    fn stamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().expect("ts")
    }

    #[tokio::test]
    async fn missing_and_blank_files_read_as_absent() {
        let dir = tempdir().expect("tempdir");
        let store = CacheStore::new(dir.path());

        assert!(store.read::<SimpleCustomer>("customers").await.unwrap().is_none());
        std::fs::write(store.cache_path("customers"), "  \n").unwrap();
        assert!(store.read::<SimpleCustomer>("customers").await.unwrap().is_none());
        assert!(store.last_updated("customers").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_cache_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let store = CacheStore::new(dir.path());
        std::fs::write(store.cache_path("customers"), "{\"LastUpdated\": 12").unwrap();

        let err = store.read::<SimpleCustomer>("customers").await.unwrap_err();
        assert!(matches!(err, CacheError::Malformed { .. }));
        assert!(store.merge("customers", vec![customer(1, "x")]).await.is_err());
    }

    #[tokio::test]
    async fn write_round_trips_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = CacheStore::new(dir.path().join("nested"));
        let container = CacheContainer::new(stamp(), vec![customer(10, "Acme")]);

        let path = store.write("customers", &container).await.expect("write");
        assert_eq!(path.file_name().unwrap(), "customers_data.json");

        let back = store.read::<SimpleCustomer>("customers").await.unwrap().unwrap();
        assert_eq!(back, container);
        assert_eq!(store.last_updated("customers").await.unwrap(), Some(stamp()));

        let entries: Vec<_> = std::fs::read_dir(store.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec!["customers_data.json".to_string()]);
    }

    #[tokio::test]
    async fn merge_prefers_new_items_over_cached() {
        let dir = tempdir().expect("tempdir");
        let store = CacheStore::new(dir.path());
        store
            .write("customers", &CacheContainer::new(stamp(), vec![customer(10, "Acme")]))
            .await
            .unwrap();

        let fresh = vec![customer(10, "Acme Corp"), customer(40, "Globex")];
        let merged = store.merge("customers", fresh.clone()).await.unwrap();
        assert_eq!(merged, fresh);

        // merging the same fetch again changes nothing
        store
            .write("customers", &CacheContainer::new(stamp(), merged.clone()))
            .await
            .unwrap();
        let again = store.merge("customers", fresh).await.unwrap();
        assert_eq!(again, merged);
    }

    #[tokio::test]
    async fn merge_without_cache_returns_new_items() {
        let dir = tempdir().expect("tempdir");
        let store = CacheStore::new(dir.path());
        let merged = store
            .merge("customers", vec![customer(1, "a"), customer(2, "b")])
            .await
            .unwrap();
        assert_eq!(merged.len(), 2);
    }

    #[tokio::test]
    async fn last_cache_update_defaults_to_now() {
        let dir = tempdir().expect("tempdir");
        let store = CacheStore::new(dir.path());
        let before = Utc::now();
        let value = store.last_cache_update("jobs").await.unwrap();
        assert!(value >= before);
    }

    #[tokio::test]
    async fn lock_serializes_writers_per_resource() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(CacheStore::new(dir.path()));

        let guard = store.lock("customers").await;
        let other = store.clone();
        let blocked = tokio::spawn(async move {
            let _g = other.lock("customers").await;
        });
        // a different resource is independent
        let _sites = store.lock("sites").await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());
        drop(guard);
        blocked.await.unwrap();
    }
}
