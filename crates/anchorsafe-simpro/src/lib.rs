//! SimPro REST client: resource registry, authenticated requests and page aggregation.

mod registry;

pub use registry::{ResourceDescriptor, ResourceRegistry, MAX_PAGE_SIZE};

use std::sync::Arc;

use anchorsafe_core::{dedup_by_identity, HasIdentity};
use anchorsafe_storage::{FetchError, FetchedResponse, HttpFetcher};
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, IF_MODIFIED_SINCE};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "anchorsafe-simpro";

/// Response header carrying the total number of pages for a list request.
pub const RESULT_PAGES_HEADER: &str = "Result-Pages";

#[derive(Debug, Error)]
pub enum SimProError {
    #[error("invalid SimPro url `{url}`: {message}")]
    Url { url: String, message: String },
    #[error("building SimPro request: {0}")]
    Build(#[from] reqwest::Error),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SimProSettings {
    /// Host, optionally with a scheme. `https://` is assumed otherwise.
    pub base_url: String,
    pub version: String,
    pub key: String,
    pub company_id: i64,
    pub page_size: u32,
    pub page_concurrency: usize,
}

impl Default for SimProSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            version: "api/v1.0".to_string(),
            key: String::new(),
            company_id: 0,
            page_size: MAX_PAGE_SIZE,
            page_concurrency: 4,
        }
    }
}

impl SimProSettings {
    /// `{scheme}://{host}/{version}/`
    pub fn api_root(&self) -> Result<Url, SimProError> {
        let host = self.base_url.trim().trim_end_matches('/');
        let host = if host.contains("://") {
            host.to_string()
        } else {
            format!("https://{host}")
        };
        let version = self.version.trim().trim_matches('/');
        let raw = if version.is_empty() {
            format!("{host}/")
        } else {
            format!("{host}/{version}/")
        };
        Url::parse(&raw).map_err(|err| SimProError::Url {
            url: raw.clone(),
            message: err.to_string(),
        })
    }
}

/// Parse a caller-supplied "since" value; anything unparsable means no filter.
pub fn parse_since(raw: &str) -> Option<DateTime<Utc>> {
    if raw.trim().is_empty() {
        return None;
    }
    anchorsafe_core::timestamp::parse(raw)
}

fn http_date(value: DateTime<Utc>) -> String {
    value.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[derive(Debug, Clone)]
pub struct SimProClient {
    settings: SimProSettings,
    registry: ResourceRegistry,
    http: Arc<HttpFetcher>,
}

impl SimProClient {
    pub fn new(settings: SimProSettings, http: Arc<HttpFetcher>) -> Self {
        let registry = ResourceRegistry::new(settings.company_id);
        Self {
            settings,
            registry,
            http,
        }
    }

    pub fn settings(&self) -> &SimProSettings {
        &self.settings
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn url(&self, path: &str, query: &[(String, String)]) -> Result<Url, SimProError> {
        let root = self.settings.api_root()?;
        let mut url = root.join(path.trim_start_matches('/')).map_err(|err| SimProError::Url {
            url: format!("{root}{path}"),
            message: err.to_string(),
        })?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// One authenticated call. POST when a payload is given, GET otherwise.
    pub async fn request(
        &self,
        path: &str,
        payload: Option<&JsonValue>,
        query: &[(String, String)],
        since: Option<DateTime<Utc>>,
    ) -> Result<FetchedResponse, SimProError> {
        let url = self.url(path, query)?;
        let method = if payload.is_some() {
            Method::POST
        } else {
            Method::GET
        };

        let mut builder = self
            .http
            .client()
            .request(method, url)
            .bearer_auth(&self.settings.key)
            .header(ACCEPT, "application/json");
        if let Some(since) = since {
            builder = builder.header(IF_MODIFIED_SINCE, http_date(since));
        }
        if let Some(payload) = payload {
            builder = builder.json(payload);
        }

        let request = builder.build()?;
        Ok(self.http.execute(request).await?)
    }

    /// Reachability probe against `info/`.
    pub async fn test(&self) -> bool {
        match self.request("info/", None, &[], None).await {
            Ok(_) => true,
            Err(err) => {
                info!(error = %err, "SimPro reachability check failed");
                false
            }
        }
    }

    /// Fetch `start_page` and, when `fetch_all` is set, every later page the
    /// server reports. Pages after the first are fetched concurrently but
    /// assembled in ascending page order. Any failed page fails the whole call.
    pub async fn request_data<T>(
        &self,
        endpoint: &str,
        payload: Option<&JsonValue>,
        query: &[(String, String)],
        start_page: u32,
        fetch_all: bool,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<T>, SimProError>
    where
        T: DeserializeOwned + HasIdentity,
    {
        let start_page = start_page.max(1);
        let (mut items, total_pages) = self
            .fetch_page::<T>(endpoint, payload, query, start_page, since)
            .await?;
        debug!(endpoint, page = start_page, pages = total_pages, items = items.len(), "fetched page");

        if fetch_all && total_pages > start_page {
            // page futures own their inputs so the combined future stays spawnable
            let endpoint = endpoint.to_string();
            let payload = payload.cloned();
            let query = query.to_vec();
            let rest: Vec<Vec<T>> = stream::iter(start_page + 1..=total_pages)
                .map(|page| {
                    let client = self.clone();
                    let endpoint = endpoint.clone();
                    let payload = payload.clone();
                    let query = query.clone();
                    async move {
                        client
                            .fetch_page::<T>(&endpoint, payload.as_ref(), &query, page, since)
                            .await
                            .map(|(page_items, _)| page_items)
                    }
                })
                .buffered(self.settings.page_concurrency.max(1))
                .try_collect()
                .await?;
            items.extend(rest.into_iter().flatten());
        }

        Ok(dedup_by_identity(items))
    }

    async fn fetch_page<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        payload: Option<&JsonValue>,
        query: &[(String, String)],
        page: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<(Vec<T>, u32), SimProError> {
        let mut page_query = query.to_vec();
        if page > 1 {
            page_query.push(("page".to_string(), page.to_string()));
        }

        let response = self.request(endpoint, payload, &page_query, since).await?;
        let total_pages = response
            .header_str(RESULT_PAGES_HEADER)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(1);

        if response.status == StatusCode::NOT_MODIFIED
            || response.body.iter().all(u8::is_ascii_whitespace)
        {
            return Ok((Vec::new(), total_pages));
        }

        // a `null` list means no data
        let items: Option<Vec<T>> =
            serde_json::from_slice(&response.body).map_err(|source| SimProError::Decode {
                url: response.final_url.clone(),
                source,
            })?;
        Ok((items.unwrap_or_default(), total_pages))
    }
}
