//! Axum HTTP surface for the SimPro sync (`/SimPro/*`).

use std::sync::Arc;

use anchorsafe_core::{EntityKind, ResourceKind};
use anchorsafe_sync::{format_process_time, RefreshOutcome, SyncConfig, SyncJobRegistry, SyncPipeline};
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "anchorsafe-web";

pub const MISSING_TOKEN: &str = "Bad request - missing token.";
pub const INCORRECT_TOKEN: &str = "Still a bad request - incorrect token.";
pub const TOKEN_NOT_CONFIGURED: &str = "Bad configuration - cron token not configured.";
pub const NO_DATA: &str = "Couldn't get data.";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    pub jobs: SyncJobRegistry,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self {
            pipeline,
            jobs: SyncJobRegistry::new(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct SimProQuery {
    #[serde(default)]
    param: String,
    get: Option<String>,
    uid: Option<i64>,
}

impl SimProQuery {
    fn selector(&self) -> &str {
        self.get.as_deref().unwrap_or("all")
    }

    /// Negative ids mean "no user".
    fn user_id(&self) -> Option<i64> {
        self.uid.filter(|uid| *uid >= 0)
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/SimPro/Hello", get(hello_handler))
        .route("/SimPro/Test", get(test_handler))
        .route("/SimPro/LastDataRefresh", get(last_data_refresh_handler))
        .route("/SimPro/DataRefresh", get(data_refresh_handler))
        .route("/SimPro/GetRemote", get(get_remote_handler))
        .route("/SimPro/GetFullRemote", get(get_full_remote_handler))
        .route("/SimPro/GetCached", get(get_cached_handler))
        .route("/SimPro/Sync", post(start_sync_handler))
        .route("/SimPro/Sync/{id}", get(sync_status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("ANCHORSAFE_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let pipeline = Arc::new(SyncPipeline::connect(SyncConfig::from_env()).await?);
    let scheduler = pipeline.maybe_build_scheduler().await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await?;
        info!(cron = %pipeline.config().sync_cron, "refresh scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "result": message.into() })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "result": format!("{err:#}") })),
    )
        .into_response()
}

fn check_token(state: &AppState, param: &str) -> Result<(), Response> {
    if state.pipeline.config().cron_token.is_none() {
        return Err(bad_request(TOKEN_NOT_CONFIGURED));
    }
    if param.is_empty() {
        return Err(bad_request(MISSING_TOKEN));
    }
    if !state.pipeline.token_matches(param) {
        return Err(bad_request(INCORRECT_TOKEN));
    }
    Ok(())
}

fn entity_selection(get: &str) -> Result<Vec<EntityKind>, Response> {
    EntityKind::select(get).ok_or_else(|| bad_request(format!("Unknown data selection `{get}`.")))
}

fn resource_selection(get: &str) -> Result<Vec<ResourceKind>, Response> {
    ResourceKind::select(get).ok_or_else(|| bad_request(format!("Unknown data selection `{get}`.")))
}

async fn hello_handler() -> Response {
    Json("Hi SimPro").into_response()
}

async fn test_handler(State(state): State<Arc<AppState>>) -> Response {
    let status = if state.pipeline.test_remote().await {
        "SimPro is OK"
    } else {
        "SimPro is unavailable"
    };
    Json(json!({ "Status": status })).into_response()
}

async fn last_data_refresh_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SimProQuery>,
) -> Response {
    if let Err(resp) = check_token(&state, &query.param) {
        return resp;
    }
    match state.pipeline.last_data_refresh().await {
        Ok(stamps) => {
            let body: serde_json::Map<String, serde_json::Value> = stamps
                .into_iter()
                .map(|(label, stamp)| (label.to_string(), json!(stamp.to_rfc3339())))
                .collect();
            info!(refreshed = ?body, "LastDataRefresh");
            Json(body).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn data_refresh_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SimProQuery>,
) -> Response {
    if let Err(resp) = check_token(&state, &query.param) {
        return resp;
    }
    let entities = match entity_selection(query.selector()) {
        Ok(entities) => entities,
        Err(resp) => return resp,
    };

    match state.pipeline.data_refresh(&entities, query.user_id()).await {
        Ok(RefreshOutcome::Refreshed { elapsed, .. }) => Json(json!({
            "Success": true,
            "ProcessTime": format_process_time(elapsed),
        }))
        .into_response(),
        Ok(RefreshOutcome::NoData { .. }) => bad_request(NO_DATA),
        Err(err) => server_error(err),
    }
}

async fn fetch_remote(state: &AppState, query: &SimProQuery, incremental: bool) -> Response {
    if let Err(resp) = check_token(state, &query.param) {
        return resp;
    }
    let kinds = match resource_selection(query.selector()) {
        Ok(kinds) => kinds,
        Err(resp) => return resp,
    };
    match state.pipeline.fetch_remote(&kinds, incremental).await {
        Ok(success) => Json(json!({ "Success": success })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn get_remote_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SimProQuery>,
) -> Response {
    fetch_remote(&state, &query, true).await
}

async fn get_full_remote_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SimProQuery>,
) -> Response {
    fetch_remote(&state, &query, false).await
}

async fn get_cached_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SimProQuery>,
) -> Response {
    if let Err(resp) = check_token(&state, &query.param) {
        return resp;
    }
    let kind = match resource_selection(query.selector()) {
        Ok(kinds) if kinds.len() == 1 => kinds[0],
        Ok(_) => return bad_request("GetCached needs a single resource."),
        Err(resp) => return resp,
    };
    match state.pipeline.cached_raw(kind).await {
        Ok(Some(raw)) => ([(header::CONTENT_TYPE, "application/json")], raw).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "result": format!("No cached data for {kind}.") })),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn start_sync_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SimProQuery>,
) -> Response {
    if let Err(resp) = check_token(&state, &query.param) {
        return resp;
    }
    let entities = match entity_selection(query.selector()) {
        Ok(entities) => entities,
        Err(resp) => return resp,
    };
    let task_id = state.jobs.start(state.pipeline.clone(), entities).await;
    (StatusCode::ACCEPTED, Json(json!({ "TaskId": task_id }))).into_response()
}

async fn sync_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Query(query): Query<SimProQuery>,
) -> Response {
    if let Err(resp) = check_token(&state, &query.param) {
        return resp;
    }
    match state.jobs.get(id).await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "result": format!("No sync job {id}.") })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchorsafe_simpro::SimProSettings;
    use anchorsafe_sync::LocalStore;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;
    use tower::ServiceExt;
    use wiremock::matchers::{any, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOKEN: &str = "cron-secret";

    async fn state_for(server: &MockServer, cache_dir: &Path) -> AppState {
        let config = SyncConfig {
            cache_dir: cache_dir.to_path_buf(),
            simpro: SimProSettings {
                base_url: server.uri(),
                version: "v1.0".to_string(),
                key: "k".to_string(),
                ..SimProSettings::default()
            },
            cron_token: Some(TOKEN.to_string()),
            max_retries: 0,
            ..SyncConfig::default()
        };
        let store = LocalStore::connect_in_memory().await.expect("store");
        AppState::new(Arc::new(SyncPipeline::new(config, store).expect("pipeline")))
    }

    async fn mount_customers(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/v1.0/companies/0/customers/companies/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"ID": 10, "CompanyName": "Acme"},
                {"ID": 20, "CompanyName": "Globex"},
                {"ID": 30, "CompanyName": "Initech"}
            ])))
            .mount(server)
            .await;
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn hello_answers() {
        let server = MockServer::start().await;
        let dir = tempdir().expect("tempdir");
        let app = app(state_for(&server, dir.path()).await);
        let (status, body) = send(app, "GET", "/SimPro/Hello").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!("Hi SimPro"));
    }

    #[tokio::test]
    async fn bad_tokens_are_rejected_before_any_remote_call() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let dir = tempdir().expect("tempdir");
        let state = state_for(&server, dir.path()).await;

        let (status, body) = send(app(state.clone()), "GET", "/SimPro/DataRefresh?param=wrong").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["result"], INCORRECT_TOKEN);

        let (status, body) = send(app(state.clone()), "GET", "/SimPro/DataRefresh").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["result"], MISSING_TOKEN);

        let (status, _) = send(app(state), "GET", "/SimPro/GetRemote?param=wrong&get=all").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unconfigured_token_is_reported_as_configuration_error() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let dir = tempdir().expect("tempdir");
        let mut config = state_for(&server, dir.path()).await.pipeline.config().clone();
        config.cron_token = None;
        let store = LocalStore::connect_in_memory().await.expect("store");
        let state = AppState::new(Arc::new(SyncPipeline::new(config, store).expect("pipeline")));

        let (status, body) = send(app(state), "GET", "/SimPro/DataRefresh?param=anything").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["result"], TOKEN_NOT_CONFIGURED);
    }

    #[tokio::test]
    async fn data_refresh_syncs_clients() {
        let server = MockServer::start().await;
        mount_customers(&server).await;
        let dir = tempdir().expect("tempdir");
        let state = state_for(&server, dir.path()).await;

        let (status, body) = send(
            app(state.clone()),
            "GET",
            &format!("/SimPro/DataRefresh?param={TOKEN}&get=clients&uid=4"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["Success"], true);
        assert!(body["ProcessTime"].as_str().unwrap().contains(':'));

        let clients = state.pipeline.store().list_clients().await.unwrap();
        assert_eq!(clients.len(), 3);
        assert!(dir.path().join("customers_data.json").exists());
    }

    #[tokio::test]
    async fn data_refresh_without_data_is_a_bad_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        let dir = tempdir().expect("tempdir");
        let state = state_for(&server, dir.path()).await;

        let (status, body) =
            send(app(state), "GET", &format!("/SimPro/DataRefresh?param={TOKEN}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["result"], NO_DATA);
    }

    #[tokio::test]
    async fn unknown_selector_is_a_bad_request() {
        let server = MockServer::start().await;
        let dir = tempdir().expect("tempdir");
        let state = state_for(&server, dir.path()).await;
        let (status, _) = send(
            app(state),
            "GET",
            &format!("/SimPro/DataRefresh?param={TOKEN}&get=widgets"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn remote_failure_is_a_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let dir = tempdir().expect("tempdir");
        let state = state_for(&server, dir.path()).await;
        let (status, body) = send(
            app(state),
            "GET",
            &format!("/SimPro/DataRefresh?param={TOKEN}&get=clients"),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["result"].as_str().unwrap().contains("403"));
    }

    #[tokio::test]
    async fn remote_fetch_then_cached_and_last_refresh() {
        let server = MockServer::start().await;
        mount_customers(&server).await;
        let dir = tempdir().expect("tempdir");
        let state = state_for(&server, dir.path()).await;

        let (status, body) = send(
            app(state.clone()),
            "GET",
            &format!("/SimPro/GetFullRemote?param={TOKEN}&get=customers"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["Success"], true);

        let (status, body) = send(
            app(state.clone()),
            "GET",
            &format!("/SimPro/GetCached?param={TOKEN}&get=customers"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["Items"].as_array().unwrap().len(), 3);

        let (status, _) = send(
            app(state.clone()),
            "GET",
            &format!("/SimPro/GetCached?param={TOKEN}&get=jobs"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            app(state),
            "GET",
            &format!("/SimPro/LastDataRefresh?param={TOKEN}"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["Clients"].is_string());
        assert!(body.get("Jobs").is_none());
    }

    #[tokio::test]
    async fn test_endpoint_reports_remote_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/info/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
        let dir = tempdir().expect("tempdir");
        let (status, body) = send(app(state_for(&server, dir.path()).await), "GET", "/SimPro/Test").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["Status"], "SimPro is OK");
    }

    #[tokio::test]
    async fn background_sync_can_be_polled() {
        let server = MockServer::start().await;
        mount_customers(&server).await;
        let dir = tempdir().expect("tempdir");
        let state = state_for(&server, dir.path()).await;

        let (status, body) = send(
            app(state.clone()),
            "POST",
            &format!("/SimPro/Sync?param={TOKEN}&get=clients"),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let task_id = body["TaskId"].as_str().unwrap().to_string();

        let mut last = serde_json::Value::Null;
        for _ in 0..200 {
            let (status, body) = send(
                app(state.clone()),
                "GET",
                &format!("/SimPro/Sync/{task_id}?param={TOKEN}"),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            last = body;
            if last["State"] == "Complete" || last["State"] == "Failed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(last["State"], "Complete");
        assert_eq!(last["TaskId"], task_id.as_str());

        let (status, _) = send(
            app(state),
            "GET",
            &format!("/SimPro/Sync/{}?param={TOKEN}", Uuid::new_v4()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
