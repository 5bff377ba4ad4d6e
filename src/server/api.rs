//! The remote read API: `GET /api/json[?pretty=true][&since_id=N]`.
//!
//! The snapshot is rebuilt at most every [`CACHE_TTL`] regardless of
//! request rate; `since_id` filtering happens per request on the cached
//! document. Gzip negotiation is handled by the compression layer.

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

use crate::machine::SharedStore;

/// How long one rendered snapshot serves requests.
const CACHE_TTL: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ApiState {
    store: SharedStore,
    cache: Arc<Mutex<Option<(Instant, serde_json::Value)>>>,
}

impl ApiState {
    pub fn new(store: SharedStore) -> Self {
        ApiState {
            store,
            cache: Arc::new(Mutex::new(None)),
        }
    }

    fn snapshot(&self) -> serde_json::Value {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((at, value)) = cache.as_ref() {
            if at.elapsed() < CACHE_TTL {
                return value.clone();
            }
        }
        let value = {
            let store = match self.store.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            store.snapshot()
        };
        *cache = Some((Instant::now(), value.clone()));
        value
    }
}

#[derive(Debug, Deserialize)]
struct ApiParams {
    #[serde(default)]
    pretty: Option<String>,
    #[serde(default)]
    since_id: Option<u64>,
}

impl ApiParams {
    fn pretty(&self) -> bool {
        matches!(self.pretty.as_deref(), Some("true") | Some("1") | Some(""))
    }
}

async fn api_json(
    State(state): State<ApiState>,
    Query(params): Query<ApiParams>,
) -> impl IntoResponse {
    let mut snapshot = state.snapshot();

    if let Some(since_id) = params.since_id {
        if let Some(logs) = snapshot.get_mut("logs").and_then(|l| l.as_array_mut()) {
            logs.retain(|entry| {
                entry
                    .get("id")
                    .and_then(|id| id.as_u64())
                    .is_some_and(|id| id > since_id)
            });
        }
    }

    let body = if params.pretty() {
        serde_json::to_string_pretty(&snapshot).unwrap_or_else(|_| "{}".to_string())
    } else {
        snapshot.to_string()
    };
    ([(header::CONTENT_TYPE, "application/json")], body)
}

async fn health() -> &'static str {
    "ok\n"
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/json", get(api_json))
        .route("/health", get(health))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the read API until shutdown.
pub async fn run_api_server(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Read API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Stash;
    use crate::store::StateStore;
    use crate::types::ProjectId;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn request(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn state_with_content() -> ApiState {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(dir.path(), "test").unwrap();
        let id = ProjectId::from("p#dev");
        store.project(&id);
        store.record_transition(&id, crate::machine::State::WaitForStaging, Stash::default());
        for i in 0..5 {
            store.push_log("info", Some(&id), format!("log {i}"));
        }
        // The tempdir is dropped here; the store only needs it at open/sync
        // time and the tests never sync.
        ApiState::new(Arc::new(Mutex::new(store)))
    }

    #[tokio::test]
    async fn snapshot_lists_projects_and_logs() {
        let (status, body) = request(router(state_with_content()), "/api/json").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["projects"]["p#dev"]["state"], "wait-for-staging");
        assert_eq!(body["logs"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn since_id_filters_logs() {
        let state = state_with_content();
        let (_, full) = request(router(state.clone()), "/api/json").await;
        let third = full["logs"][2]["id"].as_u64().unwrap();

        let (_, filtered) =
            request(router(state), &format!("/api/json?since_id={third}")).await;
        let logs = filtered["logs"].as_array().unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l["id"].as_u64().unwrap() > third));
        // Projects are unaffected by log filtering.
        assert!(filtered["projects"]["p#dev"].is_object());
    }

    #[tokio::test]
    async fn pretty_output_is_indented() {
        let response = router(state_with_content())
            .oneshot(
                Request::builder()
                    .uri("/api/json?pretty=true")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("\n  "));
    }

    #[tokio::test]
    async fn health_answers() {
        let response = router(state_with_content())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn snapshot_is_cached_across_requests() {
        let state = state_with_content();
        let (_, first) = request(router(state.clone()), "/api/json").await;

        // Mutate the store; the cached snapshot must still be served.
        {
            let mut store = state.store.lock().unwrap();
            let id = ProjectId::from("p#dev");
            store.push_log("info", Some(&id), "after cache".to_string());
        }
        let (_, second) = request(router(state), "/api/json").await;
        assert_eq!(first, second);
    }
}
