//! server.rs
//!
//! HTTP surface of the log index: bulk ingestion, search, on-demand
//! persistence and introspection under the configured prefix, plus the
//! `/metrics` and `/healthz` endpoints at the root.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::HttpBody;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::config::{ServerSettings, SnapshotSettings};
use crate::errors::IndexerError;
use crate::index::LogIndex;
use crate::metrics;
use crate::search::SearchParams;
use crate::snapshot::{open_or_create, persist};

/// Everything a request handler needs.
pub struct AppState {
    pub index: Arc<LogIndex>,
    /// Normalized route prefix, `""` for the root
    pub prefix: String,
    pub snapshot: SnapshotSettings,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(index: Arc<LogIndex>, settings: &ServerSettings) -> Self {
        AppState {
            index,
            prefix: settings.route_prefix(),
            snapshot: settings.snapshot.clone(),
            max_body_bytes: settings.max_body_bytes,
        }
    }
}

/// Application entrypoint for the index server: restore or create the index,
/// serve until Ctrl-C / SIGTERM, then write the snapshot.
pub async fn run(settings: ServerSettings) -> Result<(), IndexerError> {
    run_until(settings, shutdown_signal()).await
}

/// Like [`run`], but stops when `shutdown` resolves.
pub async fn run_until<F>(settings: ServerSettings, shutdown: F) -> Result<(), IndexerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = settings.bind_addr()?;

    let loader = settings.clone();
    let index = Arc::new(tokio::task::spawn_blocking(move || open_or_create(&loader)).await??);
    let state = Arc::new(AppState::new(index.clone(), &settings));

    let (local, server) = bind(state, addr, shutdown)?;
    info!(addr = %local, prefix = %settings.route_prefix(), documents = index.count(), "Log index server listening");

    let served = server.await;

    info!("Shutting down, writing snapshot");
    persist_on_shutdown(index, settings.snapshot.clone()).await;
    served
}

/// Bind the listener and return its address together with the server future.
pub fn bind<F>(
    state: Arc<AppState>,
    addr: SocketAddr,
    shutdown: F,
) -> Result<(SocketAddr, impl Future<Output = Result<(), IndexerError>>), IndexerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| route(req, state.clone())))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    let local = server.local_addr();
    let graceful = server.with_graceful_shutdown(shutdown);

    Ok((local, async move { graceful.await.map_err(IndexerError::from) }))
}

/// Snapshot failures at shutdown are logged and otherwise ignored.
pub async fn persist_on_shutdown(index: Arc<LogIndex>, snapshot: SnapshotSettings) {
    let path = snapshot.path.clone();
    let result =
        tokio::task::spawn_blocking(move || persist(&index, &snapshot.path, snapshot.format)).await;
    match result {
        Ok(Ok(count)) => info!(path = %path.display(), documents = count, "Snapshot saved"),
        Ok(Err(e)) => error!(path = %path.display(), error = %e, "Failed to write snapshot"),
        Err(e) => error!(path = %path.display(), error = %e, "Snapshot task failed"),
    }
}

/// Dispatch one request. Never fails; errors become JSON error responses.
pub async fn route(req: Request<Body>, state: Arc<AppState>) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let result = match (&method, path.as_str()) {
        // ─── METRICS ENDPOINT ────────────────────────────────
        (&Method::GET, "/metrics") => {
            // Prometheus (v3+) rejects scrapes without the exposition content type
            let mime = TextEncoder::new().format_type().to_string();
            let mut resp = Response::new(Body::from(metrics::gather_metrics()));
            if let Ok(value) = HeaderValue::from_str(&mime) {
                resp.headers_mut().insert(CONTENT_TYPE, value);
            }
            Ok(resp)
        }

        // ─── HEALTHCHECK ENDPOINT ───────────────────────────
        (&Method::GET, "/healthz") => Ok(Response::new(Body::from("OK"))),

        // ─── INDEX ROUTES ───────────────────────────────────
        _ => match path.strip_prefix(state.prefix.as_str()) {
            Some("/bulk") if method == Method::POST => bulk(req, &state).await,
            Some("/search") if method == Method::POST => search(req, &state).await,
            Some("/persist") if method == Method::POST => persist_now(&state).await,
            Some("/introspection") if method == Method::GET => Ok(introspection(&state)),
            _ => Ok(status_response(StatusCode::NOT_FOUND)),
        },
    };

    Ok(result.unwrap_or_else(|e| {
        if e.is_client_error() {
            warn!(%method, %path, error = %e, "Rejected request");
        } else {
            error!(%method, %path, error = %e, "Request failed");
        }
        error_response(&e)
    }))
}

async fn bulk(req: Request<Body>, state: &AppState) -> Result<Response<Body>, IndexerError> {
    let body = read_body(req, state.max_body_bytes).await?;
    let records: Vec<Value> = serde_json::from_slice(&body)?;
    let received = records.len();

    let index = state.index.clone();
    let ids = tokio::task::spawn_blocking(move || index.insert_many(records)).await??;

    info!(received, inserted = ids.len(), "Bulk insert");
    Ok(json_response(
        StatusCode::OK,
        &json!({ "success": true, "inserted": ids.len() }),
    ))
}

async fn search(req: Request<Body>, state: &AppState) -> Result<Response<Body>, IndexerError> {
    let body = read_body(req, state.max_body_bytes).await?;
    let params: SearchParams = if body.iter().all(u8::is_ascii_whitespace) {
        SearchParams::default()
    } else {
        serde_json::from_slice(&body)?
    };

    let index = state.index.clone();
    let results = tokio::task::spawn_blocking(move || index.search(&params)).await??;
    Ok(json_response(StatusCode::OK, &results))
}

async fn persist_now(state: &AppState) -> Result<Response<Body>, IndexerError> {
    let index = state.index.clone();
    let snapshot = state.snapshot.clone();
    let count =
        tokio::task::spawn_blocking(move || persist(&index, &snapshot.path, snapshot.format)).await??;
    Ok(json_response(
        StatusCode::OK,
        &json!({ "success": true, "documents": count }),
    ))
}

fn introspection(state: &AppState) -> Response<Body> {
    json_response(
        StatusCode::OK,
        &json!({ "schema": state.index.schema(), "documents": state.index.count() }),
    )
}

/// Buffer a request body, refusing anything past `limit` bytes.
async fn read_body(req: Request<Body>, limit: usize) -> Result<Vec<u8>, IndexerError> {
    let mut body = req.into_body();
    if body.size_hint().lower() > limit as u64 {
        return Err(IndexerError::BodyTooLarge(limit));
    }

    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| IndexerError::InvalidDocument(format!("unreadable body: {e}")))?;
        if buf.len() + chunk.len() > limit {
            return Err(IndexerError::BodyTooLarge(limit));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut resp = Response::new(Body::from(bytes));
            *resp.status_mut() = status;
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            resp
        }
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn error_response(err: &IndexerError) -> Response<Body> {
    let status = match err {
        IndexerError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_response(status, &json!({ "error": err.to_string() }))
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = status;
    resp
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::IndexSchema;
    use crate::snapshot::{restore, SnapshotFormat};
    use tempfile::TempDir;

    fn state(prefix: &str, dir: &TempDir) -> Arc<AppState> {
        state_with(prefix, dir, ServerSettings::default())
    }

    fn state_with(prefix: &str, dir: &TempDir, mut settings: ServerSettings) -> Arc<AppState> {
        settings.prefix = prefix.into();
        settings.snapshot.path = dir.path().join("logs.snapshot");
        settings.snapshot.format = SnapshotFormat::Binary;
        let index = LogIndex::create(IndexSchema::default(), 20_000_000).unwrap();
        Arc::new(AppState::new(Arc::new(index), &settings))
    }

    fn request(method: Method, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn call(state: &Arc<AppState>, req: Request<Body>) -> (StatusCode, Value) {
        let resp = route(req, state.clone()).await.unwrap();
        let status = resp.status();
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
        };
        (status, body)
    }

    fn records() -> Value {
        json!([
            { "level": 30, "time": 1, "msg": "listening on 3000", "pid": 1, "hostname": "api" },
            { "level": 50, "time": 2, "msg": "database unreachable", "pid": 1, "hostname": "api" }
        ])
    }

    #[tokio::test]
    async fn bulk_then_search() {
        let dir = TempDir::new().unwrap();
        let state = state("/", &dir);

        let (status, body) = call(&state, request(Method::POST, "/bulk", records())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["inserted"], 2);

        let (status, body) = call(
            &state,
            request(Method::POST, "/search", json!({ "term": "database" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["hits"][0]["document"]["level"], 50);
    }

    #[tokio::test]
    async fn empty_search_body_lists_everything() {
        let dir = TempDir::new().unwrap();
        let state = state("/", &dir);
        call(&state, request(Method::POST, "/bulk", records())).await;

        let req = Request::builder()
            .method(Method::POST)
            .uri("/search")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2);
    }

    #[tokio::test]
    async fn routes_live_under_the_prefix() {
        let dir = TempDir::new().unwrap();
        let state = state("/logs/", &dir);

        let (status, _) = call(&state, request(Method::POST, "/bulk", records())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&state, request(Method::POST, "/logs/bulk", records())).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&state, request(Method::GET, "/logs/introspection", Value::Null)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["documents"], 2);
        assert_eq!(body["schema"]["hostname"], "string");

        let (status, _) = call(&state, request(Method::GET, "/healthz", Value::Null)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_input_is_a_bad_request() {
        let dir = TempDir::new().unwrap();
        let state = state("/", &dir);

        let (status, body) = call(&state, request(Method::POST, "/bulk", json!([{ "level": "info" }]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("level"));

        let (status, _) = call(&state, request(Method::POST, "/bulk", json!({ "not": "an array" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &state,
            request(Method::POST, "/search", json!({ "where": { "missing": true } })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&state, request(Method::GET, "/bulk", Value::Null)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn oversized_body_is_refused() {
        let dir = TempDir::new().unwrap();
        let settings = ServerSettings {
            max_body_bytes: 64,
            ..ServerSettings::default()
        };
        let state = state_with("/", &dir, settings);

        let (status, body) = call(&state, request(Method::POST, "/bulk", records())).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(body["error"].as_str().unwrap().contains("64 bytes"));
        assert_eq!(state.index.count(), 0);

        // Streamed bodies carry no length up front and are cut off while reading
        let (mut sender, streamed) = Body::channel();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/search")
            .body(streamed)
            .unwrap();
        tokio::spawn(async move {
            for _ in 0..4 {
                if sender.send_data(hyper::body::Bytes::from(vec![b' '; 32])).await.is_err() {
                    break;
                }
            }
        });
        let (status, _) = call(&state, req).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

        let (status, body) = call(&state, request(Method::POST, "/search", json!({ "limit": 1 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 0);
    }

    #[tokio::test]
    async fn persist_writes_the_configured_snapshot() {
        let dir = TempDir::new().unwrap();
        let state = state("/", &dir);
        call(&state, request(Method::POST, "/bulk", records())).await;

        let (status, body) = call(&state, request(Method::POST, "/persist", Value::Null)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["documents"], 2);

        let snapshot = restore(&state.snapshot.path, SnapshotFormat::Binary)
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.documents.len(), 2);
    }

    #[tokio::test]
    async fn metrics_are_exposed() {
        let dir = TempDir::new().unwrap();
        let state = state("/", &dir);
        call(&state, request(Method::POST, "/search", json!({}))).await;

        let resp = route(request(Method::GET, "/metrics", Value::Null), state).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert!(String::from_utf8_lossy(&text).contains("searches_total"));
    }
}
