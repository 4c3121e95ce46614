//! HTTP server for a finished DOAT results directory.
//!
//! Read-only: serves the summary page, `results.json` and the raw CSV
//! artifacts the run left behind. Nothing is computed per request.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path as UrlPath, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Json, Response},
    routing::get,
};
use serde::Serialize;

use doat_core::report::{INDEX_FILE, RESULTS_FILE};

/// Shared server state.
struct AppState {
    dir: PathBuf,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    results_available: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn not_found(what: impl Into<String>) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse { error: what.into() }),
    )
        .into_response()
}

/// A bare `*.csv` file name: no directories, no hidden files.
fn is_artifact_name(name: &str) -> bool {
    !name.starts_with('.')
        && name.ends_with(".csv")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

async fn read_file(path: &Path) -> Option<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            log::debug!("cannot read {}: {e}", path.display());
            None
        }
    }
}

async fn handle_index(State(state): State<Arc<AppState>>) -> Response {
    match read_file(&state.dir.join(INDEX_FILE)).await {
        Some(bytes) => Html(String::from_utf8_lossy(&bytes).into_owned()).into_response(),
        None => not_found("no finished run in this directory"),
    }
}

async fn handle_results(State(state): State<Arc<AppState>>) -> Response {
    match read_file(&state.dir.join(RESULTS_FILE)).await {
        Some(bytes) => ([(header::CONTENT_TYPE, "application/json")], bytes).into_response(),
        None => not_found(format!("{RESULTS_FILE} not found")),
    }
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let results_available = tokio::fs::try_exists(state.dir.join(RESULTS_FILE))
        .await
        .unwrap_or(false);
    Json(HealthResponse {
        status: "ok",
        version: doat_core::VERSION,
        results_available,
    })
}

async fn handle_artifact(
    State(state): State<Arc<AppState>>,
    UrlPath(name): UrlPath<String>,
) -> Response {
    if !is_artifact_name(&name) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("invalid artifact name: {name}"),
            }),
        )
            .into_response();
    }
    match read_file(&state.dir.join(&name)).await {
        Some(bytes) => ([(header::CONTENT_TYPE, "text/csv")], bytes).into_response(),
        None => not_found(format!("artifact {name} not found")),
    }
}

/// Build the axum router over `dir`.
pub fn build_router(dir: impl Into<PathBuf>) -> Router {
    let state = Arc::new(AppState { dir: dir.into() });

    Router::new()
        .route("/", get(handle_index))
        .route("/api/results", get(handle_results))
        .route("/api/health", get(handle_health))
        .route("/artifacts/{name}", get(handle_artifact))
        .with_state(state)
}

/// Serve `dir` until the process is stopped.
pub async fn run_server(dir: PathBuf, host: &str, port: u16) -> std::io::Result<()> {
    let app = build_router(dir);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("serving results on http://{addr}");
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_path(dir: &Path, uri: &str) -> (StatusCode, String) {
        let response = build_router(dir)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_artifact_names() {
        assert!(is_artifact_name("pcm.csv"));
        assert!(is_artifact_name("wallpower_op.csv"));
        assert!(!is_artifact_name("../doat.toml"));
        assert!(!is_artifact_name("..csv"));
        assert!(!is_artifact_name("results.json"));
        assert!(!is_artifact_name("sub%2Fpcm.csv"));
    }

    #[tokio::test]
    async fn test_health_without_results() {
        let tmp = tempfile::tempdir().unwrap();
        let (status, body) = get_path(tmp.path(), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["results_available"], false);
    }

    #[tokio::test]
    async fn test_serves_results_and_index() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(RESULTS_FILE), r#"{"meta":{}}"#).unwrap();
        std::fs::write(tmp.path().join(INDEX_FILE), "<h1>DOAT report</h1>").unwrap();

        let (status, body) = get_path(tmp.path(), "/api/results").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"meta":{}}"#);

        let (status, body) = get_path(tmp.path(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("DOAT report"));
    }

    #[tokio::test]
    async fn test_missing_index_is_404() {
        let tmp = tempfile::tempdir().unwrap();
        let (status, _) = get_path(tmp.path(), "/").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_artifacts_are_restricted_to_csv_names() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("pcm.csv"), "System;Socket 0\n").unwrap();
        std::fs::write(tmp.path().join("secret.txt"), "no").unwrap();

        let (status, body) = get_path(tmp.path(), "/artifacts/pcm.csv").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with("System"));

        let (status, _) = get_path(tmp.path(), "/artifacts/secret.txt").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get_path(tmp.path(), "/artifacts/telemetry.csv").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
