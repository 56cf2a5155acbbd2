//! Request handlers.
//!
//! Batch endpoints are synchronous and long-running: the response is written
//! once orchestration finishes. Observers follow progress independently via
//! the per-session log endpoints, so a slow batch does not leave callers
//! blind.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use gauntlet_core::broadcast::Subscription;
use gauntlet_core::config::{list_input_files, GauntletConfig};
use gauntlet_core::orchestrator::Orchestrator;
use gauntlet_core::runner::{TestResult, TestTask};

use crate::AppState;

/// Idle window after which a synthetic keepalive record is pushed so
/// intermediaries do not drop a quiet stream.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Config and input discovery
// ---------------------------------------------------------------------------

pub(crate) async fn get_config(State(state): State<Arc<AppState>>) -> Json<GauntletConfig> {
    Json(state.config.clone())
}

#[derive(Debug, Deserialize)]
pub(crate) struct InputFilesRequest {
    inputs_path: PathBuf,
}

pub(crate) async fn input_files(
    Json(req): Json<InputFilesRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    match list_input_files(&req.inputs_path) {
        Ok(files) => Ok(Json(json!({ "files": files }))),
        Err(e) => Err((StatusCode::BAD_REQUEST, e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Test execution
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct RunTestRequest {
    repo_path: PathBuf,
    input_file: String,
    inputs_path: PathBuf,
    output_path: PathBuf,
    run_number: u32,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

impl RunTestRequest {
    fn into_task(self) -> TestTask {
        let repo_name = self
            .repo_path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("repo")
            .to_string();
        TestTask {
            repo_name,
            repo_path: self.repo_path,
            input_file: self.input_file,
            inputs_path: self.inputs_path,
            output_path: self.output_path,
            run_number: self.run_number,
            branch: self.branch,
            session_id: self.session_id,
        }
    }
}

pub(crate) async fn run_test(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RunTestRequest>,
) -> Json<TestResult> {
    let orchestrator = Orchestrator::new(state.config.clone(), state.broadcaster.clone());
    let result = orchestrator.run_single(req.into_task()).await;
    Json(result)
}

pub(crate) async fn run_all(State(state): State<Arc<AppState>>) -> Json<Value> {
    let orchestrator = Orchestrator::new(state.config.clone(), state.broadcaster.clone());
    let results = orchestrator.run_all().await;
    Json(json!({ "results": results }))
}

// ---------------------------------------------------------------------------
// Session logs
// ---------------------------------------------------------------------------

pub(crate) async fn log_snapshot(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    let logs = state.broadcaster.snapshot(&session_id);
    Json(json!({ "session_id": session_id, "logs": logs }))
}

/// Replay-then-live NDJSON stream for one session. The attach happens before
/// the response body starts, so the replay is complete relative to any entry
/// published afterwards. Client disconnect drops the subscription; the
/// broadcaster prunes it on the next publish.
pub(crate) async fn log_stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let subscription = state.broadcaster.attach(&session_id);
    let stream = ndjson_lines(subscription, KEEPALIVE_INTERVAL)
        .map(Ok::<_, std::convert::Infallible>);

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
}

/// One NDJSON line per log entry, with a keepalive record whenever the
/// session stays quiet for a whole idle window.
fn ndjson_lines(mut subscription: Subscription, keepalive: Duration) -> impl Stream<Item = Bytes> {
    async_stream::stream! {
        loop {
            match tokio::time::timeout(keepalive, subscription.recv()).await {
                Ok(Some(entry)) => {
                    let Ok(mut line) = serde_json::to_string(&entry) else {
                        continue;
                    };
                    line.push('\n');
                    yield Bytes::from(line);
                }
                Ok(None) => break,
                Err(_) => yield Bytes::from_static(b"{\"keepalive\":true}\n"),
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
