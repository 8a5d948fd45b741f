//! HTTP endpoints of the meta-service.
//!
//! Two route groups share one router: caller-facing routes for whoever
//! drives the sandbox from outside, and `/engine/v1` routes polled by the
//! guest agent.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use super::MetaService;
use crate::error::{BridgeError, ErrorBody};
use crate::transport::protocol::{
    ActionId, Chunk, FolderListing, ReplyStatus, ShellCreated, ShellRequest, ShellResult, StreamKind,
    STREAM_EOF_HEADER, STREAM_OFFSET_HEADER,
};

/// Body limit for buffered request bodies when the chunk size is smaller.
const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

type AppState = State<Arc<MetaService>>;

/// Build the router serving `service`.
pub fn router(service: Arc<MetaService>) -> Router {
    let body_limit = service.config().chunk_size.max(DEFAULT_BODY_LIMIT);

    Router::new()
        // Caller-facing
        .route("/artifact", get(get_artifact))
        .route("/folder", get(list_folder))
        .route("/shell", post(create_shell))
        .route("/shell/{id}/stdin", put(write_stdin))
        .route("/shell/{id}/stdout", get(read_stdout))
        .route("/shell/{id}/stderr", get(read_stderr))
        .route("/shell/{id}/result", get(shell_result))
        // Guest-facing
        .route("/engine/v1/ping", get(ping))
        .route("/engine/v1/poll", get(poll_action))
        .route("/engine/v1/reply", post(reply))
        .route("/engine/v1/shell/{id}/stdin", get(pull_stdin))
        .route("/engine/v1/shell/{id}/stdout", put(push_stdout))
        .route("/engine/v1/shell/{id}/stderr", put(push_stderr))
        .route("/engine/v1/shell/{id}/result", put(post_result))
        .route("/engine/v1/execute", get(execute))
        .route("/engine/v1/log", post(append_log))
        .route("/engine/v1/success", put(report_success))
        .route("/engine/v1/failed", put(report_failed))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::ResourceNotFound | Self::UnknownAction(_) | Self::UnknownSession(_) => StatusCode::NOT_FOUND,
            Self::OffsetOutOfRange { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::Conflict(_) | Self::StreamClosed => StatusCode::CONFLICT,
            Self::Malformed(_) => StatusCode::BAD_REQUEST,
            Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            Self::Spawn(_) | Self::Remote(_) | Self::Transport(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            warn!(error = %self, "Request failed");
        } else {
            debug!(error = %self, status = %status, "Request rejected");
        }
        (status, Json(ErrorBody::from(&self))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct PathQuery {
    path: String,
}

#[derive(Debug, Deserialize)]
struct OffsetQuery {
    offset: u64,
    #[serde(default)]
    eof: bool,
}

#[derive(Debug, Deserialize)]
struct ReplyQuery {
    id: ActionId,
    status: ReplyStatus,
}

fn chunk_response(chunk: Chunk) -> Response {
    (
        [
            (STREAM_OFFSET_HEADER, chunk.offset.to_string()),
            (STREAM_EOF_HEADER, chunk.eof.to_string()),
        ],
        chunk.data,
    )
        .into_response()
}

// ============================================================================
// Caller-facing
// ============================================================================

async fn get_artifact(State(meta): AppState, Query(q): Query<PathQuery>) -> Result<Response, BridgeError> {
    let artifact = meta.get_artifact(q.path).await?;
    Ok(Body::from_stream(artifact.into_stream()).into_response())
}

async fn list_folder(
    State(meta): AppState,
    Query(q): Query<PathQuery>,
) -> Result<Json<FolderListing>, BridgeError> {
    let files = meta.list_folder(q.path).await?;
    Ok(Json(FolderListing { files }))
}

async fn create_shell(
    State(meta): AppState,
    Json(req): Json<ShellRequest>,
) -> Result<Json<ShellCreated>, BridgeError> {
    let shell = meta.exec_shell(req.command, req.tty).await?;
    Ok(Json(ShellCreated { id: shell.id() }))
}

async fn write_stdin(
    State(meta): AppState,
    Path(id): Path<ActionId>,
    Query(q): Query<OffsetQuery>,
    body: Bytes,
) -> Result<Response, BridgeError> {
    let ack = meta.write_stdin(id, q.offset, &body, q.eof).await?;
    Ok(Json(ack).into_response())
}

async fn read_stdout(
    State(meta): AppState,
    Path(id): Path<ActionId>,
    Query(q): Query<OffsetQuery>,
) -> Result<Response, BridgeError> {
    let chunk = meta.read_output(id, StreamKind::Stdout, q.offset).await?;
    Ok(chunk_response(chunk))
}

async fn read_stderr(
    State(meta): AppState,
    Path(id): Path<ActionId>,
    Query(q): Query<OffsetQuery>,
) -> Result<Response, BridgeError> {
    let chunk = meta.read_output(id, StreamKind::Stderr, q.offset).await?;
    Ok(chunk_response(chunk))
}

async fn shell_result(State(meta): AppState, Path(id): Path<ActionId>) -> Result<Response, BridgeError> {
    Ok(match meta.shell_result(id).await? {
        Some(result) => Json(result).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

// ============================================================================
// Guest-facing
// ============================================================================

async fn ping() -> StatusCode {
    StatusCode::OK
}

async fn poll_action(State(meta): AppState) -> Result<Response, BridgeError> {
    let timeout = meta.config().poll_timeout();
    Ok(match meta.poll_next_action(timeout).await? {
        Some(action) => Json(action).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn reply(State(meta): AppState, Query(q): Query<ReplyQuery>, body: Body) -> Result<StatusCode, BridgeError> {
    meta.reply(q.id, q.status, body.into_data_stream()).await?;
    Ok(StatusCode::OK)
}

async fn pull_stdin(
    State(meta): AppState,
    Path(id): Path<ActionId>,
    Query(q): Query<OffsetQuery>,
) -> Result<Response, BridgeError> {
    let chunk = meta.pull_stdin(id, q.offset).await?;
    Ok(chunk_response(chunk))
}

async fn push_stdout(
    State(meta): AppState,
    Path(id): Path<ActionId>,
    Query(q): Query<OffsetQuery>,
    body: Bytes,
) -> Result<Response, BridgeError> {
    let ack = meta.push_output(id, StreamKind::Stdout, q.offset, &body, q.eof).await?;
    Ok(Json(ack).into_response())
}

async fn push_stderr(
    State(meta): AppState,
    Path(id): Path<ActionId>,
    Query(q): Query<OffsetQuery>,
    body: Bytes,
) -> Result<Response, BridgeError> {
    let ack = meta.push_output(id, StreamKind::Stderr, q.offset, &body, q.eof).await?;
    Ok(Json(ack).into_response())
}

async fn post_result(
    State(meta): AppState,
    Path(id): Path<ActionId>,
    Json(result): Json<ShellResult>,
) -> Result<StatusCode, BridgeError> {
    meta.post_result(id, result).await?;
    Ok(StatusCode::OK)
}

async fn execute(State(meta): AppState) -> Response {
    Json(meta.task().clone()).into_response()
}

async fn append_log(State(meta): AppState, body: Body) -> Result<StatusCode, BridgeError> {
    meta.append_log(body.into_data_stream()).await?;
    Ok(StatusCode::OK)
}

async fn report_success(State(meta): AppState) -> Result<StatusCode, BridgeError> {
    meta.report_task(true)?;
    Ok(StatusCode::OK)
}

async fn report_failed(State(meta): AppState) -> Result<StatusCode, BridgeError> {
    meta.report_task(false)?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ErrorCode;
    use crate::transport::protocol::{Action, TaskSpec};
    use axum::http::Request;
    use tower::ServiceExt;

    fn service() -> Arc<MetaService> {
        let config = Config::from_json(r#"{"poll_timeout_seconds": 0, "request_timeout_seconds": 5}"#).unwrap();
        let task = TaskSpec {
            command: vec!["echo".into(), "hi".into()],
            ..TaskSpec::default()
        };
        Arc::new(MetaService::new(config, task, Box::new(tokio::io::sink())))
    }

    async fn send(router: Router, method: &str, uri: &str, body: Body) -> Response {
        router
            .oneshot(Request::builder().method(method).uri(uri).body(body).unwrap())
            .await
            .unwrap()
    }

    async fn error_code(response: Response) -> ErrorCode {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice::<ErrorBody>(&bytes).unwrap().code
    }

    #[tokio::test]
    async fn poll_without_actions_is_no_content() {
        let response = send(router(service()), "GET", "/engine/v1/poll", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn poll_after_stop_is_unavailable() {
        let meta = service();
        meta.stop_pollers();
        let response = send(router(meta), "GET", "/engine/v1/poll", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_code(response).await, ErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn created_shell_is_polled_by_guest() {
        let meta = service();
        let response = send(
            router(Arc::clone(&meta)),
            "POST",
            "/shell",
            Body::from(r#"{"command":["cat"]}"#),
        )
        .await;
        // Json extractor requires the content type
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let response = router(Arc::clone(&meta))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/shell")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"command":["cat"]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let created: ShellCreated = serde_json::from_slice(&bytes).unwrap();

        let response = send(router(meta), "GET", "/engine/v1/poll", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let action: Action = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(action.id(), created.id);
    }

    #[tokio::test]
    async fn push_gap_is_range_not_satisfiable() {
        let meta = service();
        let shell = meta.exec_shell(None, false).await.unwrap();
        meta.poll_next_action(std::time::Duration::ZERO).await.unwrap();

        let uri = format!("/engine/v1/shell/{}/stdout?offset=10", shell.id());
        let response = send(router(meta), "PUT", &uri, Body::from("late")).await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(error_code(response).await, ErrorCode::OffsetOutOfRange);
    }

    #[tokio::test]
    async fn output_chunk_carries_offset_headers() {
        let meta = service();
        let shell = meta.exec_shell(None, false).await.unwrap();
        meta.poll_next_action(std::time::Duration::ZERO).await.unwrap();
        meta.push_output(shell.id(), StreamKind::Stderr, 0, b"oops", true)
            .await
            .unwrap();

        let uri = format!("/shell/{}/stderr?offset=0", shell.id());
        let response = send(router(meta), "GET", &uri, Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[STREAM_OFFSET_HEADER], "0");
        assert_eq!(response.headers()[STREAM_EOF_HEADER], "true");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"oops");
    }

    #[tokio::test]
    async fn unknown_session_result_is_not_found() {
        let uri = format!("/shell/{}/result", ActionId::new());
        let response = send(router(service()), "GET", &uri, Body::empty()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(error_code(response).await, ErrorCode::UnknownSession);
    }

    #[tokio::test]
    async fn task_is_reported_once() {
        let meta = service();
        let response = send(router(Arc::clone(&meta)), "GET", "/engine/v1/execute", Body::empty()).await;
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let task: TaskSpec = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(task.command, vec!["echo", "hi"]);

        let response = send(router(Arc::clone(&meta)), "PUT", "/engine/v1/success", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = send(router(Arc::clone(&meta)), "PUT", "/engine/v1/failed", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(meta.task_result().await.unwrap());
    }
}
