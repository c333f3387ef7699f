//! HTTP surface: session lifecycle, snapshots, exports, and a
//! convenience exec endpoint that flattens signals into exit codes.

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::error;

use sbx_core::CommandOverrides;
use sbx_proto::{
    validate_exec_body, CreateSessionRequest, CreateSessionResponse, ErrorBody, ErrorResponse,
    ExecBody, ExecResponse, ExportResponse, HealthResponse, MessageResponse, SetCwdBody,
    SetEnvBody, SnapshotCreateBody, SnapshotEntry, SnapshotListResponse,
};

use crate::state::AppState;

/// Cap on uploaded snapshot archives (1 GiB).
const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

/// Build the HTTP router over the shared state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", post(create_session))
        .route("/sessions/{id}", delete(destroy_session))
        .route("/sessions/{id}/env", post(set_env))
        .route("/sessions/{id}/cwd", post(set_cwd))
        .route("/sessions/{id}/exec", post(exec))
        .route("/sessions/{id}/wipe", post(wipe))
        .route(
            "/sessions/{id}/snapshots",
            post(create_snapshot).get(list_snapshots),
        )
        .route(
            "/sessions/{id}/snapshots/{name}",
            put(import_snapshot).delete(delete_snapshot),
        )
        .route("/sessions/{id}/snapshots/{name}/restore", post(restore_snapshot))
        .route("/sessions/{id}/snapshots/{name}/export", post(export_snapshot))
        .route("/sessions/{id}/exports/{file}", get(download_export))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error wrapper mapping the service taxonomy onto HTTP statuses. Internal
/// messages never reach the wire; everything else is safe to show.
pub struct ApiError(sbx_core::Error);

impl From<sbx_core::Error> for ApiError {
    fn from(e: sbx_core::Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use sbx_core::Error;
        let status = match &self.0 {
            Error::SessionNotFound { .. } | Error::SnapshotNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            Error::SessionDestroying { .. } => StatusCode::CONFLICT,
            Error::PathEscape { .. }
            | Error::InvalidArgument { .. }
            | Error::ImportFailed { .. } => StatusCode::BAD_REQUEST,
            Error::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::SpawnFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = if self.0.is_user_error() {
            self.0.to_string()
        } else {
            error!("internal error: {}", self.0);
            "internal error".to_string()
        };

        let body = ErrorResponse {
            error: ErrorBody {
                kind: self.0.kind().to_string(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.registry.active_count().await,
    })
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> ApiResult<Json<CreateSessionResponse>> {
    let session = state.registry.create(body.env).await?;
    Ok(Json(CreateSessionResponse {
        session_id: session.id().to_string(),
    }))
}

async fn destroy_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    state.registry.destroy(&id).await?;
    Ok(Json(MessageResponse {
        message: format!("session {} destroyed", id),
    }))
}

async fn set_env(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SetEnvBody>,
) -> ApiResult<Json<MessageResponse>> {
    let session = state.registry.get(&id).await?;
    session.set_env(body.env).await?;
    Ok(Json(MessageResponse {
        message: "environment updated".to_string(),
    }))
}

async fn set_cwd(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SetCwdBody>,
) -> ApiResult<Json<MessageResponse>> {
    let session = state.registry.get(&id).await?;
    session.set_cwd(&body.cwd).await?;
    Ok(Json(MessageResponse {
        message: "working directory updated".to_string(),
    }))
}

async fn exec(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ExecBody>,
) -> ApiResult<Json<ExecResponse>> {
    validate_exec_body(&body)
        .map_err(|e| sbx_core::Error::invalid_argument(e.to_string()))?;

    let overrides = CommandOverrides {
        time_ms: body.time_ms,
        mem_kb: body.mem_kb,
        fsize_kb: body.fsize_kb,
        nofile: body.nofile,
        env: body.env,
        cwd: body.cwd,
    };
    // Detached so a client disconnect never cancels the child mid-run; the
    // command finishes (or hits its wall clock) regardless.
    let outcome = tokio::spawn(async move { state.exec.run(&id, body.command, overrides).await })
        .await
        .map_err(|e| sbx_core::Error::internal(format!("exec task failed: {}", e)))??;

    // backward-compatible flattening of signal deaths
    let exit_code = if outcome.signal != 0 {
        128 + outcome.signal
    } else {
        outcome.exit_code
    };
    Ok(Json(ExecResponse {
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        exit_code,
    }))
}

async fn wipe(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    state.snapshots.wipe(&id).await?;
    Ok(Json(MessageResponse {
        message: "workspace wiped".to_string(),
    }))
}

async fn create_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SnapshotCreateBody>,
) -> ApiResult<Json<MessageResponse>> {
    state.snapshots.create(&id, &body.name).await?;
    Ok(Json(MessageResponse {
        message: format!("snapshot {} created", body.name),
    }))
}

async fn list_snapshots(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SnapshotListResponse>> {
    let snapshots = state
        .snapshots
        .list(&id)
        .await?
        .into_iter()
        .map(|s| SnapshotEntry {
            name: s.name,
            created_at: s.created_at,
        })
        .collect();
    Ok(Json(SnapshotListResponse { snapshots }))
}

async fn delete_snapshot(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> ApiResult<Json<MessageResponse>> {
    state.snapshots.delete(&id, &name).await?;
    Ok(Json(MessageResponse {
        message: format!("snapshot {} deleted", name),
    }))
}

async fn restore_snapshot(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> ApiResult<Json<MessageResponse>> {
    state.snapshots.restore(&id, &name).await?;
    Ok(Json(MessageResponse {
        message: format!("restored to {}", name),
    }))
}

async fn export_snapshot(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> ApiResult<Json<ExportResponse>> {
    let manifest = state.snapshots.export(&id, &name).await?;
    Ok(Json(ExportResponse {
        name: manifest.name,
        path: manifest.path.display().to_string(),
        size_bytes: manifest.size_bytes,
        sha256: manifest.sha256,
    }))
}

async fn import_snapshot(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Json<MessageResponse>> {
    // Spool the upload next to the exports, then hand it to the store. The
    // spool name must be unique per request: concurrent imports (or a retry
    // racing its original) would otherwise clobber each other's bytes.
    let dir = state.registry.store().exports_dir(&id);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| sbx_core::Error::internal(format!("create upload dir: {}", e)))?;
    let spool = tokio::task::spawn_blocking(move || {
        tempfile::Builder::new()
            .prefix(".upload-")
            .suffix(".tar.gz")
            .tempfile_in(dir)
    })
    .await
    .map_err(|e| sbx_core::Error::internal(format!("spool task failed: {}", e)))?
    .map_err(|e| sbx_core::Error::internal(format!("create spool file: {}", e)))?;
    tokio::fs::write(spool.path(), &body)
        .await
        .map_err(|e| sbx_core::Error::internal(format!("spool upload: {}", e)))?;

    // the spool file is removed when `spool` drops, error or not
    state.snapshots.import(&id, &name, spool.path()).await?;

    Ok(Json(MessageResponse {
        message: format!("imported snapshot {}", name),
    }))
}

async fn download_export(
    State(state): State<AppState>,
    Path((id, file)): Path<(String, String)>,
) -> ApiResult<Response> {
    // bearer check: the session must exist
    state.registry.get(&id).await?;
    if file.contains('/') || file.contains("..") {
        return Err(sbx_core::Error::invalid_argument("invalid export name").into());
    }

    let path = state.registry.store().exports_dir(&id).join(&file);
    let handle = tokio::fs::File::open(&path)
        .await
        .map_err(|_| sbx_core::Error::SnapshotNotFound { name: file.clone() })?;
    let len = handle
        .metadata()
        .await
        .map_err(|e| sbx_core::Error::internal(format!("stat export: {}", e)))?
        .len();

    // exports are one-shot artifacts: unlink now, stream from the open fd
    let _ = tokio::fs::remove_file(&path).await;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/gzip")
        .header(header::CONTENT_LENGTH, len)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file),
        )
        .body(Body::from_stream(ReaderStream::new(handle)))
        .map_err(|e| sbx_core::Error::internal(format!("build download response: {}", e)).into())
}
