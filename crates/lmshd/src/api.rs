//! HTTP surface of lmshd.
//!
//! | Route | Operation |
//! |---|---|
//! | `GET /system/version` | daemon version and what the proxy says about the caller |
//! | `GET /system/health` | liveness |
//! | `POST /classroom/create` | reconcile a classroom |
//! | `POST /assignment/create` | reconcile an assignment under a recorded classroom |
//! | `POST /assignment/grade` | propagate grades for one assignment |
//!
//! Errors are `{"error": <message>, "code": <CODE>}` with a status derived
//! from the error category.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use lmsh_core::domain::validation::deserialize_due_date;
use lmsh_core::{
    merge_lms_roster, AssignmentSpec, CancelToken, ClassroomSpec, GradePipeline, Lms, LmshError,
    PropagationReport, PropagationRequest, ReconciliationEngine, ReconciliationResult,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, Level};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconciliationEngine>,
    pub pipeline: Arc<GradePipeline>,
    /// Roster source for `roster_from_lms`.
    pub lms: Arc<dyn Lms>,
    /// Cancelled on shutdown; in-flight runs stop between steps.
    pub cancel: CancelToken,
}

/// Handler error rendered as a JSON body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Lmsh(#[from] LmshError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::Lmsh(err) => {
                let message = err.to_string();
                match err {
                    LmshError::Validation(_) => {
                        (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
                    }
                    LmshError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", message),
                    LmshError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT", message),
                    LmshError::Transient(_) => {
                        (StatusCode::SERVICE_UNAVAILABLE, "TRANSIENT", message)
                    }
                    LmshError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "CANCELLED", message),
                    // our credentials, not the caller's
                    LmshError::Unauthorized(_) => {
                        (StatusCode::BAD_GATEWAY, "UPSTREAM_UNAUTHORIZED", message)
                    }
                    LmshError::GradingHook(_) => (StatusCode::BAD_GATEWAY, "GRADING_HOOK", message),
                    LmshError::Remote(_) => (StatusCode::BAD_GATEWAY, "REMOTE_ERROR", message),
                    LmshError::Storage(_) | LmshError::Serialization(_) | LmshError::Io(_) => {
                        error!(category = err.category(), error = %err, "internal error");
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "INTERNAL_ERROR",
                            "An internal error occurred".to_string(),
                        )
                    }
                }
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct ClientInfo {
    ip: String,
    country: String,
    ray_id: String,
}

#[derive(Debug, Serialize)]
struct VersionResponse {
    version: &'static str,
    client_info: ClientInfo,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: lmsh_core::VERSION,
    })
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Caller details as reported by a Cloudflare-style proxy, falling back to
/// the socket peer.
async fn version(request: Request) -> Json<VersionResponse> {
    let headers = request.headers();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let unknown = || "unknown".to_string();
    Json(VersionResponse {
        version: lmsh_core::VERSION,
        client_info: ClientInfo {
            ip: header(headers, "cf-connecting-ip")
                .or(peer)
                .unwrap_or_else(unknown),
            country: header(headers, "cf-ipcountry").unwrap_or_else(unknown),
            ray_id: header(headers, "cf-ray").unwrap_or_else(unknown),
        },
    })
}

// ---------------------------------------------------------------------------
// Classrooms and assignments
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateClassroom {
    pub name: String,
    pub course_code: String,
    pub org_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub students: Vec<String>,
    /// Merge the LMS enrollment into the roster.
    #[serde(default)]
    pub roster_from_lms: bool,
}

async fn create_classroom(
    State(state): State<AppState>,
    payload: Result<Json<CreateClassroom>, JsonRejection>,
) -> ApiResult<Json<ReconciliationResult>> {
    let Json(body) = payload?;
    let mut spec = ClassroomSpec::new(body.org_id, body.course_code, body.name)
        .with_description(body.description)
        .with_students(body.students);
    if body.roster_from_lms {
        spec = merge_lms_roster(state.lms.as_ref(), spec).await?;
    }
    let result = state.engine.reconcile_classroom(&spec, &state.cancel).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct CreateAssignment {
    /// Course code, team name or remote id of the recorded classroom.
    pub classroom_id: String,
    pub title: String,
    pub course_code: String,
    pub org_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "deserialize_due_date")]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub points: Option<u32>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

async fn create_assignment(
    State(state): State<AppState>,
    payload: Result<Json<CreateAssignment>, JsonRejection>,
) -> ApiResult<Json<ReconciliationResult>> {
    let Json(body) = payload?;
    let mut spec = AssignmentSpec::new(body.org_id, body.course_code, body.title)
        .with_description(body.description)
        .with_due_date(body.due_date)
        .with_points(body.points)
        .with_template(body.template);
    if let Some(key) = body.key {
        spec = spec.with_key(key);
    }
    let result = state
        .engine
        .reconcile_assignment_in(&body.classroom_id, &spec, &state.cancel)
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct GradeAssignment {
    pub assignment_id: String,
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub auto: bool,
    #[serde(default)]
    pub course_code: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
}

/// Per-student failures are part of the report, not an error status.
async fn grade_assignment(
    State(state): State<AppState>,
    payload: Result<Json<GradeAssignment>, JsonRejection>,
) -> ApiResult<Json<PropagationReport>> {
    let Json(body) = payload?;
    let request = PropagationRequest::new(body.assignment_id)
        .scoped(body.org_id, body.course_code)
        .for_student(body.student_id)
        .auto(body.auto);
    let report = state.pipeline.propagate(&request, &state.cancel).await?;
    Ok(Json(report))
}

/// Build the router with request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/system/version", get(version))
        .route("/system/health", get(health))
        .route("/classroom/create", post(create_classroom))
        .route("/assignment/create", post(create_assignment))
        .route("/assignment/grade", post(grade_assignment))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

/// Serve `router` on `listener` until `cancel` fires.
pub async fn serve_http(
    listener: tokio::net::TcpListener,
    state: AppState,
    cancel: CancelToken,
) -> std::io::Result<()> {
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await
}
