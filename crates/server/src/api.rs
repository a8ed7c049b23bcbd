//! JSON API over the approval, version, and SLA stores.
//!
//! Every route is tenant scoped by the `x-portfolio-company-id` header and
//! attributed to the `x-user-id` header. A request without either is
//! answered with 401 before any backend call.
//!
//! - `GET  /api/v1/approvals?module=&status=`
//! - `POST /api/v1/approvals`
//! - `GET  /api/v1/approvals/stats`
//! - `GET  /api/v1/approvals/mine?role=maker|checker`
//! - `POST /api/v1/approvals/{id}/process`
//! - `POST /api/v1/approvals/{id}/assign`
//! - `GET  /api/v1/approvals/{id}/diff`
//! - `GET  /api/v1/approvals/{id}/history`
//! - `GET  /api/v1/versions/{module}/{record_id}`
//! - `GET  /api/v1/versions/{module}/{record_id}/history`
//! - `GET  /api/v1/versions/{module}/{record_id}/compare?from=&to=`
//! - `POST /api/v1/versions/{module}/{record_id}/restore/{version_number}`
//! - `GET  /api/v1/sla/alerts?module=&critical=`

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use esgflow_core::approvals::{ApprovalRequestStore, ApprovalStats};
use esgflow_core::backend::WorkflowBackend;
use esgflow_core::diff::{FieldChange, VersionChange};
use esgflow_core::domain::approval::{
    ApprovalAction, ApprovalHistoryEntry, ApprovalId, ApprovalRequest, ApprovalStatus,
    NewApprovalRequest, ProcessApproval, RequestFilter,
};
use esgflow_core::domain::module::Module;
use esgflow_core::domain::session::{Session, TenantId, UserId};
use esgflow_core::domain::version::VersionRecord;
use esgflow_core::errors::{ApplicationError, InterfaceError};
use esgflow_core::sla::SlaAlert;
use esgflow_core::versions::{VersionHistoryEntry, VersionHistoryStore};

use crate::sla_registry::SlaRegistry;

pub const USER_HEADER: &str = "x-user-id";
pub const TENANT_HEADER: &str = "x-portfolio-company-id";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

pub struct ApiState<B> {
    backend: Arc<B>,
    monitors: Arc<SlaRegistry<B>>,
}

impl<B> Clone for ApiState<B> {
    fn clone(&self) -> Self {
        Self { backend: Arc::clone(&self.backend), monitors: Arc::clone(&self.monitors) }
    }
}

impl<B> ApiState<B> {
    pub fn new(backend: Arc<B>, monitors: Arc<SlaRegistry<B>>) -> Self {
        Self { backend, monitors }
    }
}

pub fn router<B>(state: ApiState<B>) -> Router
where
    B: WorkflowBackend + 'static,
{
    Router::new()
        .route("/api/v1/approvals", get(list_approvals::<B>).post(create_approval::<B>))
        .route("/api/v1/approvals/stats", get(approval_stats::<B>))
        .route("/api/v1/approvals/mine", get(my_approvals::<B>))
        .route("/api/v1/approvals/{id}/process", post(process_approval::<B>))
        .route("/api/v1/approvals/{id}/assign", post(assign_checker::<B>))
        .route("/api/v1/approvals/{id}/diff", get(approval_diff::<B>))
        .route("/api/v1/approvals/{id}/history", get(approval_history::<B>))
        .route("/api/v1/versions/{module}/{record_id}", get(list_versions::<B>))
        .route("/api/v1/versions/{module}/{record_id}/history", get(version_history::<B>))
        .route("/api/v1/versions/{module}/{record_id}/compare", get(compare_versions::<B>))
        .route(
            "/api/v1/versions/{module}/{record_id}/restore/{version_number}",
            post(restore_version::<B>),
        )
        .route("/api/v1/sla/alerts", get(sla_alerts::<B>))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub module: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MineQuery {
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProcessBody {
    pub action: ApprovalAction,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AssignBody {
    pub checker_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CompareQuery {
    pub from: u32,
    pub to: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct AlertQuery {
    pub module: Option<String>,
    #[serde(default)]
    pub critical: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedResponse {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApprovalListResponse {
    pub requests: Vec<ApprovalRequest>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DiffResponse {
    pub request_id: String,
    pub changes: Vec<FieldChange>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionListResponse {
    pub module: Module,
    pub record_id: String,
    pub current_version_number: Option<u32>,
    pub versions: Vec<VersionRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompareResponse {
    pub from: u32,
    pub to: u32,
    pub changes: BTreeMap<String, VersionChange>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AlertResponse {
    pub alerts: Vec<SlaAlert>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub correlation_id: String,
}

pub struct ApiError(InterfaceError);

impl From<InterfaceError> for ApiError {
    fn from(error: InterfaceError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, correlation_id) = match &self.0 {
            InterfaceError::BadRequest { correlation_id, .. } => {
                (StatusCode::BAD_REQUEST, correlation_id)
            }
            InterfaceError::Unauthorized { correlation_id, .. } => {
                (StatusCode::UNAUTHORIZED, correlation_id)
            }
            InterfaceError::NotFound { correlation_id, .. } => {
                (StatusCode::NOT_FOUND, correlation_id)
            }
            InterfaceError::Conflict { correlation_id, .. } => {
                (StatusCode::CONFLICT, correlation_id)
            }
            InterfaceError::ServiceUnavailable { correlation_id, .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, correlation_id)
            }
            InterfaceError::Internal { correlation_id, .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, correlation_id)
            }
        };

        if status.is_server_error() {
            warn!(
                event_name = "api.request_failed",
                correlation_id = %correlation_id,
                status = status.as_u16(),
                error = %self.0,
                "api request failed"
            );
        }

        let body = ErrorBody {
            error: self.0.message().to_string(),
            message: self.0.user_message().to_string(),
            correlation_id: correlation_id.clone(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Caller identity and correlation id pulled from request headers.
struct RequestContext {
    session: Session,
    correlation_id: String,
}

impl RequestContext {
    fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        let session = Session {
            user_id: header(USER_HEADER).map(UserId),
            tenant_id: header(TENANT_HEADER).map(TenantId),
        };
        let correlation_id =
            header(CORRELATION_HEADER).unwrap_or_else(|| Uuid::new_v4().to_string());

        Self { session, correlation_id }
    }

    fn fail(&self, error: ApplicationError) -> ApiError {
        ApiError(error.into_interface(self.correlation_id.clone()))
    }

    fn bad_request(&self, message: impl Into<String>) -> ApiError {
        ApiError(InterfaceError::BadRequest {
            message: message.into(),
            correlation_id: self.correlation_id.clone(),
        })
    }

    /// Extractor rejections answer with the same JSON error body as everything else.
    fn accept<T, R: std::fmt::Display>(&self, extracted: Result<T, R>) -> ApiResult<T> {
        extracted.map_err(|rejection| self.bad_request(format!("invalid request: {rejection}")))
    }

    fn require(&self) -> ApiResult<()> {
        self.session.require().map(|_| ()).map_err(|error| self.fail(error))
    }

    fn approvals<B: WorkflowBackend>(&self, backend: &Arc<B>) -> ApprovalRequestStore<B> {
        ApprovalRequestStore::new(Arc::clone(backend), self.session.clone())
    }

    /// Fetches through the store and turns a swallowed fetch error into a 503.
    async fn fetch<B: WorkflowBackend>(
        &self,
        store: &ApprovalRequestStore<B>,
        filter: RequestFilter,
    ) -> ApiResult<Vec<ApprovalRequest>> {
        self.require()?;
        let requests = store.fetch_requests(filter).await;
        match store.last_error() {
            Some(message) => Err(ApiError(InterfaceError::ServiceUnavailable {
                message,
                correlation_id: self.correlation_id.clone(),
            })),
            None => Ok(requests),
        }
    }

    fn parse_module(&self, raw: &str) -> ApiResult<Module> {
        Module::parse(raw).ok_or_else(|| self.bad_request(format!("unknown module `{raw}`")))
    }
}

// ---------------------------------------------------------------------------
// Approval handlers
// ---------------------------------------------------------------------------

async fn list_approvals<B: WorkflowBackend + 'static>(
    State(state): State<ApiState<B>>,
    headers: HeaderMap,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<ApprovalListResponse>> {
    let context = RequestContext::from_headers(&headers);
    let Query(query) = context.accept(query)?;
    let module = query.module.as_deref().map(|raw| context.parse_module(raw)).transpose()?;
    let status = query
        .status
        .as_deref()
        .map(|raw| {
            ApprovalStatus::parse(raw)
                .ok_or_else(|| context.bad_request(format!("unknown status `{raw}`")))
        })
        .transpose()?;

    let store = context.approvals(&state.backend);
    let requests = context.fetch(&store, RequestFilter { module, status }).await?;
    Ok(Json(ApprovalListResponse { requests }))
}

async fn create_approval<B: WorkflowBackend + 'static>(
    State(state): State<ApiState<B>>,
    headers: HeaderMap,
    body: Result<Json<NewApprovalRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CreatedResponse>)> {
    let context = RequestContext::from_headers(&headers);
    let Json(body) = context.accept(body)?;
    let store = context.approvals(&state.backend);
    let id = store.create_approval_request(body).await.map_err(|error| context.fail(error))?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { id: id.0 })))
}

async fn approval_stats<B: WorkflowBackend + 'static>(
    State(state): State<ApiState<B>>,
    headers: HeaderMap,
) -> ApiResult<Json<ApprovalStats>> {
    let context = RequestContext::from_headers(&headers);
    let store = context.approvals(&state.backend);
    context.fetch(&store, RequestFilter::default()).await?;
    Ok(Json(store.approval_stats()))
}

async fn my_approvals<B: WorkflowBackend + 'static>(
    State(state): State<ApiState<B>>,
    headers: HeaderMap,
    query: Result<Query<MineQuery>, QueryRejection>,
) -> ApiResult<Json<ApprovalListResponse>> {
    let context = RequestContext::from_headers(&headers);
    let Query(query) = context.accept(query)?;
    let store = context.approvals(&state.backend);
    context.fetch(&store, RequestFilter::default()).await?;

    let requests = match query.role.as_deref().map(str::trim).unwrap_or("maker") {
        "maker" => store.my_maker_requests(),
        "checker" => store.my_checker_requests(),
        other => {
            return Err(
                context.bad_request(format!("unknown role `{other}` (expected maker|checker)"))
            );
        }
    };
    Ok(Json(ApprovalListResponse { requests }))
}

async fn process_approval<B: WorkflowBackend + 'static>(
    State(state): State<ApiState<B>>,
    headers: HeaderMap,
    path: Result<Path<String>, PathRejection>,
    body: Result<Json<ProcessBody>, JsonRejection>,
) -> ApiResult<Json<ApprovalRequest>> {
    let context = RequestContext::from_headers(&headers);
    let Path(id) = context.accept(path)?;
    let Json(body) = context.accept(body)?;
    let store = context.approvals(&state.backend);
    let updated = store
        .process_approval(ProcessApproval {
            request_id: ApprovalId(id),
            action: body.action,
            comment: body.comment,
        })
        .await
        .map_err(|error| context.fail(error))?;
    Ok(Json(updated))
}

async fn assign_checker<B: WorkflowBackend + 'static>(
    State(state): State<ApiState<B>>,
    headers: HeaderMap,
    path: Result<Path<String>, PathRejection>,
    body: Result<Json<AssignBody>, JsonRejection>,
) -> ApiResult<Json<ApprovalRequest>> {
    let context = RequestContext::from_headers(&headers);
    let Path(id) = context.accept(path)?;
    let Json(body) = context.accept(body)?;
    let store = context.approvals(&state.backend);
    let id = ApprovalId(id);
    store
        .assign_checker(&id, UserId(body.checker_id.trim().to_string()))
        .await
        .map_err(|error| context.fail(error))?;
    let updated = store.find_request(&id).await.map_err(|error| context.fail(error))?;
    Ok(Json(updated))
}

async fn approval_diff<B: WorkflowBackend + 'static>(
    State(state): State<ApiState<B>>,
    headers: HeaderMap,
    path: Result<Path<String>, PathRejection>,
) -> ApiResult<Json<DiffResponse>> {
    let context = RequestContext::from_headers(&headers);
    let Path(id) = context.accept(path)?;
    let store = context.approvals(&state.backend);
    let request =
        store.find_request(&ApprovalId(id)).await.map_err(|error| context.fail(error))?;
    let changes = store.calculate_diff(&request);
    Ok(Json(DiffResponse { request_id: request.id.0, changes }))
}

async fn approval_history<B: WorkflowBackend + 'static>(
    State(state): State<ApiState<B>>,
    headers: HeaderMap,
    path: Result<Path<String>, PathRejection>,
) -> ApiResult<Json<Vec<ApprovalHistoryEntry>>> {
    let context = RequestContext::from_headers(&headers);
    let Path(id) = context.accept(path)?;
    let store = context.approvals(&state.backend);
    let id = ApprovalId(id);
    store.find_request(&id).await.map_err(|error| context.fail(error))?;
    let history = store.history(&id).await.map_err(|error| context.fail(error))?;
    Ok(Json(history))
}

// ---------------------------------------------------------------------------
// Version handlers
// ---------------------------------------------------------------------------

async fn loaded_versions<B: WorkflowBackend>(
    context: &RequestContext,
    backend: &Arc<B>,
    module: &str,
    record_id: String,
) -> ApiResult<VersionHistoryStore<B>> {
    context.require()?;
    let module = context.parse_module(module)?;
    let store =
        VersionHistoryStore::new(Arc::clone(backend), context.session.clone(), module, record_id);
    store.fetch_versions().await;
    match store.last_error() {
        Some(message) => Err(ApiError(InterfaceError::ServiceUnavailable {
            message,
            correlation_id: context.correlation_id.clone(),
        })),
        None => Ok(store),
    }
}

async fn list_versions<B: WorkflowBackend + 'static>(
    State(state): State<ApiState<B>>,
    headers: HeaderMap,
    path: Result<Path<(String, String)>, PathRejection>,
) -> ApiResult<Json<VersionListResponse>> {
    let context = RequestContext::from_headers(&headers);
    let Path((module, record_id)) = context.accept(path)?;
    let store = loaded_versions(&context, &state.backend, &module, record_id).await?;
    Ok(Json(VersionListResponse {
        module: store.module(),
        record_id: store.record_id().to_string(),
        current_version_number: store.current_version().map(|version| version.version_number),
        versions: store.versions(),
    }))
}

async fn version_history<B: WorkflowBackend + 'static>(
    State(state): State<ApiState<B>>,
    headers: HeaderMap,
    path: Result<Path<(String, String)>, PathRejection>,
) -> ApiResult<Json<Vec<VersionHistoryEntry>>> {
    let context = RequestContext::from_headers(&headers);
    let Path((module, record_id)) = context.accept(path)?;
    let store = loaded_versions(&context, &state.backend, &module, record_id).await?;
    Ok(Json(store.version_history()))
}

async fn compare_versions<B: WorkflowBackend + 'static>(
    State(state): State<ApiState<B>>,
    headers: HeaderMap,
    path: Result<Path<(String, String)>, PathRejection>,
    query: Result<Query<CompareQuery>, QueryRejection>,
) -> ApiResult<Json<CompareResponse>> {
    let context = RequestContext::from_headers(&headers);
    let Path((module, record_id)) = context.accept(path)?;
    let Query(query) = context.accept(query)?;
    let store = loaded_versions(&context, &state.backend, &module, record_id).await?;
    let changes = store.compare_versions(query.from, query.to).ok_or_else(|| {
        context.fail(ApplicationError::NotFound(format!(
            "versions {} and {} of {} record `{}`",
            query.from,
            query.to,
            store.module(),
            store.record_id()
        )))
    })?;
    Ok(Json(CompareResponse { from: query.from, to: query.to, changes }))
}

async fn restore_version<B: WorkflowBackend + 'static>(
    State(state): State<ApiState<B>>,
    headers: HeaderMap,
    path: Result<Path<(String, String, u32)>, PathRejection>,
) -> ApiResult<StatusCode> {
    let context = RequestContext::from_headers(&headers);
    let Path((module, record_id, version_number)) = context.accept(path)?;
    let store = loaded_versions(&context, &state.backend, &module, record_id).await?;
    store.restore_version(version_number).map_err(|error| context.fail(error))?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// SLA handlers
// ---------------------------------------------------------------------------

async fn sla_alerts<B: WorkflowBackend + 'static>(
    State(state): State<ApiState<B>>,
    headers: HeaderMap,
    query: Result<Query<AlertQuery>, QueryRejection>,
) -> ApiResult<Json<AlertResponse>> {
    let context = RequestContext::from_headers(&headers);
    let Query(query) = context.accept(query)?;
    let session = context.session.require().map_err(|error| context.fail(error))?;
    let module = query.module.as_deref().map(|raw| context.parse_module(raw)).transpose()?;

    let monitor = state.monitors.monitor_for(&session.tenant_id).await;
    monitor
        .ensure_checked()
        .await
        .map_err(|error| context.fail(ApplicationError::Integration(error)))?;

    let alerts = match (module, query.critical) {
        (Some(module), true) => {
            monitor.critical_alerts().into_iter().filter(|alert| alert.module == module).collect()
        }
        (Some(module), false) => monitor.alerts_by_module(module),
        (None, true) => monitor.critical_alerts(),
        (None, false) => monitor.alerts(),
    };

    Ok(Json(AlertResponse {
        alerts,
        last_checked_at: monitor.last_checked_at(),
        last_error: monitor.last_error(),
    }))
}
