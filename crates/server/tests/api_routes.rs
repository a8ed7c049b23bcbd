use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use chrono::{SecondsFormat, Utc};
use esgflow_core::backend::WorkflowBackend;
use esgflow_core::domain::approval::{
    ApprovalHistoryEntry, ApprovalId, ApprovalRequest, NewApprovalRequest, ProcessApproval,
    RequestFilter,
};
use esgflow_core::domain::module::Module;
use esgflow_core::domain::session::{TenantId, UserId};
use esgflow_core::domain::version::VersionRecord;
use esgflow_core::errors::ApplicationError;
use esgflow_db::{
    connect_with_settings, migrations, DbPool, InMemoryWorkflowBackend, SqlWorkflowBackend,
};
use esgflow_server::app_router;
use esgflow_server::sla_registry::SlaRegistry;
use serde_json::{json, Value};
use tower::util::ServiceExt;

const TENANT: &str = "pc-acme";
const MAKER: &str = "maker-ana";
const CHECKER: &str = "checker-raj";

struct TestContext {
    pool: DbPool,
    monitors: Arc<SlaRegistry<SqlWorkflowBackend>>,
    app: axum::Router,
}

async fn build_test_context() -> TestContext {
    let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
    migrations::run_pending(&pool).await.expect("migrations should apply");

    let backend = Arc::new(SqlWorkflowBackend::new(pool.clone()));
    let monitors = Arc::new(SlaRegistry::new(Arc::clone(&backend), Duration::from_secs(3600), 48));
    let app = app_router(pool.clone(), backend, Arc::clone(&monitors));
    TestContext { pool, monitors, app }
}

async fn request_json(
    app: &axum::Router,
    method: &str,
    uri: &str,
    user: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user).header("x-portfolio-company-id", TENANT);
    }
    let request = match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request should build"),
        None => builder.body(Body::empty()).expect("request should build"),
    };

    let response = app.clone().oneshot(request).await.expect("request should be handled");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice::<Value>(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, json)
}

async fn submit(app: &axum::Router, record_id: &str, priority: &str) -> String {
    let (status, body) = request_json(
        app,
        "POST",
        "/api/v1/approvals",
        Some(MAKER),
        Some(json!({
            "module": "esg_metrics",
            "record_id": record_id,
            "record_type": "update",
            "current_data": {"scope1_tco2e": 1250, "unit": "tCO2e"},
            "previous_data": {"scope1_tco2e": 1100, "unit": "tCO2e"},
            "change_summary": "restated scope 1",
            "priority": priority,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "unexpected create response: {body}");
    body["id"].as_str().expect("id should be returned").to_string()
}

#[tokio::test]
async fn missing_session_headers_are_unauthorized() {
    let ctx = build_test_context().await;

    let (status, body) = request_json(&ctx.app, "GET", "/api/v1/approvals", None, None).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap_or_default().contains("no authenticated user"));
    assert!(body["correlation_id"].as_str().is_some_and(|id| !id.is_empty()));
    ctx.pool.close().await;
}

#[tokio::test]
async fn approval_lifecycle_over_http() {
    let ctx = build_test_context().await;
    let id = submit(&ctx.app, "metric-7", "high").await;

    let (status, body) =
        request_json(&ctx.app, "GET", "/api/v1/approvals?module=esg_metrics", Some(MAKER), None)
            .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requests"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["requests"][0]["status"], "pending_review");

    let (status, body) =
        request_json(&ctx.app, "GET", &format!("/api/v1/approvals/{id}/diff"), Some(CHECKER), None)
            .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["changes"],
        json!([{"field": "scope1_tco2e", "old_value": 1100, "new_value": 1250}])
    );

    let (status, body) = request_json(
        &ctx.app,
        "POST",
        &format!("/api/v1/approvals/{id}/assign"),
        Some(MAKER),
        Some(json!({"checker_id": CHECKER})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "in_review");
    assert_eq!(body["assigned_checker_id"], CHECKER);

    let (status, body) =
        request_json(&ctx.app, "GET", "/api/v1/approvals/mine?role=checker", Some(CHECKER), None)
            .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requests"].as_array().map(Vec::len), Some(1));

    let (status, body) = request_json(
        &ctx.app,
        "POST",
        &format!("/api/v1/approvals/{id}/process"),
        Some(CHECKER),
        Some(json!({"action": "approve", "comment": "verified against invoices"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "approved");
    assert_eq!(body["checker_comment"], "verified against invoices");

    let (status, body) = request_json(
        &ctx.app,
        "POST",
        &format!("/api/v1/approvals/{id}/process"),
        Some(CHECKER),
        Some(json!({"action": "reject"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["message"].as_str().unwrap_or_default().contains("Refresh"));

    let (status, body) = request_json(
        &ctx.app,
        "GET",
        &format!("/api/v1/approvals/{id}/history"),
        Some(MAKER),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let actions: Vec<&str> = body
        .as_array()
        .map(|entries| entries.iter().filter_map(|entry| entry["action"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(actions, vec!["submit", "assign_checker", "approve"]);

    let (status, body) =
        request_json(&ctx.app, "GET", "/api/v1/versions/esg_metrics/metric-7", Some(MAKER), None)
            .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current_version_number"], 1);
    assert_eq!(body["versions"][0]["data"]["scope1_tco2e"], 1250);

    let (status, body) =
        request_json(&ctx.app, "GET", "/api/v1/approvals/stats", Some(MAKER), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["approved"], 1);
    assert_eq!(body["pending"], 0);

    ctx.monitors.shutdown_all().await;
    ctx.pool.close().await;
}

#[tokio::test]
async fn invalid_inputs_map_to_client_errors() {
    let ctx = build_test_context().await;

    let (status, _) =
        request_json(&ctx.app, "GET", "/api/v1/approvals?module=payroll", Some(MAKER), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) =
        request_json(&ctx.app, "GET", "/api/v1/approvals/mine?role=auditor", Some(MAKER), None)
            .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = request_json(
        &ctx.app,
        "POST",
        "/api/v1/approvals",
        Some(MAKER),
        Some(json!({
            "module": "esg_cap",
            "record_id": "  ",
            "record_type": "create",
            "current_data": {"action": "install solar"},
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap_or_default().contains("record_id"));

    let (status, _) = request_json(
        &ctx.app,
        "POST",
        "/api/v1/approvals/missing-request/process",
        Some(CHECKER),
        Some(json!({"action": "approve"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    ctx.pool.close().await;
}

#[tokio::test]
async fn malformed_bodies_and_parameters_get_the_json_error_body() {
    let ctx = build_test_context().await;
    let id = submit(&ctx.app, "metric-1", "medium").await;

    let (status, body) = request_json(
        &ctx.app,
        "POST",
        &format!("/api/v1/approvals/{id}/process"),
        Some(CHECKER),
        Some(json!({"action": "escalate"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["correlation_id"].is_string(), "unexpected body: {body}");
    assert!(body["error"].as_str().is_some_and(|error| error.contains("invalid request")));

    let (status, body) = request_json(
        &ctx.app,
        "GET",
        "/api/v1/versions/esg_metrics/metric-1/compare?from=one&to=2",
        Some(MAKER),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["correlation_id"].is_string(), "unexpected body: {body}");

    let (status, body) = request_json(
        &ctx.app,
        "POST",
        "/api/v1/versions/esg_metrics/metric-1/restore/latest",
        Some(MAKER),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].is_string(), "unexpected body: {body}");

    ctx.pool.close().await;
}

#[tokio::test]
async fn version_routes_compare_and_refuse_restore() {
    let ctx = build_test_context().await;
    for scope1 in [1100, 1250] {
        let (status, body) = request_json(
            &ctx.app,
            "POST",
            "/api/v1/approvals",
            Some(MAKER),
            Some(json!({
                "module": "ghg_accounting",
                "record_id": "ghg-2025",
                "record_type": "update",
                "current_data": {"scope1": scope1},
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["id"].as_str().expect("id").to_string();
        let (status, _) = request_json(
            &ctx.app,
            "POST",
            &format!("/api/v1/approvals/{id}/process"),
            Some(CHECKER),
            Some(json!({"action": "approve"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let base = "/api/v1/versions/ghg_accounting/ghg-2025";
    let (status, body) =
        request_json(&ctx.app, "GET", &format!("{base}/compare?from=1&to=2"), Some(MAKER), None)
            .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changes"]["scope1"], json!({"old": 1100, "new": 1250}));

    let (status, body) =
        request_json(&ctx.app, "GET", &format!("{base}/history"), Some(MAKER), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["is_current"], true);
    assert_eq!(body[0]["version"]["version_number"], 2);
    assert_eq!(body[1]["changes"], Value::Null);

    let (status, _) =
        request_json(&ctx.app, "GET", &format!("{base}/compare?from=1&to=9"), Some(MAKER), None)
            .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) =
        request_json(&ctx.app, "POST", &format!("{base}/restore/1"), Some(MAKER), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap_or_default().contains("approval workflow"));

    let (status, _) =
        request_json(&ctx.app, "POST", &format!("{base}/restore/9"), Some(MAKER), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) =
        request_json(&ctx.app, "GET", "/api/v1/versions/payroll/ghg-2025", Some(MAKER), None)
            .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    ctx.pool.close().await;
}

#[tokio::test]
async fn sla_alerts_report_overdue_requests_for_the_tenant() {
    let ctx = build_test_context().await;
    let late = submit(&ctx.app, "metric-late", "high").await;
    submit(&ctx.app, "metric-fresh", "low").await;

    let due_at =
        (Utc::now() - chrono::Duration::hours(50)).to_rfc3339_opts(SecondsFormat::Micros, true);
    sqlx::query("UPDATE approval_requests SET due_at = ? WHERE id = ?")
        .bind(&due_at)
        .bind(&late)
        .execute(&ctx.pool)
        .await
        .expect("due_at should backdate");

    let (status, body) =
        request_json(&ctx.app, "GET", "/api/v1/sla/alerts?critical=true", Some(MAKER), None).await;
    assert_eq!(status, StatusCode::OK);
    let alerts = body["alerts"].as_array().cloned().unwrap_or_default();
    assert_eq!(alerts.len(), 1, "unexpected alerts: {body}");
    assert_eq!(alerts[0]["request_id"], late);
    assert!(alerts[0]["hours_overdue"].as_i64().is_some_and(|hours| hours >= 49));
    assert!(body["last_checked_at"].is_string());

    let (status, body) =
        request_json(&ctx.app, "GET", "/api/v1/sla/alerts?module=esg_cap", Some(MAKER), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["alerts"], json!([]));

    ctx.monitors.shutdown_all().await;
    ctx.pool.close().await;
}

/// Delays SLA reads and records how many overlapped.
#[derive(Default)]
struct SlowSlaBackend {
    inner: InMemoryWorkflowBackend,
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl WorkflowBackend for SlowSlaBackend {
    async fn list_requests(
        &self,
        tenant: &TenantId,
        filter: &RequestFilter,
    ) -> Result<Vec<ApprovalRequest>, ApplicationError> {
        self.inner.list_requests(tenant, filter).await
    }

    async fn find_request(
        &self,
        tenant: &TenantId,
        id: &ApprovalId,
    ) -> Result<Option<ApprovalRequest>, ApplicationError> {
        self.inner.find_request(tenant, id).await
    }

    async fn create_approval_request(
        &self,
        tenant: &TenantId,
        maker: &UserId,
        request: NewApprovalRequest,
    ) -> Result<ApprovalId, ApplicationError> {
        self.inner.create_approval_request(tenant, maker, request).await
    }

    async fn process_approval_request(
        &self,
        tenant: &TenantId,
        actor: &UserId,
        command: ProcessApproval,
    ) -> Result<ApprovalRequest, ApplicationError> {
        self.inner.process_approval_request(tenant, actor, command).await
    }

    async fn assign_checker(
        &self,
        tenant: &TenantId,
        actor: &UserId,
        id: &ApprovalId,
        checker: &UserId,
    ) -> Result<(), ApplicationError> {
        self.inner.assign_checker(tenant, actor, id, checker).await
    }

    async fn list_history(
        &self,
        tenant: &TenantId,
        id: &ApprovalId,
    ) -> Result<Vec<ApprovalHistoryEntry>, ApplicationError> {
        self.inner.list_history(tenant, id).await
    }

    async fn list_versions(
        &self,
        tenant: &TenantId,
        module: Module,
        record_id: &str,
    ) -> Result<Vec<VersionRecord>, ApplicationError> {
        self.inner.list_versions(tenant, module, record_id).await
    }

    async fn list_open_with_due(
        &self,
        tenant: &TenantId,
    ) -> Result<Vec<ApprovalRequest>, ApplicationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.inner.list_open_with_due(tenant).await
    }
}

#[tokio::test]
async fn first_sla_alert_request_never_overlaps_the_background_check() {
    let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
    migrations::run_pending(&pool).await.expect("migrations should apply");
    let backend = Arc::new(SlowSlaBackend::default());
    let monitors = Arc::new(SlaRegistry::new(Arc::clone(&backend), Duration::from_secs(3600), 48));
    let app = app_router(pool.clone(), Arc::clone(&backend), Arc::clone(&monitors));

    let (status, body) = request_json(&app, "GET", "/api/v1/sla/alerts", Some(MAKER), None).await;

    assert_eq!(status, StatusCode::OK, "unexpected body: {body}");
    assert!(body["last_checked_at"].is_string());
    assert_eq!(body["alerts"], json!([]));
    assert!(backend.calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(backend.peak.load(Ordering::SeqCst), 1);

    monitors.shutdown_all().await;
    pool.close().await;
}

#[tokio::test]
async fn health_route_is_served_alongside_the_api() {
    let ctx = build_test_context().await;

    let (status, body) = request_json(&ctx.app, "GET", "/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    ctx.pool.close().await;
}
