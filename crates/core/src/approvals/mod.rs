//! Maker-checker request store for one session.
//!
//! Reads are cached in memory and replaced wholesale on every fetch. A failed
//! fetch leaves the cached list alone and records a display string in
//! [`ApprovalRequestStore::last_error`]. Mutations return errors to the caller
//! and re-fetch the list with the last filter once the backend confirms.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{
    AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, TracingAuditSink,
};
use crate::backend::WorkflowBackend;
use crate::diff::{calculate_diff, FieldChange};
use crate::domain::approval::{
    ApprovalHistoryEntry, ApprovalId, ApprovalRequest, ApprovalStatus, NewApprovalRequest,
    ProcessApproval, RequestFilter,
};
use crate::domain::session::{AuthenticatedSession, Session, UserId};
use crate::errors::{ApplicationError, DomainError};
use crate::flows::{ApprovalEvent, FlowContext, FlowEngine, MakerCheckerFlow, TransitionOutcome};

const FETCH_FAILURE_PREFIX: &str = "Failed to fetch approval requests";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStats {
    pub total: usize,
    /// Requests still awaiting a decision (`pending_review` or `in_review`).
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub overdue: usize,
}

impl ApprovalStats {
    pub fn from_requests(requests: &[ApprovalRequest], now: DateTime<Utc>) -> Self {
        requests.iter().fold(Self::default(), |mut stats, request| {
            stats.total += 1;
            match request.status {
                ApprovalStatus::PendingReview | ApprovalStatus::InReview => stats.pending += 1,
                ApprovalStatus::Approved => stats.approved += 1,
                ApprovalStatus::Rejected => stats.rejected += 1,
            }
            if request.is_overdue_at(now) {
                stats.overdue += 1;
            }
            stats
        })
    }
}

#[derive(Debug, Default)]
struct ApprovalListState {
    requests: Vec<ApprovalRequest>,
    filter: RequestFilter,
    loading: bool,
    error: Option<String>,
}

pub struct ApprovalRequestStore<B> {
    backend: Arc<B>,
    session: Session,
    engine: FlowEngine<MakerCheckerFlow>,
    audit: Arc<dyn AuditSink>,
    state: RwLock<ApprovalListState>,
}

impl<B> ApprovalRequestStore<B>
where
    B: WorkflowBackend,
{
    pub fn new(backend: Arc<B>, session: Session) -> Self {
        Self {
            backend,
            session,
            engine: FlowEngine::default(),
            audit: Arc::new(TracingAuditSink),
            state: RwLock::new(ApprovalListState::default()),
        }
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Loads the tenant's requests matching `filter`, newest first.
    pub async fn fetch_requests(&self, filter: RequestFilter) -> Vec<ApprovalRequest> {
        {
            let mut state = self.write_state();
            state.filter = filter.clone();
            state.loading = true;
        }

        let result = match self.session.require() {
            Ok(session) => self.backend.list_requests(&session.tenant_id, &filter).await,
            Err(error) => Err(error),
        };

        let mut state = self.write_state();
        state.loading = false;
        match result {
            Ok(requests) => {
                state.requests = requests;
                state.error = None;
            }
            Err(error) => {
                warn!(
                    event_name = "approval.fetch_failed",
                    tenant_id = self.tenant_label(),
                    error = %error,
                    "approval request fetch failed"
                );
                state.error = Some(format!("{FETCH_FAILURE_PREFIX}: {error}"));
            }
        }
        state.requests.clone()
    }

    /// Re-runs the most recent fetch.
    pub async fn refresh(&self) -> Vec<ApprovalRequest> {
        let filter = self.read_state().filter.clone();
        self.fetch_requests(filter).await
    }

    pub async fn create_approval_request(
        &self,
        request: NewApprovalRequest,
    ) -> Result<ApprovalId, ApplicationError> {
        let session = self.session.require()?;
        if request.record_id.trim().is_empty() {
            return Err(DomainError::InvariantViolation("record_id must not be empty".to_string())
                .into());
        }

        let module = request.module;
        let id = self
            .backend
            .create_approval_request(&session.tenant_id, &session.user_id, request)
            .await?;
        info!(
            event_name = "approval.created",
            tenant_id = %session.tenant_id.0,
            request_id = %id.0,
            module = %module,
            maker_id = %session.user_id.0,
            "approval request submitted"
        );

        self.refresh().await;
        Ok(id)
    }

    /// Applies a checker decision.
    ///
    /// The transition is validated against the request's stored status before
    /// the backend is called; the backend re-validates under its own lock.
    pub async fn process_approval(
        &self,
        command: ProcessApproval,
    ) -> Result<ApprovalRequest, ApplicationError> {
        let session = self.session.require()?;
        let current = self.load_request(&session, &command.request_id).await?;
        let validated = self.check_transition(&session, &current, command.action.into())?;

        let action = command.action;
        let result = self
            .backend
            .process_approval_request(&session.tenant_id, &session.user_id, command)
            .await;
        self.record_outcome(&validated, result.as_ref().map(|updated| updated.status));
        let updated = result?;
        info!(
            event_name = "approval.processed",
            tenant_id = %session.tenant_id.0,
            request_id = %updated.id.0,
            action = action.as_str(),
            status = updated.status.as_str(),
            checker_id = %session.user_id.0,
            "approval request processed"
        );

        self.refresh().await;
        Ok(updated)
    }

    /// Sets the reviewer and moves the request to `in_review`.
    ///
    /// This is a direct update: `due_at` keeps the value computed at submission.
    pub async fn assign_checker(
        &self,
        request_id: &ApprovalId,
        checker_id: UserId,
    ) -> Result<(), ApplicationError> {
        let session = self.session.require()?;
        if checker_id.0.trim().is_empty() {
            return Err(DomainError::InvariantViolation("checker_id must not be empty".to_string())
                .into());
        }
        let current = self.load_request(&session, request_id).await?;
        let validated = self.check_transition(&session, &current, ApprovalEvent::AssignChecker)?;

        let result = self
            .backend
            .assign_checker(&session.tenant_id, &session.user_id, request_id, &checker_id)
            .await;
        self.record_outcome(&validated, result.as_ref().map(|_| validated.1.to));
        result?;
        info!(
            event_name = "approval.checker_assigned",
            tenant_id = %session.tenant_id.0,
            request_id = %request_id.0,
            checker_id = %checker_id.0,
            "checker assigned"
        );

        self.refresh().await;
        Ok(())
    }

    pub async fn history(
        &self,
        request_id: &ApprovalId,
    ) -> Result<Vec<ApprovalHistoryEntry>, ApplicationError> {
        let session = self.session.require()?;
        self.backend.list_history(&session.tenant_id, request_id).await
    }

    pub async fn find_request(
        &self,
        request_id: &ApprovalId,
    ) -> Result<ApprovalRequest, ApplicationError> {
        let session = self.session.require()?;
        self.load_request(&session, request_id).await
    }

    pub fn calculate_diff(&self, request: &ApprovalRequest) -> Vec<FieldChange> {
        calculate_diff(request)
    }

    pub fn approval_stats(&self) -> ApprovalStats {
        self.approval_stats_at(Utc::now())
    }

    pub fn approval_stats_at(&self, now: DateTime<Utc>) -> ApprovalStats {
        ApprovalStats::from_requests(&self.read_state().requests, now)
    }

    /// Cached requests assigned to the session user for review.
    pub fn my_checker_requests(&self) -> Vec<ApprovalRequest> {
        let Some(user_id) = self.session.user_id.as_ref() else {
            return Vec::new();
        };
        self.read_state()
            .requests
            .iter()
            .filter(|request| request.assigned_checker_id.as_ref() == Some(user_id))
            .cloned()
            .collect()
    }

    /// Cached requests the session user submitted.
    pub fn my_maker_requests(&self) -> Vec<ApprovalRequest> {
        let Some(user_id) = self.session.user_id.as_ref() else {
            return Vec::new();
        };
        self.read_state()
            .requests
            .iter()
            .filter(|request| &request.maker_id == user_id)
            .cloned()
            .collect()
    }

    pub fn requests(&self) -> Vec<ApprovalRequest> {
        self.read_state().requests.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.read_state().error.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.read_state().loading
    }

    async fn load_request(
        &self,
        session: &AuthenticatedSession,
        request_id: &ApprovalId,
    ) -> Result<ApprovalRequest, ApplicationError> {
        self.backend
            .find_request(&session.tenant_id, request_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("approval request `{}`", request_id.0)))
    }

    fn check_transition(
        &self,
        session: &AuthenticatedSession,
        request: &ApprovalRequest,
        event: ApprovalEvent,
    ) -> Result<(AuditContext, TransitionOutcome), ApplicationError> {
        let audit = AuditContext::new(
            Some(request.id.clone()),
            Some(session.tenant_id.clone()),
            Uuid::new_v4().to_string(),
            session.user_id.0.clone(),
        );
        let outcome = self.engine.apply_with_audit(
            request.status,
            event,
            &FlowContext { record_type: request.record_type },
            self.audit.as_ref(),
            &audit,
        )?;
        Ok((audit, outcome))
    }

    /// Audits what the backend did with a transition that passed the local check.
    fn record_outcome(
        &self,
        (audit, outcome): &(AuditContext, TransitionOutcome),
        result: Result<ApprovalStatus, &ApplicationError>,
    ) {
        let (event_type, status) = match &result {
            Ok(_) => ("approval.transition_applied", AuditOutcome::Success),
            Err(_) => ("approval.transition_failed", AuditOutcome::Rejected),
        };
        let event = AuditEvent::new(
            audit.request_id.clone(),
            audit.tenant_id.clone(),
            audit.correlation_id.clone(),
            event_type,
            AuditCategory::Workflow,
            audit.actor.clone(),
            status,
        )
        .with_metadata("from", outcome.from.as_str())
        .with_metadata("event", format!("{:?}", outcome.event));
        let event = match result {
            Ok(to) => event.with_metadata("to", to.as_str()),
            Err(error) => event.with_metadata("error", error.to_string()),
        };
        self.audit.emit(event);
    }

    fn tenant_label(&self) -> &str {
        self.session.tenant_id.as_ref().map(|id| id.0.as_str()).unwrap_or("unknown")
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, ApprovalListState> {
        match self.state.read() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, ApprovalListState> {
        match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
