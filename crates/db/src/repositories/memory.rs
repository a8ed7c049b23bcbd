use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use esgflow_core::backend::WorkflowBackend;
use esgflow_core::domain::approval::{
    ApprovalHistoryEntry, ApprovalId, ApprovalRequest, ApprovalStatus, HistoryAction,
    NewApprovalRequest, ProcessApproval, RequestFilter,
};
use esgflow_core::domain::module::Module;
use esgflow_core::domain::session::{TenantId, UserId};
use esgflow_core::domain::version::{snapshot_fields, VersionRecord};
use esgflow_core::errors::ApplicationError;
use esgflow_core::flows::{ApprovalEvent, FlowAction, FlowContext, FlowEngine, MakerCheckerFlow};
use esgflow_core::sla::SlaPolicy;

use super::{history_entry, not_found, submitted_request, RepositoryError};

#[derive(Default)]
struct MemoryState {
    requests: HashMap<String, ApprovalRequest>,
    history: Vec<ApprovalHistoryEntry>,
    versions: Vec<VersionRecord>,
}

impl MemoryState {
    fn request_mut(
        &mut self,
        tenant: &TenantId,
        id: &ApprovalId,
    ) -> Result<&mut ApprovalRequest, RepositoryError> {
        self.requests
            .get_mut(&id.0)
            .filter(|request| &request.tenant_id == tenant)
            .ok_or_else(|| not_found(id))
    }

    fn retire_current(&mut self, request: &ApprovalRequest) {
        let now = Utc::now();
        for version in self.versions.iter_mut().filter(|version| {
            version.is_current && same_record(version, request)
        }) {
            version.is_current = false;
            version.updated_at = now;
        }
    }

    fn promote(&mut self, request: &ApprovalRequest) -> u32 {
        self.retire_current(request);
        let next_version = self
            .versions
            .iter()
            .filter(|version| same_record(version, request))
            .map(|version| version.version_number)
            .max()
            .unwrap_or(0)
            + 1;
        let now = Utc::now();
        self.versions.push(VersionRecord {
            id: Uuid::new_v4().to_string(),
            tenant_id: request.tenant_id.clone(),
            module: request.module,
            record_id: request.record_id.clone(),
            version_number: next_version,
            is_current: true,
            data: snapshot_fields(&request.current_data),
            approval_request_id: Some(request.id.clone()),
            created_by: Some(request.maker_id.clone()),
            created_at: now,
            updated_at: now,
        });
        next_version
    }
}

fn same_record(version: &VersionRecord, request: &ApprovalRequest) -> bool {
    version.tenant_id == request.tenant_id
        && version.module == request.module
        && version.record_id == request.record_id
}

/// Process-local backend with the same transition and versioning rules as
/// the SQL backend. Every mutation holds the write lock for its whole span.
pub struct InMemoryWorkflowBackend {
    state: RwLock<MemoryState>,
    policy: SlaPolicy,
    engine: FlowEngine<MakerCheckerFlow>,
}

impl Default for InMemoryWorkflowBackend {
    fn default() -> Self {
        Self::new(SlaPolicy::default())
    }
}

impl InMemoryWorkflowBackend {
    pub fn new(policy: SlaPolicy) -> Self {
        Self { state: RwLock::new(MemoryState::default()), policy, engine: FlowEngine::default() }
    }

    /// Stores a request as-is, bypassing the create procedure.
    pub async fn seed_request(&self, request: ApprovalRequest) {
        let mut state = self.state.write().await;
        state.requests.insert(request.id.0.clone(), request);
    }

    /// Stores a version row as-is, bypassing approval.
    pub async fn seed_version(&self, version: VersionRecord) {
        let mut state = self.state.write().await;
        state.versions.push(version);
    }
}

#[async_trait]
impl WorkflowBackend for InMemoryWorkflowBackend {
    async fn list_requests(
        &self,
        tenant: &TenantId,
        filter: &RequestFilter,
    ) -> Result<Vec<ApprovalRequest>, ApplicationError> {
        let state = self.state.read().await;
        let mut requests: Vec<ApprovalRequest> = state
            .requests
            .values()
            .filter(|request| &request.tenant_id == tenant && filter.matches(request))
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.0.cmp(&a.id.0)));
        Ok(requests)
    }

    async fn find_request(
        &self,
        tenant: &TenantId,
        id: &ApprovalId,
    ) -> Result<Option<ApprovalRequest>, ApplicationError> {
        let state = self.state.read().await;
        Ok(state.requests.get(&id.0).filter(|request| &request.tenant_id == tenant).cloned())
    }

    async fn create_approval_request(
        &self,
        tenant: &TenantId,
        maker: &UserId,
        request: NewApprovalRequest,
    ) -> Result<ApprovalId, ApplicationError> {
        let now = Utc::now();
        let request = submitted_request(
            tenant,
            maker,
            request,
            self.engine.initial_state(),
            &self.policy,
            now,
        );
        let id = request.id.clone();

        let mut state = self.state.write().await;
        state.history.push(history_entry(
            &id,
            HistoryAction::Submit,
            None,
            request.status,
            maker,
            request.change_summary.clone(),
            now,
        ));
        state.requests.insert(id.0.clone(), request);
        Ok(id)
    }

    async fn process_approval_request(
        &self,
        tenant: &TenantId,
        actor: &UserId,
        command: ProcessApproval,
    ) -> Result<ApprovalRequest, ApplicationError> {
        let now = Utc::now();
        let event = ApprovalEvent::from(command.action);
        let mut state = self.state.write().await;

        let request = state.request_mut(tenant, &command.request_id)?;
        let outcome = self
            .engine
            .apply(request.status, event, &FlowContext { record_type: request.record_type })
            .map_err(RepositoryError::from)?;

        request.status = outcome.to;
        if command.comment.is_some() {
            request.checker_comment = command.comment.clone();
        }
        request.reviewed_at = Some(now);
        request.updated_at = now;
        let updated = request.clone();

        for action in &outcome.actions {
            match action {
                FlowAction::RecordHistory => state.history.push(history_entry(
                    &updated.id,
                    HistoryAction::from(event),
                    Some(outcome.from),
                    outcome.to,
                    actor,
                    command.comment.clone(),
                    now,
                )),
                FlowAction::AppendCurrentVersion => {
                    state.promote(&updated);
                }
                FlowAction::RetireCurrentVersion => state.retire_current(&updated),
            }
        }

        Ok(updated)
    }

    async fn assign_checker(
        &self,
        tenant: &TenantId,
        actor: &UserId,
        id: &ApprovalId,
        checker: &UserId,
    ) -> Result<(), ApplicationError> {
        let now = Utc::now();
        let mut state = self.state.write().await;

        let request = state.request_mut(tenant, id)?;
        let outcome = self
            .engine
            .apply(
                request.status,
                ApprovalEvent::AssignChecker,
                &FlowContext { record_type: request.record_type },
            )
            .map_err(RepositoryError::from)?;
        request.assigned_checker_id = Some(checker.clone());
        request.status = outcome.to;
        request.updated_at = now;

        state.history.push(history_entry(
            id,
            HistoryAction::AssignChecker,
            Some(outcome.from),
            outcome.to,
            actor,
            Some(format!("assigned to {}", checker.0)),
            now,
        ));
        Ok(())
    }

    async fn list_history(
        &self,
        tenant: &TenantId,
        id: &ApprovalId,
    ) -> Result<Vec<ApprovalHistoryEntry>, ApplicationError> {
        let state = self.state.read().await;
        let owned = state.requests.get(&id.0).is_some_and(|request| &request.tenant_id == tenant);
        if !owned {
            return Ok(Vec::new());
        }
        Ok(state.history.iter().filter(|entry| &entry.request_id == id).cloned().collect())
    }

    async fn list_versions(
        &self,
        tenant: &TenantId,
        module: Module,
        record_id: &str,
    ) -> Result<Vec<VersionRecord>, ApplicationError> {
        let state = self.state.read().await;
        let mut versions: Vec<VersionRecord> = state
            .versions
            .iter()
            .filter(|version| {
                &version.tenant_id == tenant
                    && version.module == module
                    && version.record_id == record_id
            })
            .cloned()
            .collect();
        versions.sort_by(|a, b| b.version_number.cmp(&a.version_number));
        Ok(versions)
    }

    async fn list_open_with_due(
        &self,
        tenant: &TenantId,
    ) -> Result<Vec<ApprovalRequest>, ApplicationError> {
        let state = self.state.read().await;
        let mut requests: Vec<ApprovalRequest> = state
            .requests
            .values()
            .filter(|request| {
                &request.tenant_id == tenant
                    && matches!(request.status, ApprovalStatus::PendingReview | ApprovalStatus::InReview)
                    && request.due_at.is_some()
            })
            .cloned()
            .collect();
        requests.sort_by_key(|request| request.due_at);
        Ok(requests)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use esgflow_core::backend::WorkflowBackend;
    use esgflow_core::domain::approval::{
        ApprovalAction, ApprovalStatus, NewApprovalRequest, ProcessApproval, RecordType,
        RequestFilter,
    };
    use esgflow_core::domain::module::Module;
    use esgflow_core::domain::session::{TenantId, UserId};
    use esgflow_core::errors::ApplicationError;

    use super::InMemoryWorkflowBackend;

    fn cap_create(record_id: &str) -> NewApprovalRequest {
        NewApprovalRequest {
            module: Module::EsgCap,
            record_id: record_id.to_string(),
            record_type: RecordType::Create,
            current_data: json!({"action": "install solar", "budget": 120000}),
            previous_data: None,
            change_summary: None,
            priority: None,
            materiality_flag: None,
        }
    }

    #[tokio::test]
    async fn request_change_keeps_request_open_without_versioning() {
        let backend = InMemoryWorkflowBackend::default();
        let tenant = TenantId("pc-1".to_string());
        let id = backend
            .create_approval_request(&tenant, &UserId("maker".to_string()), cap_create("cap-1"))
            .await
            .expect("create");

        let updated = backend
            .process_approval_request(
                &tenant,
                &UserId("checker".to_string()),
                ProcessApproval {
                    request_id: id,
                    action: ApprovalAction::RequestChange,
                    comment: Some("attach invoice".to_string()),
                },
            )
            .await
            .expect("request change");

        assert_eq!(updated.status, ApprovalStatus::InReview);
        assert_eq!(updated.checker_comment.as_deref(), Some("attach invoice"));
        let versions = backend.list_versions(&tenant, Module::EsgCap, "cap-1").await.expect("list");
        assert!(versions.is_empty());
    }

    #[tokio::test]
    async fn other_tenants_cannot_see_or_touch_requests() {
        let backend = InMemoryWorkflowBackend::default();
        let owner = TenantId("pc-1".to_string());
        let intruder = TenantId("pc-2".to_string());
        let id = backend
            .create_approval_request(&owner, &UserId("maker".to_string()), cap_create("cap-1"))
            .await
            .expect("create");

        let listed = backend.list_requests(&intruder, &RequestFilter::default()).await.expect("list");
        assert!(listed.is_empty());
        assert_eq!(backend.find_request(&intruder, &id).await.expect("find"), None);
        assert!(backend.list_history(&intruder, &id).await.expect("history").is_empty());

        let result = backend
            .assign_checker(&intruder, &UserId("x".to_string()), &id, &UserId("y".to_string()))
            .await;
        assert!(matches!(result, Err(ApplicationError::NotFound(_))));
    }

    #[tokio::test]
    async fn approving_create_appends_first_current_version() {
        let backend = InMemoryWorkflowBackend::default();
        let tenant = TenantId("pc-1".to_string());
        let id = backend
            .create_approval_request(&tenant, &UserId("maker".to_string()), cap_create("cap-1"))
            .await
            .expect("create");

        backend
            .process_approval_request(
                &tenant,
                &UserId("checker".to_string()),
                ProcessApproval { request_id: id.clone(), action: ApprovalAction::Approve, comment: None },
            )
            .await
            .expect("approve");

        let versions = backend.list_versions(&tenant, Module::EsgCap, "cap-1").await.expect("list");
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version_number, 1);
        assert!(versions[0].is_current);
        assert_eq!(versions[0].approval_request_id, Some(id));
        assert_eq!(versions[0].data.get("budget"), Some(&json!(120000)));
    }
}
