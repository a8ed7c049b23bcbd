use async_trait::async_trait;

use crate::domain::approval::{
    ApprovalHistoryEntry, ApprovalId, ApprovalRequest, NewApprovalRequest, ProcessApproval,
    RequestFilter,
};
use crate::domain::module::Module;
use crate::domain::session::{TenantId, UserId};
use crate::domain::version::VersionRecord;
use crate::errors::ApplicationError;

/// Remote side of the approval workflow.
///
/// Every call is scoped to one tenant. Implementations own the authoritative
/// transition check: `process_approval_request` and `assign_checker` must only
/// update a row whose stored status still permits the event, and version
/// promotion must leave at most one current version per record.
#[async_trait]
pub trait WorkflowBackend: Send + Sync {
    async fn list_requests(
        &self,
        tenant: &TenantId,
        filter: &RequestFilter,
    ) -> Result<Vec<ApprovalRequest>, ApplicationError>;

    async fn find_request(
        &self,
        tenant: &TenantId,
        id: &ApprovalId,
    ) -> Result<Option<ApprovalRequest>, ApplicationError>;

    async fn create_approval_request(
        &self,
        tenant: &TenantId,
        maker: &UserId,
        request: NewApprovalRequest,
    ) -> Result<ApprovalId, ApplicationError>;

    async fn process_approval_request(
        &self,
        tenant: &TenantId,
        actor: &UserId,
        command: ProcessApproval,
    ) -> Result<ApprovalRequest, ApplicationError>;

    async fn assign_checker(
        &self,
        tenant: &TenantId,
        actor: &UserId,
        id: &ApprovalId,
        checker: &UserId,
    ) -> Result<(), ApplicationError>;

    async fn list_history(
        &self,
        tenant: &TenantId,
        id: &ApprovalId,
    ) -> Result<Vec<ApprovalHistoryEntry>, ApplicationError>;

    async fn list_versions(
        &self,
        tenant: &TenantId,
        module: Module,
        record_id: &str,
    ) -> Result<Vec<VersionRecord>, ApplicationError>;

    /// Open requests (`pending_review`/`in_review`) that carry a deadline.
    async fn list_open_with_due(
        &self,
        tenant: &TenantId,
    ) -> Result<Vec<ApprovalRequest>, ApplicationError>;
}
