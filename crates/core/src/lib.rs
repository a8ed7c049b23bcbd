pub mod approvals;
pub mod audit;
pub mod backend;
pub mod config;
pub mod diff;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod sla;
pub mod versions;

pub use approvals::{ApprovalRequestStore, ApprovalStats};
pub use backend::WorkflowBackend;
pub use diff::{calculate_diff, compare_versions, FieldChange, VersionChange};
pub use domain::approval::{
    ApprovalAction, ApprovalHistoryEntry, ApprovalId, ApprovalRequest, ApprovalStatus,
    NewApprovalRequest, Priority, ProcessApproval, RecordType, RequestFilter,
};
pub use domain::module::Module;
pub use domain::session::{AuthenticatedSession, Session, TenantId, UserId};
pub use domain::version::VersionRecord;
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use sla::{SlaAlert, SlaMonitor, SlaMonitorHandle, SlaPolicy, TickOutcome};
pub use versions::{VersionHistoryEntry, VersionHistoryStore};
