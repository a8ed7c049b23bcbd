use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use uuid::Uuid;

use esgflow_core::domain::approval::{
    ApprovalHistoryEntry, ApprovalId, ApprovalRequest, ApprovalStatus, HistoryAction,
    NewApprovalRequest,
};
use esgflow_core::domain::session::{TenantId, UserId};
use esgflow_core::errors::ApplicationError;
use esgflow_core::flows::FlowTransitionError;
use esgflow_core::sla::SlaPolicy;

pub mod memory;
pub mod workflow;

pub use memory::InMemoryWorkflowBackend;
pub use workflow::SqlWorkflowBackend;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Transition(#[from] FlowTransitionError),
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::NotFound(what) => Self::NotFound(what),
            RepositoryError::Transition(error) => error.into(),
            other => Self::Persistence(other.to_string()),
        }
    }
}

/// Stored form of every timestamp: fixed-width UTC so text order is time order.
pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str, field: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("{field}: {error}")))
}

pub(crate) fn not_found(id: &ApprovalId) -> RepositoryError {
    RepositoryError::NotFound(format!("approval request `{}`", id.0))
}

/// Row written by the create procedure: fresh id, initial status, SLA deadline.
pub(crate) fn submitted_request(
    tenant: &TenantId,
    maker: &UserId,
    input: NewApprovalRequest,
    initial_status: ApprovalStatus,
    policy: &SlaPolicy,
    now: DateTime<Utc>,
) -> ApprovalRequest {
    let priority = input.priority.unwrap_or_default();
    ApprovalRequest {
        id: ApprovalId(Uuid::new_v4().to_string()),
        tenant_id: tenant.clone(),
        module: input.module,
        record_id: input.record_id,
        record_type: input.record_type,
        current_data: input.current_data,
        previous_data: input.previous_data,
        change_summary: input.change_summary,
        status: initial_status,
        maker_id: maker.clone(),
        assigned_checker_id: None,
        priority,
        due_at: Some(policy.due_at(priority, now)),
        materiality_flag: input.materiality_flag.unwrap_or(false),
        checker_comment: None,
        reviewed_at: None,
        created_at: now,
        updated_at: now,
    }
}

pub(crate) fn history_entry(
    request_id: &ApprovalId,
    action: HistoryAction,
    from_status: Option<ApprovalStatus>,
    to_status: ApprovalStatus,
    actor: &UserId,
    comment: Option<String>,
    now: DateTime<Utc>,
) -> ApprovalHistoryEntry {
    ApprovalHistoryEntry {
        id: Uuid::new_v4().to_string(),
        request_id: request_id.clone(),
        action,
        from_status,
        to_status,
        actor_id: actor.clone(),
        comment,
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use esgflow_core::domain::approval::{ApprovalId, ApprovalStatus};
    use esgflow_core::errors::{ApplicationError, DomainError};
    use esgflow_core::flows::{ApprovalEvent, FlowTransitionError};

    use super::{format_timestamp, parse_timestamp, RepositoryError};

    #[test]
    fn timestamps_are_fixed_width_and_parse_back() {
        let early = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 11, 2, 3, 4, 5).unwrap();

        let early_text = format_timestamp(early);
        assert_eq!(early_text, "2026-01-02T03:04:05.000000Z");
        assert!(early_text < format_timestamp(late));
        assert_eq!(parse_timestamp(&early_text, "created_at").unwrap(), early);
        assert!(matches!(
            parse_timestamp("yesterday", "created_at"),
            Err(RepositoryError::Decode(message)) if message.starts_with("created_at")
        ));
    }

    #[test]
    fn repository_errors_map_onto_application_errors() {
        let missing: ApplicationError =
            super::not_found(&ApprovalId("apr-1".to_string())).into();
        assert_eq!(missing, ApplicationError::NotFound("approval request `apr-1`".to_string()));

        let transition = FlowTransitionError::InvalidTransition {
            from: ApprovalStatus::Approved,
            event: ApprovalEvent::Reject,
        };
        let mapped: ApplicationError = RepositoryError::from(transition.clone()).into();
        assert_eq!(mapped, ApplicationError::Domain(DomainError::FlowTransition(transition)));

        let decode: ApplicationError = RepositoryError::Decode("bad row".to_string()).into();
        assert!(matches!(decode, ApplicationError::Persistence(message) if message.contains("bad row")));
    }
}
