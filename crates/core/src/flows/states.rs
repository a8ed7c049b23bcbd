use serde::{Deserialize, Serialize};

use crate::domain::approval::{ApprovalAction, ApprovalStatus, HistoryAction, RecordType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalEvent {
    AssignChecker,
    Approve,
    Reject,
    RequestChange,
}

impl From<ApprovalAction> for ApprovalEvent {
    fn from(action: ApprovalAction) -> Self {
        match action {
            ApprovalAction::Approve => Self::Approve,
            ApprovalAction::Reject => Self::Reject,
            ApprovalAction::RequestChange => Self::RequestChange,
        }
    }
}

impl From<ApprovalEvent> for HistoryAction {
    fn from(event: ApprovalEvent) -> Self {
        match event {
            ApprovalEvent::AssignChecker => Self::AssignChecker,
            ApprovalEvent::Approve => Self::Approve,
            ApprovalEvent::Reject => Self::Reject,
            ApprovalEvent::RequestChange => Self::RequestChange,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowContext {
    pub record_type: RecordType,
}

/// Side effects the backend must apply together with the status change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowAction {
    RecordHistory,
    AppendCurrentVersion,
    RetireCurrentVersion,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: ApprovalStatus,
    pub to: ApprovalStatus,
    pub event: ApprovalEvent,
    pub actions: Vec<FlowAction>,
}
