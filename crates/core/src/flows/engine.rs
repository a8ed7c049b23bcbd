use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::approval::{ApprovalStatus, RecordType};
use crate::flows::states::{ApprovalEvent, FlowAction, FlowContext, TransitionOutcome};

pub trait FlowDefinition {
    fn initial_state(&self) -> ApprovalStatus;
    fn transition(
        &self,
        current: ApprovalStatus,
        event: ApprovalEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>;
}

/// Dual-control review: a maker submits, a checker decides.
#[derive(Clone, Debug, Default)]
pub struct MakerCheckerFlow;

impl FlowDefinition for MakerCheckerFlow {
    fn initial_state(&self) -> ApprovalStatus {
        ApprovalStatus::PendingReview
    }

    fn transition(
        &self,
        current: ApprovalStatus,
        event: ApprovalEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        transition_maker_checker(current, event, context)
    }
}

pub struct FlowEngine<F> {
    flow: F,
}

impl<F> FlowEngine<F>
where
    F: FlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn initial_state(&self) -> ApprovalStatus {
        self.flow.initial_state()
    }

    pub fn apply(
        &self,
        current: ApprovalStatus,
        event: ApprovalEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        self.flow.transition(current, event, context)
    }

    pub fn apply_with_audit<S>(
        &self,
        current: ApprovalStatus,
        event: ApprovalEvent,
        context: &FlowContext,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(current, event, context);
        match &result {
            Ok(outcome) => {
                sink.emit(
                    AuditEvent::new(
                        audit.request_id.clone(),
                        audit.tenant_id.clone(),
                        audit.correlation_id.clone(),
                        "approval.transition_validated",
                        AuditCategory::Workflow,
                        audit.actor.clone(),
                        AuditOutcome::Success,
                    )
                    .with_metadata("from", outcome.from.as_str())
                    .with_metadata("to", outcome.to.as_str())
                    .with_metadata("event", format!("{:?}", outcome.event)),
                );
            }
            Err(error) => {
                sink.emit(
                    AuditEvent::new(
                        audit.request_id.clone(),
                        audit.tenant_id.clone(),
                        audit.correlation_id.clone(),
                        "approval.transition_rejected",
                        AuditCategory::Workflow,
                        audit.actor.clone(),
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}

impl Default for FlowEngine<MakerCheckerFlow> {
    fn default() -> Self {
        Self::new(MakerCheckerFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("invalid approval transition from {from:?} using event {event:?}")]
    InvalidTransition { from: ApprovalStatus, event: ApprovalEvent },
}

fn transition_maker_checker(
    current: ApprovalStatus,
    event: ApprovalEvent,
    context: &FlowContext,
) -> Result<TransitionOutcome, FlowTransitionError> {
    use ApprovalEvent::{Approve, AssignChecker, Reject, RequestChange};
    use ApprovalStatus::{Approved, InReview, PendingReview, Rejected};
    use FlowAction::{AppendCurrentVersion, RecordHistory, RetireCurrentVersion};

    let (to, actions) = match (current, event) {
        (PendingReview, AssignChecker) | (InReview, AssignChecker) => {
            (InReview, vec![RecordHistory])
        }
        (PendingReview, Approve) | (InReview, Approve) => {
            let version_action = match context.record_type {
                RecordType::Create | RecordType::Update => AppendCurrentVersion,
                RecordType::Delete => RetireCurrentVersion,
            };
            (Approved, vec![RecordHistory, version_action])
        }
        (PendingReview, Reject) | (InReview, Reject) => (Rejected, vec![RecordHistory]),
        (PendingReview, RequestChange) | (InReview, RequestChange) => {
            (InReview, vec![RecordHistory])
        }
        (Approved, _) | (Rejected, _) => {
            return Err(FlowTransitionError::InvalidTransition { from: current, event });
        }
    };

    Ok(TransitionOutcome { from: current, to, event, actions })
}
