pub mod engine;
pub mod states;

pub use engine::{FlowDefinition, FlowEngine, FlowTransitionError, MakerCheckerFlow};
pub use states::{ApprovalEvent, FlowAction, FlowContext, TransitionOutcome};
