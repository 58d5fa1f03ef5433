pub mod engine;
pub mod states;

pub use engine::{ExpenseFlow, FlowDefinition, FlowEngine, FlowTransitionError};
pub use states::{FlowAction, FlowContext, FlowEvent, FlowState, FlowType, TransitionOutcome};
