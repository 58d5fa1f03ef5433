use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::expense::ExpenseStatus;
use crate::flows::states::{
    FlowAction, FlowContext, FlowEvent, FlowState, FlowType, TransitionOutcome,
};

pub trait FlowDefinition {
    fn flow_type(&self) -> FlowType;
    fn initial_state(&self) -> FlowState;
    fn transition(
        &self,
        current: &FlowState,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>;
}

#[derive(Clone, Debug, Default)]
pub struct ExpenseFlow;

impl FlowDefinition for ExpenseFlow {
    fn flow_type(&self) -> FlowType {
        FlowType::ExpenseApproval
    }

    fn initial_state(&self) -> FlowState {
        FlowState::Draft
    }

    fn transition(
        &self,
        current: &FlowState,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        transition_expense(current, event, context)
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

    pub fn flow_type(&self) -> FlowType {
        self.flow.flow_type()
    }

    pub fn initial_state(&self) -> FlowState {
        self.flow.initial_state()
    }

    pub fn apply(
        &self,
        current: &FlowState,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        self.flow.transition(current, event, context)
    }

    pub fn apply_with_audit<S>(
        &self,
        current: &FlowState,
        event: &FlowEvent,
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
                        audit.expense_id.clone(),
                        audit.correlation_id.clone(),
                        "flow.transition_applied",
                        AuditCategory::Flow,
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
                        audit.expense_id.clone(),
                        audit.correlation_id.clone(),
                        "flow.transition_rejected",
                        AuditCategory::Flow,
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

impl Default for FlowEngine<ExpenseFlow> {
    fn default() -> Self {
        Self::new(ExpenseFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("rejecting from {state} requires a non-empty reason")]
    MissingRejectionReason { state: FlowState },
    #[error("invalid transition from {state} using event {event:?}")]
    InvalidTransition { state: FlowState, event: FlowEvent },
}

fn transition_expense(
    current: &FlowState,
    event: &FlowEvent,
    context: &FlowContext,
) -> Result<TransitionOutcome, FlowTransitionError> {
    use FlowAction::{StampApproval, StampPayment, StampRejection, StampSubmission};
    use FlowEvent::{Approve, MarkPaid, Reject, Submit};
    use ExpenseStatus::{Approved, Draft, Paid, PendingApproval, Rejected};

    let (to, actions) = match (current, event) {
        (Draft, Submit) => (PendingApproval, vec![StampSubmission]),
        (PendingApproval, Approve) => (Approved, vec![StampApproval]),
        (PendingApproval, Reject) => {
            let has_reason =
                context.rejection_reason.as_deref().is_some_and(|reason| !reason.trim().is_empty());
            if !has_reason {
                return Err(FlowTransitionError::MissingRejectionReason { state: *current });
            }
            (Rejected, vec![StampRejection])
        }
        (Approved, MarkPaid) => (Paid, vec![StampPayment]),
        _ => {
            return Err(FlowTransitionError::InvalidTransition { state: *current, event: *event });
        }
    };

    Ok(TransitionOutcome { from: *current, to, event: *event, actions })
}
