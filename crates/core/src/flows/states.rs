use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::expense::{Expense, ExpenseStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowType {
    ExpenseApproval,
}

/// Expense lifecycle states share their representation with the stored status.
pub type FlowState = ExpenseStatus;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowEvent {
    Submit,
    Approve,
    Reject,
    MarkPaid,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FlowContext {
    pub rejection_reason: Option<String>,
}

impl FlowContext {
    pub fn with_rejection_reason(reason: impl Into<String>) -> Self {
        Self { rejection_reason: Some(reason.into()) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowAction {
    StampSubmission,
    StampApproval,
    StampRejection,
    StampPayment,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: FlowState,
    pub to: FlowState,
    pub event: FlowEvent,
    pub actions: Vec<FlowAction>,
}

impl TransitionOutcome {
    /// Moves `expense` into the target state and records the timestamps the
    /// transition calls for.
    pub fn apply_to(&self, expense: &mut Expense, now: DateTime<Utc>) {
        expense.status = self.to;
        expense.updated_at = now;
        for action in &self.actions {
            match action {
                FlowAction::StampSubmission => expense.submitted_at = Some(now),
                FlowAction::StampApproval => expense.approved_at = Some(now),
                FlowAction::StampRejection => expense.rejected_at = Some(now),
                FlowAction::StampPayment => expense.paid_at = Some(now),
            }
        }
    }
}
