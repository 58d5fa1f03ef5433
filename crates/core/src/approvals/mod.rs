//! Approval-rule evaluation: which rule governs an expense, who must act
//! next, whether an actor may act, and how each decision moves the expense
//! through its lifecycle.

pub mod authorization;
pub mod conditional;
pub mod directory;
pub mod engine;
pub mod selection;
pub mod steps;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::expense::{ExpenseId, ExpenseStatus};
use crate::domain::rule::RuleValidationError;
use crate::flows::FlowTransitionError;

pub use authorization::{authorize, AuthorizationFailure, Grant};
pub use conditional::{evaluate_conditional, percentage_progress, ConditionalOutcome, PercentageProgress};
pub use directory::Directory;
pub use engine::{ApprovalEngine, ApprovalPlan, ApprovalStatus, DecisionOutcome, DecisionRequest};
pub use selection::{fallback_rule, select_applicable_rule, NoRulePolicy, FALLBACK_RULE_ID};
pub use steps::{ApprovalContext, NextApprover};

/// How an approved expense got there.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalResolution {
    SequentialComplete,
    PercentageReached,
    SpecificApprover,
    NoRulePolicy,
}

impl ApprovalResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SequentialComplete => "sequential_complete",
            Self::PercentageReached => "percentage_reached",
            Self::SpecificApprover => "specific_approver",
            Self::NoRulePolicy => "no_rule_policy",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("{entity} `{id}` was not found")]
    NotFound { entity: &'static str, id: String },
    #[error("expense `{expense_id}` is {status} and no longer pending approval")]
    NotPendingApproval { expense_id: ExpenseId, status: ExpenseStatus },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("a non-empty rejection reason is required")]
    MissingReason,
    #[error("approval rule misconfigured: {0}")]
    RuleMisconfigured(String),
    #[error(transparent)]
    InvalidTransition(FlowTransitionError),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl ApprovalError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    /// Stable identifier returned to API callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::NotPendingApproval { .. } => "not_pending_approval",
            Self::Unauthorized(_) => "unauthorized",
            Self::MissingReason => "missing_reason",
            Self::RuleMisconfigured(_) => "rule_misconfigured",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::Persistence(_) => "persistence",
        }
    }
}

impl From<RuleValidationError> for ApprovalError {
    fn from(value: RuleValidationError) -> Self {
        Self::RuleMisconfigured(value.to_string())
    }
}

impl From<FlowTransitionError> for ApprovalError {
    fn from(value: FlowTransitionError) -> Self {
        match value {
            FlowTransitionError::MissingRejectionReason { .. } => Self::MissingReason,
            other @ FlowTransitionError::InvalidTransition { .. } => Self::InvalidTransition(other),
        }
    }
}
