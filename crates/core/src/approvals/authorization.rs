use serde::{Deserialize, Serialize};

use crate::approvals::steps::ApprovalContext;
use crate::approvals::ApprovalError;
use crate::domain::rule::ApproverSpec;
use crate::domain::user::{User, UserId};

/// Why an actor may act on the expense.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Grant {
    /// The actor belongs to the resolved approver set of an open step.
    Step { level: u32 },
    /// The actor is a specific approver whose approval resolves the expense.
    SpecificApprover,
    /// The actor is a specific approver standing in for the current step.
    StandIn { level: u32 },
    /// The actor is in the eligible pool of a percentage rule.
    Vote,
    /// The direct manager clearing the manager-first gate.
    ManagerGate,
}

impl Grant {
    pub fn step_level(&self) -> Option<u32> {
        match self {
            Self::Step { level } | Self::StandIn { level } => Some(*level),
            Self::SpecificApprover | Self::Vote | Self::ManagerGate => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthorizationFailure {
    OwnExpense,
    InactiveActor,
    OtherCompany,
    AlreadyDecided,
    ManagerFirst { manager_id: UserId },
    NotAnApprover,
}

impl AuthorizationFailure {
    pub fn reason(&self) -> String {
        match self {
            Self::OwnExpense => "users cannot approve or reject their own expenses".to_string(),
            Self::InactiveActor => "inactive users cannot act on expenses".to_string(),
            Self::OtherCompany => "expense belongs to another company".to_string(),
            Self::AlreadyDecided => "a decision from this user is already recorded".to_string(),
            Self::ManagerFirst { manager_id } => format!(
                "requires approval from the employee's direct manager first (`{manager_id}`)"
            ),
            Self::NotAnApprover => {
                "user is not an approver for the current approval step".to_string()
            }
        }
    }
}

impl From<AuthorizationFailure> for ApprovalError {
    fn from(value: AuthorizationFailure) -> Self {
        ApprovalError::Unauthorized(value.reason())
    }
}

/// Single authorization predicate over `(actor, expense, rule step)`.
pub fn authorize(
    context: &ApprovalContext<'_>,
    actor: &User,
) -> Result<Result<Grant, AuthorizationFailure>, ApprovalError> {
    if actor.id == context.expense.owner_id {
        return Ok(Err(AuthorizationFailure::OwnExpense));
    }
    if !actor.is_active {
        return Ok(Err(AuthorizationFailure::InactiveActor));
    }
    if actor.company_id != context.expense.company_id {
        return Ok(Err(AuthorizationFailure::OtherCompany));
    }
    if context.has_counted_decision_from(&actor.id) {
        return Ok(Err(AuthorizationFailure::AlreadyDecided));
    }

    let gate = context.manager_gate();
    let gate_pending = gate.is_some_and(|manager| !context.has_counted_decision_from(&manager.id));
    if let Some(manager) = gate.filter(|_| gate_pending) {
        if manager.id != actor.id {
            return Ok(Err(AuthorizationFailure::ManagerFirst { manager_id: manager.id.clone() }));
        }
    }

    for step in context.open_steps()? {
        if context.resolve_step(step)?.contains(&actor.id) {
            return Ok(Ok(Grant::Step { level: step.level }));
        }
    }

    if let Some(conditional) = &context.rule.conditional {
        if conditional.is_specific_approver(&actor.id) {
            if conditional.resolves_on_specific_approval() {
                return Ok(Ok(Grant::SpecificApprover));
            }
            // A named step is satisfied only by the named approver.
            let stand_in = context.next_required_step()?.filter(|step| {
                !matches!(step.approver, ApproverSpec::SpecificUser { .. })
            });
            if let Some(step) = stand_in {
                return Ok(Ok(Grant::StandIn { level: step.level }));
            }
        }

        if conditional.approval_percentage().is_some()
            && context.eligible_pool()?.contains(&actor.id)
        {
            return Ok(Ok(Grant::Vote));
        }
    }

    if gate_pending {
        return Ok(Ok(Grant::ManagerGate));
    }

    Ok(Err(AuthorizationFailure::NotAnApprover))
}
