use std::collections::BTreeSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::approvals::steps::ApprovalContext;
use crate::approvals::{ApprovalError, ApprovalResolution};
use crate::domain::expense::Decision;
use crate::domain::user::UserId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConditionalOutcome {
    Unresolved,
    Approved { resolution: ApprovalResolution },
    Rejected,
}

impl ConditionalOutcome {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Unresolved)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PercentageProgress {
    pub approved: usize,
    pub eligible: usize,
    pub percentage: Decimal,
    pub threshold: Decimal,
}

impl PercentageProgress {
    pub fn is_reached(&self) -> bool {
        self.eligible > 0 && self.percentage >= self.threshold
    }
}

/// Share of the eligible pool that has approved so far, if the rule
/// carries a percentage threshold.
pub fn percentage_progress(
    context: &ApprovalContext<'_>,
) -> Result<Option<PercentageProgress>, ApprovalError> {
    let Some(threshold) =
        context.rule.conditional.as_ref().and_then(|conditional| conditional.approval_percentage())
    else {
        return Ok(None);
    };

    let pool = context.eligible_pool()?;
    let approvers: BTreeSet<&UserId> =
        context.counted_approvers().filter(|actor| pool.contains(*actor)).collect();

    let percentage = if pool.is_empty() {
        Decimal::ZERO
    } else {
        Decimal::from(approvers.len() as u64) * Decimal::ONE_HUNDRED
            / Decimal::from(pool.len() as u64)
    };

    Ok(Some(PercentageProgress {
        approved: approvers.len(),
        eligible: pool.len(),
        percentage,
        threshold,
    }))
}

/// Resolves the expense through the rule's conditional block, ahead of
/// the sequential walk. Any recorded rejection wins.
pub fn evaluate_conditional(
    context: &ApprovalContext<'_>,
) -> Result<ConditionalOutcome, ApprovalError> {
    if context.expense.approvals.iter().any(|decision| decision.decision == Decision::Rejected) {
        return Ok(ConditionalOutcome::Rejected);
    }

    let Some(conditional) = &context.rule.conditional else {
        return Ok(ConditionalOutcome::Unresolved);
    };

    if conditional.resolves_on_specific_approval()
        && context.counted_approvers().any(|actor| conditional.is_specific_approver(actor))
    {
        return Ok(ConditionalOutcome::Approved {
            resolution: ApprovalResolution::SpecificApprover,
        });
    }

    if percentage_progress(context)?.is_some_and(|progress| progress.is_reached()) {
        return Ok(ConditionalOutcome::Approved {
            resolution: ApprovalResolution::PercentageReached,
        });
    }

    Ok(ConditionalOutcome::Unresolved)
}
