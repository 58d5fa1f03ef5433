use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::approvals::authorization::{authorize, Grant};
use crate::approvals::conditional::{evaluate_conditional, ConditionalOutcome};
use crate::approvals::directory::Directory;
use crate::approvals::selection::{fallback_rule, select_applicable_rule, NoRulePolicy};
use crate::approvals::steps::{ApprovalContext, NextApprover};
use crate::approvals::{ApprovalError, ApprovalResolution};
use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::expense::{ApprovalDecision, Decision, Expense};
use crate::domain::rule::ApprovalRule;
use crate::domain::user::User;
use crate::flows::{ExpenseFlow, FlowContext, FlowEngine, FlowEvent};

/// Rule governing an expense, or the decision to skip approval entirely.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApprovalPlan {
    Rule { rule: ApprovalRule, fallback: bool },
    AutoApprove,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending { next: Option<NextApprover> },
    Approved { resolution: ApprovalResolution },
    Rejected,
}

/// Input for one approve or reject action.
#[derive(Clone, Copy, Debug)]
pub struct DecisionRequest<'a> {
    pub expense: &'a Expense,
    pub owner: &'a User,
    pub actor: &'a User,
    /// Active rules of the expense's company.
    pub rules: &'a [ApprovalRule],
    pub directory: &'a Directory,
    /// Approval notes, or the rejection reason.
    pub text: Option<&'a str>,
    pub now: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DecisionOutcome {
    /// Expense with the decision appended and status fields stamped. The
    /// stored version is left for the repository to advance.
    pub expense: Expense,
    pub decision: ApprovalDecision,
    pub status: ApprovalStatus,
}

pub struct ApprovalEngine {
    policy: NoRulePolicy,
    flow: FlowEngine<ExpenseFlow>,
}

impl Default for ApprovalEngine {
    fn default() -> Self {
        Self::new(NoRulePolicy::default())
    }
}

impl ApprovalEngine {
    pub fn new(policy: NoRulePolicy) -> Self {
        Self { policy, flow: FlowEngine::default() }
    }

    pub fn policy(&self) -> NoRulePolicy {
        self.policy
    }

    pub fn plan(
        &self,
        owner: &User,
        rules: &[ApprovalRule],
        amount_in_base_currency: Decimal,
        directory: &Directory,
        now: DateTime<Utc>,
    ) -> Result<ApprovalPlan, ApprovalError> {
        if let Some(rule) = select_applicable_rule(rules, &owner.company_id, amount_in_base_currency)
        {
            return Ok(ApprovalPlan::Rule { rule: rule.clone(), fallback: false });
        }

        match self.policy {
            NoRulePolicy::DefaultApprover => Ok(ApprovalPlan::Rule {
                rule: fallback_rule(owner, directory, now),
                fallback: true,
            }),
            NoRulePolicy::AutoApprove => Ok(ApprovalPlan::AutoApprove),
            NoRulePolicy::Reject => Err(ApprovalError::RuleMisconfigured(format!(
                "no active approval rule applies to amount {amount_in_base_currency} in company `{}`",
                owner.company_id
            ))),
        }
    }

    /// Moves a draft into `pending_approval`, or straight to `approved`
    /// when the no-rule policy auto-approves.
    #[allow(clippy::too_many_arguments)]
    pub fn submit<S>(
        &self,
        mut expense: Expense,
        owner: &User,
        rules: &[ApprovalRule],
        directory: &Directory,
        now: DateTime<Utc>,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<(Expense, ApprovalStatus), ApprovalError>
    where
        S: AuditSink + ?Sized,
    {
        let plan = self.plan(owner, rules, expense.amount_in_base_currency, directory, now)?;
        let submitted = self.flow.apply_with_audit(
            &expense.status,
            &FlowEvent::Submit,
            &FlowContext::default(),
            sink,
            audit,
        )?;
        submitted.apply_to(&mut expense, now);

        let status = match plan {
            ApprovalPlan::AutoApprove => {
                let approved = self.flow.apply_with_audit(
                    &expense.status,
                    &FlowEvent::Approve,
                    &FlowContext::default(),
                    sink,
                    audit,
                )?;
                approved.apply_to(&mut expense, now);
                expense.approval_notes =
                    Some("approved automatically: no approval rule applies".to_string());
                expense.current_approver = None;
                ApprovalStatus::Approved { resolution: ApprovalResolution::NoRulePolicy }
            }
            ApprovalPlan::Rule { rule, fallback } => {
                let context =
                    ApprovalContext { expense: &expense, owner, rule: &rule, directory };
                let next = context.next_required_approver()?;
                expense.current_approver = next.as_ref().and_then(|n| n.single_candidate()).cloned();
                sink.emit(
                    AuditEvent::from_context(
                        audit,
                        "expense.routed",
                        AuditCategory::Rule,
                        AuditOutcome::Success,
                    )
                    .with_metadata("rule_id", rule.id.0.clone())
                    .with_metadata("fallback", fallback.to_string()),
                );
                ApprovalStatus::Pending { next }
            }
        };

        Ok((expense, status))
    }

    /// Who the expense is waiting on, for display.
    pub fn next_approver(
        &self,
        expense: &Expense,
        owner: &User,
        rules: &[ApprovalRule],
        directory: &Directory,
        now: DateTime<Utc>,
    ) -> Result<Option<NextApprover>, ApprovalError> {
        if !expense.is_pending() {
            return Ok(None);
        }
        let rule = self.decision_rule(owner, rules, expense, directory, now)?;
        ApprovalContext { expense, owner, rule: &rule, directory }.next_required_approver()
    }

    pub fn approve<S>(
        &self,
        request: DecisionRequest<'_>,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<DecisionOutcome, ApprovalError>
    where
        S: AuditSink + ?Sized,
    {
        self.decide(request, Decision::Approved, sink, audit)
    }

    pub fn reject<S>(
        &self,
        request: DecisionRequest<'_>,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<DecisionOutcome, ApprovalError>
    where
        S: AuditSink + ?Sized,
    {
        self.decide(request, Decision::Rejected, sink, audit)
    }

    /// Admin-only `approved -> paid`.
    pub fn mark_paid<S>(
        &self,
        expense: &Expense,
        actor: &User,
        now: DateTime<Utc>,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<Expense, ApprovalError>
    where
        S: AuditSink + ?Sized,
    {
        if !actor.is_active_admin_of(&expense.company_id) {
            return Err(ApprovalError::Unauthorized(
                "only active admins of the company can mark expenses as paid".to_string(),
            ));
        }

        let outcome = self.flow.apply_with_audit(
            &expense.status,
            &FlowEvent::MarkPaid,
            &FlowContext::default(),
            sink,
            audit,
        )?;

        let mut paid = expense.clone();
        outcome.apply_to(&mut paid, now);
        Ok(paid)
    }

    fn decision_rule(
        &self,
        owner: &User,
        rules: &[ApprovalRule],
        expense: &Expense,
        directory: &Directory,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRule, ApprovalError> {
        match self.plan(owner, rules, expense.amount_in_base_currency, directory, now)? {
            ApprovalPlan::Rule { rule, .. } => Ok(rule),
            // Policy switched after submission; someone still has to decide.
            ApprovalPlan::AutoApprove => Ok(fallback_rule(owner, directory, now)),
        }
    }

    fn decide<S>(
        &self,
        request: DecisionRequest<'_>,
        decision: Decision,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<DecisionOutcome, ApprovalError>
    where
        S: AuditSink + ?Sized,
    {
        let DecisionRequest { expense, owner, actor, rules, directory, text, now } = request;

        if !expense.is_pending() {
            return Err(ApprovalError::NotPendingApproval {
                expense_id: expense.id.clone(),
                status: expense.status,
            });
        }

        let text = text.map(str::trim).filter(|value| !value.is_empty()).map(str::to_string);
        if decision == Decision::Rejected && text.is_none() {
            return Err(ApprovalError::MissingReason);
        }

        let rule = self.decision_rule(owner, rules, expense, directory, now)?;

        let context = ApprovalContext { expense, owner, rule: &rule, directory };
        let grant = match authorize(&context, actor)? {
            Ok(grant) => grant,
            Err(failure) => {
                sink.emit(
                    AuditEvent::from_context(
                        audit,
                        "expense.decision.denied",
                        AuditCategory::Approval,
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("reason", failure.reason()),
                );
                return Err(failure.into());
            }
        };

        let recorded = ApprovalDecision {
            actor_id: actor.id.clone(),
            decision,
            step_level: grant.step_level(),
            rule_id: Some(rule.id.clone()),
            notes: text.clone(),
            decided_at: now,
        };

        let mut updated = expense.clone();
        updated.approvals.push(recorded.clone());
        updated.updated_at = now;

        sink.emit(
            AuditEvent::from_context(
                audit,
                "expense.approval.recorded",
                AuditCategory::Approval,
                AuditOutcome::Success,
            )
            .with_metadata("decision", decision.as_str())
            .with_metadata("rule_id", rule.id.0.clone())
            .with_metadata(
                "step_level",
                recorded.step_level.map(|level| level.to_string()).unwrap_or_default(),
            ),
        );

        let status = match decision {
            Decision::Rejected => {
                let flow_context = FlowContext { rejection_reason: text.clone() };
                let outcome = self.flow.apply_with_audit(
                    &updated.status,
                    &FlowEvent::Reject,
                    &flow_context,
                    sink,
                    audit,
                )?;
                outcome.apply_to(&mut updated, now);
                updated.rejection_reason = text;
                updated.current_approver = Some(actor.id.clone());
                ApprovalStatus::Rejected
            }
            Decision::Approved => {
                let resolution = self.resolve_approval(&updated, owner, &rule, directory, grant)?;
                match resolution {
                    Some(resolution) => {
                        let outcome = self.flow.apply_with_audit(
                            &updated.status,
                            &FlowEvent::Approve,
                            &FlowContext::default(),
                            sink,
                            audit,
                        )?;
                        outcome.apply_to(&mut updated, now);
                        updated.approval_notes = text;
                        updated.current_approver = Some(actor.id.clone());
                        ApprovalStatus::Approved { resolution }
                    }
                    None => {
                        let next = ApprovalContext {
                            expense: &updated,
                            owner,
                            rule: &rule,
                            directory,
                        }
                        .next_required_approver()?;
                        updated.current_approver = next
                            .as_ref()
                            .and_then(|n| n.single_candidate())
                            .cloned()
                            .or_else(|| Some(actor.id.clone()));
                        ApprovalStatus::Pending { next }
                    }
                }
            }
        };

        Ok(DecisionOutcome { expense: updated, decision: recorded, status })
    }

    fn resolve_approval(
        &self,
        updated: &Expense,
        owner: &User,
        rule: &ApprovalRule,
        directory: &Directory,
        grant: Grant,
    ) -> Result<Option<ApprovalResolution>, ApprovalError> {
        if grant == Grant::SpecificApprover {
            return Ok(Some(ApprovalResolution::SpecificApprover));
        }

        let context = ApprovalContext { expense: updated, owner, rule, directory };
        match evaluate_conditional(&context)? {
            ConditionalOutcome::Approved { resolution } => return Ok(Some(resolution)),
            ConditionalOutcome::Rejected | ConditionalOutcome::Unresolved => {}
        }

        if context.sequential_complete()? {
            return Ok(Some(ApprovalResolution::SequentialComplete));
        }
        Ok(None)
    }
}
