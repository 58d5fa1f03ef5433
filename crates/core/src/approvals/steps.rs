use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::approvals::directory::Directory;
use crate::approvals::ApprovalError;
use crate::domain::expense::{ApprovalDecision, Decision, Expense};
use crate::domain::rule::{ApprovalRule, ApprovalStep, ApproverSpec, RuleId};
use crate::domain::user::{User, UserId};

/// Who the engine is waiting on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NextApprover {
    /// The manager-first gate is still open.
    DirectManager { manager_id: UserId },
    Step { level: u32, approver: ApproverSpec, candidates: Vec<UserId> },
}

impl NextApprover {
    pub fn single_candidate(&self) -> Option<&UserId> {
        match self {
            Self::DirectManager { manager_id } => Some(manager_id),
            Self::Step { candidates, .. } if candidates.len() == 1 => candidates.first(),
            Self::Step { .. } => None,
        }
    }

    pub fn candidates(&self) -> Vec<UserId> {
        match self {
            Self::DirectManager { manager_id } => vec![manager_id.clone()],
            Self::Step { candidates, .. } => candidates.clone(),
        }
    }
}

/// Everything needed to evaluate one expense against its governing rule.
#[derive(Clone, Copy, Debug)]
pub struct ApprovalContext<'a> {
    pub expense: &'a Expense,
    pub owner: &'a User,
    pub rule: &'a ApprovalRule,
    pub directory: &'a Directory,
}

impl<'a> ApprovalContext<'a> {
    /// Returns the direct manager when the manager-first gate applies.
    pub fn manager_gate(&self) -> Option<&'a User> {
        if !(self.owner.is_manager_approver && self.rule.requires_manager_approval_first) {
            return None;
        }
        self.directory.active_manager_of(self.owner)
    }

    pub fn requires_manager_first(&self) -> bool {
        self.manager_gate().is_some()
    }

    /// Decisions that count under the governing rule. Decisions recorded
    /// under another rule stay in the trail but no longer count.
    pub fn counted_decisions(&self) -> impl Iterator<Item = &'a ApprovalDecision> + '_ {
        let current: &'a RuleId = &self.rule.id;
        self.expense.approvals.iter().filter(move |decision| {
            decision.rule_id.as_ref().map_or(true, |rule_id| rule_id == current)
        })
    }

    pub fn counted_approvers(&self) -> impl Iterator<Item = &'a UserId> + '_ {
        self.counted_decisions()
            .filter(|decision| decision.decision == Decision::Approved)
            .map(|decision| &decision.actor_id)
    }

    pub fn has_counted_decision_from(&self, user_id: &UserId) -> bool {
        self.counted_decisions().any(|decision| &decision.actor_id == user_id)
    }

    fn has_counted_approval_from(&self, user_id: &UserId) -> bool {
        self.counted_approvers().any(|actor| actor == user_id)
    }

    /// True once the direct manager has acted, or when no gate applies.
    pub fn is_manager_gate_satisfied(&self) -> bool {
        match self.manager_gate() {
            Some(manager) => self.has_counted_decision_from(&manager.id),
            None => true,
        }
    }

    /// Gate check from the point of view of the user about to act.
    pub fn is_manager_gate_satisfied_for(&self, actor: &UserId) -> bool {
        match self.manager_gate() {
            Some(manager) => &manager.id == actor || self.has_counted_decision_from(&manager.id),
            None => true,
        }
    }

    /// Concrete users who may satisfy `step`. A step whose natural approver
    /// is missing or inactive escalates to the company's active admins.
    pub fn resolve_step(&self, step: &ApprovalStep) -> Result<BTreeSet<UserId>, ApprovalError> {
        let company_id = &self.owner.company_id;
        let mut resolved: BTreeSet<UserId> = match &step.approver {
            ApproverSpec::Manager => {
                self.directory.active_manager_of(self.owner).map(|m| m.id.clone()).into_iter().collect()
            }
            ApproverSpec::Admin => {
                self.directory.active_admins(company_id).into_iter().map(|u| u.id.clone()).collect()
            }
            ApproverSpec::SpecificUser { approver_id } => self
                .directory
                .active_user(approver_id, company_id)
                .map(|u| u.id.clone())
                .into_iter()
                .collect(),
        };
        resolved.remove(&self.owner.id);

        if resolved.is_empty() {
            resolved = self
                .directory
                .active_admins(company_id)
                .into_iter()
                .map(|u| u.id.clone())
                .filter(|id| id != &self.owner.id)
                .collect();
        }

        if resolved.is_empty() {
            return Err(ApprovalError::RuleMisconfigured(format!(
                "step {} of rule `{}` has no eligible approver",
                step.level, self.rule.id
            )));
        }
        Ok(resolved)
    }

    /// A step is satisfied by an approval credited to its level, or once
    /// every user who could approve it has already approved the expense
    /// (the gate manager who is also a later step's only approver, say).
    pub fn is_step_satisfied(&self, step: &ApprovalStep) -> Result<bool, ApprovalError> {
        let credited = self.counted_decisions().any(|decision| {
            decision.decision == Decision::Approved && decision.step_level == Some(step.level)
        });
        if credited {
            return Ok(true);
        }
        let resolved = self.resolve_step(step)?;
        Ok(resolved.iter().all(|user_id| self.has_counted_approval_from(user_id)))
    }

    /// First required step, in level order, that nobody has satisfied yet.
    pub fn next_required_step(&self) -> Result<Option<&'a ApprovalStep>, ApprovalError> {
        for step in &self.rule.steps {
            if step.is_required && !self.is_step_satisfied(step)? {
                return Ok(Some(step));
            }
        }
        Ok(None)
    }

    /// Unsatisfied steps up to and including the next required one. Optional
    /// steps ahead of it may still be acted on.
    pub fn open_steps(&self) -> Result<Vec<&'a ApprovalStep>, ApprovalError> {
        let mut open = Vec::new();
        for step in &self.rule.steps {
            if self.is_step_satisfied(step)? {
                continue;
            }
            open.push(step);
            if step.is_required {
                break;
            }
        }
        Ok(open)
    }

    pub fn next_required_approver(&self) -> Result<Option<NextApprover>, ApprovalError> {
        if let Some(manager) = self.manager_gate() {
            if !self.has_counted_decision_from(&manager.id) {
                return Ok(Some(NextApprover::DirectManager { manager_id: manager.id.clone() }));
            }
        }

        let Some(step) = self.next_required_step()? else {
            return Ok(None);
        };
        let candidates = self.resolve_step(step)?;
        Ok(Some(NextApprover::Step {
            level: step.level,
            approver: step.approver.clone(),
            candidates: candidates.into_iter().collect(),
        }))
    }

    /// Distinct users eligible under the rule; the denominator for
    /// percentage approval.
    pub fn eligible_pool(&self) -> Result<BTreeSet<UserId>, ApprovalError> {
        let mut pool = BTreeSet::new();
        for step in &self.rule.steps {
            pool.extend(self.resolve_step(step)?);
        }
        if let Some(manager) = self.manager_gate() {
            pool.insert(manager.id.clone());
        }
        Ok(pool)
    }

    pub fn sequential_complete(&self) -> Result<bool, ApprovalError> {
        Ok(self.is_manager_gate_satisfied() && self.next_required_step()?.is_none())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{ApprovalContext, NextApprover};
    use crate::approvals::directory::Directory;
    use crate::approvals::test_support::{approval, expense, rule_with_steps, step, user};
    use crate::approvals::ApprovalError;
    use crate::domain::rule::ApproverSpec;
    use crate::domain::user::{UserId, UserRole};

    fn directory(employee_is_gated: bool) -> Directory {
        let mut employee = user("u-emp", UserRole::Employee, Some("u-mgr"));
        employee.is_manager_approver = employee_is_gated;
        Directory::new([
            employee,
            user("u-mgr", UserRole::Manager, None),
            user("u-admin", UserRole::Admin, None),
            user("u-admin-2", UserRole::Admin, None),
        ])
    }

    fn id(value: &str) -> UserId {
        UserId(value.to_string())
    }

    #[test]
    fn gate_requires_owner_flag_and_rule_flag() {
        let rule = rule_with_steps(vec![step(1, ApproverSpec::Admin, true)]);
        let expense = expense("u-emp", Decimal::new(1_000, 0));

        let gated = directory(true);
        let owner = gated.get(&id("u-emp")).expect("owner");
        let context = ApprovalContext { expense: &expense, owner, rule: &rule, directory: &gated };
        assert!(context.requires_manager_first());
        assert!(!context.is_manager_gate_satisfied());
        assert!(context.is_manager_gate_satisfied_for(&id("u-mgr")));
        assert!(!context.is_manager_gate_satisfied_for(&id("u-admin")));

        let mut relaxed = rule.clone();
        relaxed.requires_manager_approval_first = false;
        let context = ApprovalContext { rule: &relaxed, ..context };
        assert!(!context.requires_manager_first());

        let ungated = directory(false);
        let owner = ungated.get(&id("u-emp")).expect("owner");
        let context = ApprovalContext { expense: &expense, owner, rule: &rule, directory: &ungated };
        assert!(context.is_manager_gate_satisfied());
    }

    #[test]
    fn gate_is_vacuous_without_a_manager() {
        let mut orphan = user("u-orphan", UserRole::Employee, None);
        orphan.is_manager_approver = true;
        let directory = Directory::new([orphan.clone(), user("u-admin", UserRole::Admin, None)]);
        let rule = rule_with_steps(vec![step(1, ApproverSpec::Admin, true)]);
        let expense = expense("u-orphan", Decimal::new(10, 0));

        let context =
            ApprovalContext { expense: &expense, owner: &orphan, rule: &rule, directory: &directory };
        assert!(!context.requires_manager_first());
        assert!(context.is_manager_gate_satisfied());
    }

    #[test]
    fn next_required_approver_walks_levels_in_order() {
        let directory = directory(false);
        let owner = directory.get(&id("u-emp")).expect("owner");
        let rule = rule_with_steps(vec![
            step(2, ApproverSpec::Admin, true),
            step(1, ApproverSpec::Manager, true),
        ]);
        let mut expense = expense("u-emp", Decimal::new(1_000, 0));

        let context = ApprovalContext { expense: &expense, owner, rule: &rule, directory: &directory };
        assert_eq!(
            context.next_required_approver().expect("resolve"),
            Some(NextApprover::Step {
                level: 1,
                approver: ApproverSpec::Manager,
                candidates: vec![id("u-mgr")],
            })
        );

        expense.approvals.push(approval("u-mgr", Some(1)));
        let context = ApprovalContext { expense: &expense, owner, rule: &rule, directory: &directory };
        let next = context.next_required_approver().expect("resolve").expect("admin step");
        assert_eq!(next.candidates(), vec![id("u-admin"), id("u-admin-2")]);
        assert!(next.single_candidate().is_none());

        expense.approvals.push(approval("u-admin", Some(2)));
        let context = ApprovalContext { expense: &expense, owner, rule: &rule, directory: &directory };
        assert_eq!(context.next_required_approver().expect("resolve"), None);
        assert!(context.sequential_complete().expect("walk"));
    }

    #[test]
    fn optional_steps_do_not_block_and_stay_open() {
        let directory = directory(false);
        let owner = directory.get(&id("u-emp")).expect("owner");
        let rule = rule_with_steps(vec![
            step(1, ApproverSpec::Manager, false),
            step(2, ApproverSpec::Admin, true),
        ]);
        let expense = expense("u-emp", Decimal::new(1_000, 0));
        let context = ApprovalContext { expense: &expense, owner, rule: &rule, directory: &directory };

        assert_eq!(context.next_required_step().expect("walk").map(|s| s.level), Some(2));
        let open: Vec<u32> =
            context.open_steps().expect("walk").iter().map(|s| s.level).collect();
        assert_eq!(open, vec![1, 2]);
    }

    #[test]
    fn inactive_specific_user_escalates_to_admins() {
        let mut cfo = user("u-cfo", UserRole::Manager, None);
        cfo.is_active = false;
        let employee = user("u-emp", UserRole::Employee, None);
        let directory =
            Directory::new([cfo, employee.clone(), user("u-admin", UserRole::Admin, None)]);
        let specific = step(1, ApproverSpec::SpecificUser { approver_id: id("u-cfo") }, true);
        let rule = rule_with_steps(vec![specific.clone()]);
        let expense = expense("u-emp", Decimal::new(1_000, 0));
        let context =
            ApprovalContext { expense: &expense, owner: &employee, rule: &rule, directory: &directory };

        let resolved = context.resolve_step(&specific).expect("escalated");
        assert_eq!(resolved.into_iter().collect::<Vec<_>>(), vec![id("u-admin")]);
    }

    #[test]
    fn owner_is_never_their_own_approver() {
        let admin = user("u-admin", UserRole::Admin, None);
        let directory = Directory::new([admin.clone()]);
        let admin_step = step(1, ApproverSpec::Admin, true);
        let rule = rule_with_steps(vec![admin_step.clone()]);
        let expense = expense("u-admin", Decimal::new(1_000, 0));
        let context =
            ApprovalContext { expense: &expense, owner: &admin, rule: &rule, directory: &directory };

        let error = context.resolve_step(&admin_step).expect_err("nobody left");
        assert!(matches!(error, ApprovalError::RuleMisconfigured(_)));
    }

    #[test]
    fn eligible_pool_unions_every_step() {
        let directory = directory(true);
        let owner = directory.get(&id("u-emp")).expect("owner");
        let rule = rule_with_steps(vec![
            step(1, ApproverSpec::Manager, true),
            step(2, ApproverSpec::Admin, true),
        ]);
        let expense = expense("u-emp", Decimal::new(1_000, 0));
        let context = ApprovalContext { expense: &expense, owner, rule: &rule, directory: &directory };

        let pool = context.eligible_pool().expect("pool");
        assert_eq!(pool.len(), 3);
        assert!(pool.contains(&id("u-mgr")));
    }
}
