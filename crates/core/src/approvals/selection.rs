use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::approvals::directory::Directory;
use crate::domain::rule::{ApprovalRule, ApprovalStep, ApproverSpec, RuleId};
use crate::domain::user::{CompanyId, User, UserId};

pub const FALLBACK_RULE_ID: &str = "default-approver";

/// What happens to an expense when none of the company's rules qualifies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoRulePolicy {
    /// Route to a single approver: the owner's manager, or any admin.
    #[default]
    DefaultApprover,
    /// Approve at submission without any approver.
    AutoApprove,
    /// Refuse the submission as misconfigured.
    Reject,
}

impl NoRulePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DefaultApprover => "default_approver",
            Self::AutoApprove => "auto_approve",
            Self::Reject => "reject",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "default_approver" | "default" => Some(Self::DefaultApprover),
            "auto_approve" => Some(Self::AutoApprove),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

/// Picks the rule governing an expense of `amount` (base currency) in
/// `company_id`: active rules whose threshold is met, highest priority
/// first, then highest `min_amount`, then lowest rule id.
pub fn select_applicable_rule<'a>(
    rules: &'a [ApprovalRule],
    company_id: &CompanyId,
    amount: Decimal,
) -> Option<&'a ApprovalRule> {
    rules
        .iter()
        .filter(|rule| &rule.company_id == company_id && rule.applies_to(amount))
        .min_by(|left, right| precedence(left, right))
}

fn precedence(left: &ApprovalRule, right: &ApprovalRule) -> Ordering {
    right
        .priority
        .cmp(&left.priority)
        .then_with(|| right.min_amount.cmp(&left.min_amount))
        .then_with(|| left.id.cmp(&right.id))
}

/// Single-step rule used under [`NoRulePolicy::DefaultApprover`].
pub fn fallback_rule(owner: &User, directory: &Directory, now: DateTime<Utc>) -> ApprovalRule {
    let approver = if directory.active_manager_of(owner).is_some() {
        ApproverSpec::Manager
    } else {
        ApproverSpec::Admin
    };

    ApprovalRule {
        id: RuleId(FALLBACK_RULE_ID.to_string()),
        company_id: owner.company_id.clone(),
        name: "Default approver".to_string(),
        description: Some("Applied when no configured rule matches the amount".to_string()),
        min_amount: Decimal::ZERO,
        priority: i32::MIN,
        steps: vec![ApprovalStep { level: 1, approver, is_required: true }],
        conditional: None,
        requires_manager_approval_first: true,
        is_active: true,
        created_by: UserId("system".to_string()),
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::{fallback_rule, select_applicable_rule, NoRulePolicy};
    use crate::approvals::directory::Directory;
    use crate::approvals::test_support::{rule, user};
    use crate::domain::rule::ApproverSpec;
    use crate::domain::user::{CompanyId, UserRole};

    fn company() -> CompanyId {
        CompanyId("c-1".to_string())
    }

    #[test]
    fn highest_priority_rule_wins() {
        let rules = vec![rule("R-low", 500, 1), rule("R-high", 100, 9)];

        let selected = select_applicable_rule(&rules, &company(), Decimal::new(1_000, 0));
        assert_eq!(selected.map(|rule| rule.id.0.as_str()), Some("R-high"));
    }

    #[test]
    fn priority_ties_break_on_highest_threshold_then_id() {
        let rules = vec![rule("R-b", 100, 5), rule("R-c", 800, 5), rule("R-a", 800, 5)];

        for _ in 0..3 {
            let selected = select_applicable_rule(&rules, &company(), Decimal::new(900, 0));
            assert_eq!(selected.map(|rule| rule.id.0.as_str()), Some("R-a"));
        }
    }

    #[test]
    fn threshold_is_inclusive_and_inactive_rules_are_ignored() {
        let mut inactive = rule("R-inactive", 0, 100);
        inactive.is_active = false;
        let rules = vec![inactive, rule("R-500", 500, 1)];

        assert_eq!(
            select_applicable_rule(&rules, &company(), Decimal::new(500, 0))
                .map(|rule| rule.id.0.as_str()),
            Some("R-500")
        );
        assert!(select_applicable_rule(&rules, &company(), Decimal::new(49_999, 2)).is_none());
    }

    #[test]
    fn rules_from_other_companies_never_apply() {
        let mut foreign = rule("R-foreign", 0, 50);
        foreign.company_id = CompanyId("c-2".to_string());
        assert!(select_applicable_rule(&[foreign], &company(), Decimal::new(10, 0)).is_none());
    }

    #[test]
    fn fallback_rule_prefers_direct_manager() {
        let manager = user("u-mgr", UserRole::Manager, None);
        let employee = user("u-emp", UserRole::Employee, Some("u-mgr"));
        let orphan = user("u-orphan", UserRole::Employee, None);
        let directory = Directory::new([manager, employee.clone(), orphan.clone()]);

        let with_manager = fallback_rule(&employee, &directory, Utc::now());
        assert_eq!(with_manager.steps[0].approver, ApproverSpec::Manager);

        let without_manager = fallback_rule(&orphan, &directory, Utc::now());
        assert_eq!(without_manager.steps[0].approver, ApproverSpec::Admin);
    }

    #[test]
    fn policy_parses_config_spellings() {
        assert_eq!(NoRulePolicy::parse("auto-approve"), Some(NoRulePolicy::AutoApprove));
        assert_eq!(NoRulePolicy::parse("default"), Some(NoRulePolicy::DefaultApprover));
        assert_eq!(NoRulePolicy::parse("deny"), None);
        assert_eq!(NoRulePolicy::default().as_str(), "default_approver");
    }
}
