use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::user::{CompanyId, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub String);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who may act on one sequential step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "approver_type", rename_all = "snake_case")]
pub enum ApproverSpec {
    /// The expense owner's direct manager.
    Manager,
    /// Any active admin in the company.
    Admin,
    /// Exactly the named user.
    SpecificUser { approver_id: UserId },
}

impl ApproverSpec {
    pub fn kind(&self) -> ApproverKind {
        match self {
            Self::Manager => ApproverKind::Manager,
            Self::Admin => ApproverKind::Admin,
            Self::SpecificUser { .. } => ApproverKind::SpecificUser,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverKind {
    Manager,
    Admin,
    SpecificUser,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub level: u32,
    #[serde(flatten)]
    pub approver: ApproverSpec,
    pub is_required: bool,
}

/// Override block that can resolve an expense before every sequential step
/// has been cleared.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionalApproval {
    Percentage {
        approval_percentage: Decimal,
    },
    /// With `auto_approve_if_specific_approves` unset, the listed users may
    /// stand in for the current manager or admin step but do not end the
    /// workflow. A `specific_user` step still needs the named user.
    SpecificApprover {
        specific_approvers: Vec<UserId>,
        auto_approve_if_specific_approves: bool,
    },
    Hybrid {
        approval_percentage: Decimal,
        specific_approvers: Vec<UserId>,
    },
}

impl ConditionalApproval {
    pub fn kind(&self) -> ConditionalKind {
        match self {
            Self::Percentage { .. } => ConditionalKind::Percentage,
            Self::SpecificApprover { .. } => ConditionalKind::SpecificApprover,
            Self::Hybrid { .. } => ConditionalKind::Hybrid,
        }
    }

    pub fn approval_percentage(&self) -> Option<Decimal> {
        match self {
            Self::Percentage { approval_percentage } | Self::Hybrid { approval_percentage, .. } => {
                Some(*approval_percentage)
            }
            Self::SpecificApprover { .. } => None,
        }
    }

    pub fn specific_approvers(&self) -> &[UserId] {
        match self {
            Self::Percentage { .. } => &[],
            Self::SpecificApprover { specific_approvers, .. }
            | Self::Hybrid { specific_approvers, .. } => specific_approvers,
        }
    }

    pub fn is_specific_approver(&self, user_id: &UserId) -> bool {
        self.specific_approvers().contains(user_id)
    }

    /// Whether one approval from a specific approver resolves the expense.
    pub fn resolves_on_specific_approval(&self) -> bool {
        match self {
            Self::Percentage { .. } => false,
            Self::SpecificApprover { auto_approve_if_specific_approves, .. } => {
                *auto_approve_if_specific_approves
            }
            Self::Hybrid { .. } => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionalKind {
    Percentage,
    SpecificApprover,
    Hybrid,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub id: RuleId,
    pub company_id: CompanyId,
    pub name: String,
    pub description: Option<String>,
    /// Threshold in the company base currency, inclusive.
    pub min_amount: Decimal,
    pub priority: i32,
    /// Sorted by ascending level.
    pub steps: Vec<ApprovalStep>,
    pub conditional: Option<ConditionalApproval>,
    pub requires_manager_approval_first: bool,
    pub is_active: bool,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalRule {
    pub fn applies_to(&self, amount_in_base_currency: Decimal) -> bool {
        self.is_active && self.min_amount <= amount_in_base_currency
    }

    pub fn step(&self, level: u32) -> Option<&ApprovalStep> {
        self.steps.iter().find(|step| step.level == level)
    }

    /// Users named explicitly anywhere in the rule, for directory checks.
    pub fn referenced_users(&self) -> BTreeSet<UserId> {
        let mut users: BTreeSet<UserId> = self
            .steps
            .iter()
            .filter_map(|step| match &step.approver {
                ApproverSpec::SpecificUser { approver_id } => Some(approver_id.clone()),
                _ => None,
            })
            .collect();
        if let Some(conditional) = &self.conditional {
            users.extend(conditional.specific_approvers().iter().cloned());
        }
        users
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RuleValidationError {
    #[error("rule name must not be empty")]
    EmptyName,
    #[error("min_amount must not be negative, got {0}")]
    NegativeMinAmount(Decimal),
    #[error("sequential_approvers must contain at least one step")]
    NoSteps,
    #[error("at least one sequential step must be required")]
    NoRequiredStep,
    #[error("step level must be 1 or greater, got {0}")]
    InvalidLevel(u32),
    #[error("step level {0} appears more than once")]
    DuplicateLevel(u32),
    #[error("step level {0} is `specific_user` but has no approver_id")]
    MissingApproverId(u32),
    #[error("step level {level} is `{kind:?}` and must not carry an approver_id")]
    UnexpectedApproverId { level: u32, kind: ApproverKind },
    #[error("conditional approval is enabled but has no type")]
    MissingConditionalType,
    #[error("conditional approval of type `{0:?}` requires approval_percentage")]
    MissingPercentage(ConditionalKind),
    #[error("approval_percentage must be within 0..=100, got {0}")]
    PercentageOutOfRange(Decimal),
    #[error("conditional approval of type `{0:?}` requires at least one specific approver")]
    NoSpecificApprovers(ConditionalKind),
}

/// Loosely-shaped rule as submitted by an admin. Converted into an
/// [`ApprovalRule`] only after every per-variant field has been checked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRuleDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub min_amount: Decimal,
    #[serde(default)]
    pub priority: Option<i32>,
    pub sequential_approvers: Vec<ApprovalStepDraft>,
    #[serde(default)]
    pub conditional_approval: Option<ConditionalApprovalDraft>,
    #[serde(default)]
    pub requires_manager_approval_first: Option<bool>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStepDraft {
    pub level: u32,
    pub approver_type: ApproverKind,
    #[serde(default)]
    pub approver_id: Option<UserId>,
    #[serde(default)]
    pub is_required: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalApprovalDraft {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "type")]
    pub kind: Option<ConditionalKind>,
    #[serde(default)]
    pub approval_percentage: Option<Decimal>,
    #[serde(default)]
    pub specific_approvers: Vec<UserId>,
    #[serde(default)]
    pub auto_approve_if_specific_approves: bool,
}

const DEFAULT_PRIORITY: i32 = 1;

impl ApprovalRuleDraft {
    pub fn into_rule(
        self,
        id: RuleId,
        company_id: CompanyId,
        created_by: UserId,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRule, RuleValidationError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(RuleValidationError::EmptyName);
        }
        if self.min_amount < Decimal::ZERO {
            return Err(RuleValidationError::NegativeMinAmount(self.min_amount));
        }

        let steps = validate_steps(self.sequential_approvers)?;
        let conditional = self.conditional_approval.map(validate_conditional).transpose()?.flatten();

        Ok(ApprovalRule {
            id,
            company_id,
            name,
            description: self.description.map(|d| d.trim().to_string()).filter(|d| !d.is_empty()),
            min_amount: self.min_amount,
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY),
            steps,
            conditional,
            requires_manager_approval_first: self.requires_manager_approval_first.unwrap_or(true),
            is_active: self.is_active.unwrap_or(true),
            created_by,
            created_at: now,
            updated_at: now,
        })
    }
}

fn validate_steps(drafts: Vec<ApprovalStepDraft>) -> Result<Vec<ApprovalStep>, RuleValidationError> {
    if drafts.is_empty() {
        return Err(RuleValidationError::NoSteps);
    }

    let mut seen = BTreeSet::new();
    let mut steps = Vec::with_capacity(drafts.len());
    for draft in drafts {
        if draft.level == 0 {
            return Err(RuleValidationError::InvalidLevel(draft.level));
        }
        if !seen.insert(draft.level) {
            return Err(RuleValidationError::DuplicateLevel(draft.level));
        }

        let approver = match (draft.approver_type, draft.approver_id) {
            (ApproverKind::SpecificUser, Some(approver_id)) => {
                ApproverSpec::SpecificUser { approver_id }
            }
            (ApproverKind::SpecificUser, None) => {
                return Err(RuleValidationError::MissingApproverId(draft.level));
            }
            (kind, Some(_)) => {
                return Err(RuleValidationError::UnexpectedApproverId { level: draft.level, kind });
            }
            (ApproverKind::Manager, None) => ApproverSpec::Manager,
            (ApproverKind::Admin, None) => ApproverSpec::Admin,
        };

        steps.push(ApprovalStep {
            level: draft.level,
            approver,
            is_required: draft.is_required.unwrap_or(true),
        });
    }

    if !steps.iter().any(|step| step.is_required) {
        return Err(RuleValidationError::NoRequiredStep);
    }

    steps.sort_by_key(|step| step.level);
    Ok(steps)
}

fn validate_conditional(
    draft: ConditionalApprovalDraft,
) -> Result<Option<ConditionalApproval>, RuleValidationError> {
    if !draft.enabled {
        return Ok(None);
    }

    let kind = draft.kind.ok_or(RuleValidationError::MissingConditionalType)?;
    let percentage = |kind| -> Result<Decimal, RuleValidationError> {
        let value = draft.approval_percentage.ok_or(RuleValidationError::MissingPercentage(kind))?;
        if value < Decimal::ZERO || value > Decimal::ONE_HUNDRED {
            return Err(RuleValidationError::PercentageOutOfRange(value));
        }
        Ok(value)
    };
    let specific = |kind| -> Result<Vec<UserId>, RuleValidationError> {
        let mut approvers = draft.specific_approvers.clone();
        approvers.sort();
        approvers.dedup();
        if approvers.is_empty() {
            return Err(RuleValidationError::NoSpecificApprovers(kind));
        }
        Ok(approvers)
    };

    let conditional = match kind {
        ConditionalKind::Percentage => {
            ConditionalApproval::Percentage { approval_percentage: percentage(kind)? }
        }
        ConditionalKind::SpecificApprover => ConditionalApproval::SpecificApprover {
            specific_approvers: specific(kind)?,
            auto_approve_if_specific_approves: draft.auto_approve_if_specific_approves,
        },
        ConditionalKind::Hybrid => ConditionalApproval::Hybrid {
            approval_percentage: percentage(kind)?,
            specific_approvers: specific(kind)?,
        },
    };

    Ok(Some(conditional))
}
