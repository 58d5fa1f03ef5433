use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::company::normalize_currency_code;
use crate::domain::rule::RuleId;
use crate::domain::user::{CompanyId, UserId};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExpenseId(pub String);

impl fmt::Display for ExpenseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseStatus {
    Draft,
    PendingApproval,
    Approved,
    Rejected,
    Paid,
}

impl ExpenseStatus {
    pub const ALL: [ExpenseStatus; 5] =
        [Self::Draft, Self::PendingApproval, Self::Approved, Self::Rejected, Self::Paid];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Paid => "paid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "pending_approval" | "pending" => Some(Self::PendingApproval),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "paid" => Some(Self::Paid),
            _ => None,
        }
    }

    /// A decided expense never returns to an earlier state.
    pub fn is_decided(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Paid)
    }
}

impl fmt::Display for ExpenseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseCategory {
    Travel,
    Meals,
    Equipment,
    OfficeSupplies,
    Other,
}

impl ExpenseCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Travel => "travel",
            Self::Meals => "meals",
            Self::Equipment => "equipment",
            Self::OfficeSupplies => "office_supplies",
            Self::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace(' ', "_").as_str() {
            "travel" => Some(Self::Travel),
            "meals" => Some(Self::Meals),
            "equipment" => Some(Self::Equipment),
            "office_supplies" => Some(Self::OfficeSupplies),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// One approve/reject action in an expense's trail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub actor_id: UserId,
    pub decision: Decision,
    /// Sequential step this action satisfied, if it counted toward one.
    pub step_level: Option<u32>,
    pub rule_id: Option<RuleId>,
    pub notes: Option<String>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub id: ExpenseId,
    pub company_id: CompanyId,
    pub owner_id: UserId,
    pub title: String,
    pub description: Option<String>,
    pub category: ExpenseCategory,
    pub amount: Decimal,
    pub currency: String,
    pub amount_in_base_currency: Decimal,
    pub base_currency: String,
    /// Set when conversion failed and the original amount was kept.
    pub conversion_fallback: bool,
    pub expense_date: NaiveDate,
    pub receipt_id: Option<String>,
    pub ocr_data: Option<serde_json::Value>,
    pub status: ExpenseStatus,
    pub current_approver: Option<UserId>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub approval_notes: Option<String>,
    pub approvals: Vec<ApprovalDecision>,
    /// Bumped on every write; used as the compare-and-swap token.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Expense {
    pub fn is_pending(&self) -> bool {
        self.status == ExpenseStatus::PendingApproval
    }

    /// Owners may change content only while nobody has acted on the expense.
    pub fn ensure_editable_by(&self, user_id: &UserId) -> Result<(), DomainError> {
        if &self.owner_id != user_id {
            return Err(DomainError::InvariantViolation(format!(
                "expense `{}` can only be changed by its owner",
                self.id
            )));
        }
        if !self.is_pending() {
            return Err(DomainError::InvariantViolation(format!(
                "expense `{}` is {} and can no longer be changed",
                self.id,
                self.status.as_str()
            )));
        }
        if !self.approvals.is_empty() {
            return Err(DomainError::InvariantViolation(format!(
                "expense `{}` already has approval decisions",
                self.id
            )));
        }
        Ok(())
    }
}

/// Content submitted by an employee when creating an expense.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExpenseDraft {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub category: ExpenseCategory,
    pub amount: Decimal,
    pub currency: String,
    pub expense_date: NaiveDate,
    #[serde(default)]
    pub receipt_id: Option<String>,
    #[serde(default)]
    pub ocr_data: Option<serde_json::Value>,
}

impl ExpenseDraft {
    /// Trims text fields and upper-cases the currency code.
    pub fn normalized(mut self) -> Result<Self, DomainError> {
        self.title = self.title.trim().to_string();
        if self.title.is_empty() {
            return Err(DomainError::InvariantViolation("expense title is required".to_string()));
        }
        validate_amount(self.amount)?;
        self.currency = validate_currency(&self.currency)?;
        self.description = self.description.map(|d| d.trim().to_string()).filter(|d| !d.is_empty());
        Ok(self)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpenseUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<ExpenseCategory>,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub expense_date: Option<NaiveDate>,
    #[serde(default)]
    pub receipt_id: Option<String>,
}

impl ExpenseUpdate {
    pub fn changes_amount(&self) -> bool {
        self.amount.is_some() || self.currency.is_some()
    }

    /// Applies content changes. Base-currency fields are left to the caller,
    /// which re-runs conversion when [`Self::changes_amount`] is true.
    pub fn apply_to(self, expense: &mut Expense) -> Result<(), DomainError> {
        if let Some(title) = self.title {
            let title = title.trim().to_string();
            if title.is_empty() {
                return Err(DomainError::InvariantViolation(
                    "expense title is required".to_string(),
                ));
            }
            expense.title = title;
        }
        if let Some(description) = self.description {
            let description = description.trim().to_string();
            expense.description = (!description.is_empty()).then_some(description);
        }
        if let Some(category) = self.category {
            expense.category = category;
        }
        if let Some(amount) = self.amount {
            validate_amount(amount)?;
            expense.amount = amount;
        }
        if let Some(currency) = self.currency {
            expense.currency = validate_currency(&currency)?;
        }
        if let Some(expense_date) = self.expense_date {
            expense.expense_date = expense_date;
        }
        if let Some(receipt_id) = self.receipt_id {
            expense.receipt_id = Some(receipt_id);
        }
        Ok(())
    }
}

fn validate_amount(amount: Decimal) -> Result<(), DomainError> {
    if amount <= Decimal::ZERO {
        return Err(DomainError::InvariantViolation(format!(
            "expense amount must be positive, got {amount}"
        )));
    }
    Ok(())
}

fn validate_currency(code: &str) -> Result<String, DomainError> {
    normalize_currency_code(code).ok_or_else(|| {
        DomainError::InvariantViolation(format!("`{code}` is not a 3-letter currency code"))
    })
}
