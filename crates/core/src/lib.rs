pub mod approvals;
pub mod audit;
pub mod config;
pub mod currency;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod reports;

pub use approvals::{
    ApprovalEngine, ApprovalError, ApprovalResolution, ApprovalStatus, Directory, NextApprover,
    NoRulePolicy,
};
pub use audit::{AuditEvent, AuditSink};
pub use currency::{convert_with_fallback, Conversion, ConversionError, CurrencyConverter};
pub use domain::company::Company;
pub use domain::expense::{Expense, ExpenseId, ExpenseStatus};
pub use domain::rule::{ApprovalRule, ApprovalRuleDraft, RuleId};
pub use domain::user::{CompanyId, User, UserId, UserRole};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use flows::{ExpenseFlow, FlowEngine};
