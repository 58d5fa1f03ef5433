use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;

use expensa_core::domain::company::Company;
use expensa_core::domain::expense::{Expense, ExpenseId};
use expensa_core::domain::rule::{ApprovalRule, RuleId};
use expensa_core::domain::user::{CompanyId, User, UserId, UserRole};

pub mod company;
pub mod expense;
pub mod memory;
pub mod rule;
pub mod user;

mod decode;

pub use company::SqlCompanyRepository;
pub use expense::SqlExpenseRepository;
pub use memory::{
    InMemoryApprovalRuleRepository, InMemoryCompanyRepository, InMemoryExpenseRepository,
    InMemoryUserRepository,
};
pub use rule::SqlApprovalRuleRepository;
pub use user::SqlUserRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("{entity} `{id}` was modified concurrently (expected version {expected_version})")]
    Conflict { entity: &'static str, id: String, expected_version: i64 },
}

/// One-based page request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Page {
    pub const MAX_LIMIT: u32 = 100;

    pub fn new(page: u32, limit: u32) -> Self {
        Self { page: page.max(1), limit: limit.clamp(1, Self::MAX_LIMIT) }
    }

    pub fn offset(&self) -> u32 {
        (self.page - 1) * self.limit
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, 10)
    }
}

#[async_trait]
pub trait CompanyRepository: Send + Sync {
    async fn find_by_id(&self, id: &CompanyId) -> Result<Option<Company>, RepositoryError>;
    async fn save(&self, company: Company) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, RepositoryError>;
    /// Emails are unique across companies and compared case-insensitively.
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError>;
    async fn list_by_company(&self, company_id: &CompanyId) -> Result<Vec<User>, RepositoryError>;
    async fn list_by_role(
        &self,
        company_id: &CompanyId,
        role: UserRole,
    ) -> Result<Vec<User>, RepositoryError>;
    /// Active users whose `manager_id` is `manager_id`.
    async fn list_direct_reports(&self, manager_id: &UserId) -> Result<Vec<User>, RepositoryError>;
    async fn save(&self, user: User) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ApprovalRuleRepository: Send + Sync {
    async fn find_by_id(&self, id: &RuleId) -> Result<Option<ApprovalRule>, RepositoryError>;
    /// All rules of a company, highest priority first.
    async fn list_by_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalRule>, RepositoryError>;
    async fn list_active_by_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalRule>, RepositoryError>;
    async fn save(&self, rule: ApprovalRule) -> Result<(), RepositoryError>;
    /// Returns whether a rule was removed.
    async fn delete(&self, id: &RuleId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait ExpenseRepository: Send + Sync {
    async fn find_by_id(&self, id: &ExpenseId) -> Result<Option<Expense>, RepositoryError>;

    /// Stores a new expense together with its decision trail.
    async fn insert(&self, expense: Expense) -> Result<(), RepositoryError>;

    /// Writes `expense` only if the stored row is still at `expense.version`,
    /// appending any new decisions in the same transaction. The returned
    /// expense carries the bumped version.
    async fn compare_and_swap(&self, expense: Expense) -> Result<Expense, RepositoryError>;

    async fn delete(&self, id: &ExpenseId, expected_version: i64) -> Result<(), RepositoryError>;

    /// Expenses of a company, optionally restricted to some owners, newest first.
    async fn list_by_company(
        &self,
        company_id: &CompanyId,
        owners: Option<&BTreeSet<UserId>>,
    ) -> Result<Vec<Expense>, RepositoryError>;

    /// Pending expenses, oldest submission first.
    async fn list_pending(
        &self,
        company_id: &CompanyId,
        owners: Option<&BTreeSet<UserId>>,
        page: Page,
    ) -> Result<Vec<Expense>, RepositoryError>;

    async fn count_pending(
        &self,
        company_id: &CompanyId,
        owners: Option<&BTreeSet<UserId>>,
    ) -> Result<u64, RepositoryError>;
}

#[cfg(test)]
mod tests {
    use super::Page;

    #[test]
    fn page_is_clamped_and_offset_from_one() {
        let page = Page::new(0, 500);
        assert_eq!(page.page, 1);
        assert_eq!(page.limit, Page::MAX_LIMIT);
        assert_eq!(page.offset(), 0);

        assert_eq!(Page::new(3, 10).offset(), 20);
    }
}
