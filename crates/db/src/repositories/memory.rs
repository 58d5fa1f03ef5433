use std::collections::{BTreeSet, HashMap};

use tokio::sync::RwLock;

use expensa_core::domain::company::Company;
use expensa_core::domain::expense::{Expense, ExpenseId, ExpenseStatus};
use expensa_core::domain::rule::{ApprovalRule, RuleId};
use expensa_core::domain::user::{CompanyId, User, UserId, UserRole};

use super::{
    ApprovalRuleRepository, CompanyRepository, ExpenseRepository, Page, RepositoryError,
    UserRepository,
};

#[derive(Default)]
pub struct InMemoryCompanyRepository {
    companies: RwLock<HashMap<String, Company>>,
}

#[async_trait::async_trait]
impl CompanyRepository for InMemoryCompanyRepository {
    async fn find_by_id(&self, id: &CompanyId) -> Result<Option<Company>, RepositoryError> {
        let companies = self.companies.read().await;
        Ok(companies.get(&id.0).cloned())
    }

    async fn save(&self, company: Company) -> Result<(), RepositoryError> {
        let mut companies = self.companies.write().await;
        companies.insert(company.id.0.clone(), company);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryUserRepository {
    users: RwLock<HashMap<String, User>>,
}

impl InMemoryUserRepository {
    async fn filtered(&self, predicate: impl Fn(&User) -> bool) -> Vec<User> {
        let users = self.users.read().await;
        let mut matching: Vec<User> = users.values().filter(|u| predicate(u)).cloned().collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        matching
    }
}

#[async_trait::async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, RepositoryError> {
        let users = self.users.read().await;
        Ok(users.get(&id.0).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError> {
        let email = email.trim();
        let users = self.users.read().await;
        Ok(users.values().find(|user| user.email.eq_ignore_ascii_case(email)).cloned())
    }

    async fn list_by_company(&self, company_id: &CompanyId) -> Result<Vec<User>, RepositoryError> {
        Ok(self.filtered(|user| &user.company_id == company_id).await)
    }

    async fn list_by_role(
        &self,
        company_id: &CompanyId,
        role: UserRole,
    ) -> Result<Vec<User>, RepositoryError> {
        Ok(self.filtered(|user| &user.company_id == company_id && user.role == role).await)
    }

    async fn list_direct_reports(&self, manager_id: &UserId) -> Result<Vec<User>, RepositoryError> {
        Ok(self
            .filtered(|user| user.is_active && user.manager_id.as_ref() == Some(manager_id))
            .await)
    }

    async fn save(&self, user: User) -> Result<(), RepositoryError> {
        let mut users = self.users.write().await;
        users.insert(user.id.0.clone(), user);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryApprovalRuleRepository {
    rules: RwLock<HashMap<String, ApprovalRule>>,
}

#[async_trait::async_trait]
impl ApprovalRuleRepository for InMemoryApprovalRuleRepository {
    async fn find_by_id(&self, id: &RuleId) -> Result<Option<ApprovalRule>, RepositoryError> {
        let rules = self.rules.read().await;
        Ok(rules.get(&id.0).cloned())
    }

    async fn list_by_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalRule>, RepositoryError> {
        let rules = self.rules.read().await;
        let mut matching: Vec<ApprovalRule> =
            rules.values().filter(|rule| &rule.company_id == company_id).cloned().collect();
        matching.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(matching)
    }

    async fn list_active_by_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalRule>, RepositoryError> {
        let mut rules = self.list_by_company(company_id).await?;
        rules.retain(|rule| rule.is_active);
        Ok(rules)
    }

    async fn save(&self, rule: ApprovalRule) -> Result<(), RepositoryError> {
        let mut rules = self.rules.write().await;
        rules.insert(rule.id.0.clone(), rule);
        Ok(())
    }

    async fn delete(&self, id: &RuleId) -> Result<bool, RepositoryError> {
        let mut rules = self.rules.write().await;
        Ok(rules.remove(&id.0).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryExpenseRepository {
    expenses: RwLock<HashMap<String, Expense>>,
}

impl InMemoryExpenseRepository {
    async fn matching(
        &self,
        company_id: &CompanyId,
        owners: Option<&BTreeSet<UserId>>,
        pending_only: bool,
    ) -> Vec<Expense> {
        let expenses = self.expenses.read().await;
        expenses
            .values()
            .filter(|expense| &expense.company_id == company_id)
            .filter(|expense| owners.map_or(true, |owners| owners.contains(&expense.owner_id)))
            .filter(|expense| !pending_only || expense.status == ExpenseStatus::PendingApproval)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl ExpenseRepository for InMemoryExpenseRepository {
    async fn find_by_id(&self, id: &ExpenseId) -> Result<Option<Expense>, RepositoryError> {
        let expenses = self.expenses.read().await;
        Ok(expenses.get(&id.0).cloned())
    }

    async fn insert(&self, expense: Expense) -> Result<(), RepositoryError> {
        let mut expenses = self.expenses.write().await;
        expenses.insert(expense.id.0.clone(), expense);
        Ok(())
    }

    async fn compare_and_swap(&self, mut expense: Expense) -> Result<Expense, RepositoryError> {
        let mut expenses = self.expenses.write().await;
        let stored_version = expenses.get(&expense.id.0).map(|stored| stored.version);
        if stored_version != Some(expense.version) {
            return Err(RepositoryError::Conflict {
                entity: "expense",
                id: expense.id.0.clone(),
                expected_version: expense.version,
            });
        }

        expense.version += 1;
        expenses.insert(expense.id.0.clone(), expense.clone());
        Ok(expense)
    }

    async fn delete(&self, id: &ExpenseId, expected_version: i64) -> Result<(), RepositoryError> {
        let mut expenses = self.expenses.write().await;
        match expenses.get(&id.0) {
            Some(stored) if stored.version == expected_version => {
                expenses.remove(&id.0);
                Ok(())
            }
            _ => Err(RepositoryError::Conflict {
                entity: "expense",
                id: id.0.clone(),
                expected_version,
            }),
        }
    }

    async fn list_by_company(
        &self,
        company_id: &CompanyId,
        owners: Option<&BTreeSet<UserId>>,
    ) -> Result<Vec<Expense>, RepositoryError> {
        let mut expenses = self.matching(company_id, owners, false).await;
        expenses.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(expenses)
    }

    async fn list_pending(
        &self,
        company_id: &CompanyId,
        owners: Option<&BTreeSet<UserId>>,
        page: Page,
    ) -> Result<Vec<Expense>, RepositoryError> {
        let mut expenses = self.matching(company_id, owners, true).await;
        expenses.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then_with(|| a.id.cmp(&b.id)));
        Ok(expenses
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn count_pending(
        &self,
        company_id: &CompanyId,
        owners: Option<&BTreeSet<UserId>>,
    ) -> Result<u64, RepositoryError> {
        Ok(self.matching(company_id, owners, true).await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use expensa_core::domain::rule::{ApprovalRule, ApprovalStep, ApproverSpec, RuleId};
    use expensa_core::domain::user::{CompanyId, User, UserId, UserRole};

    use crate::repositories::{
        ApprovalRuleRepository, InMemoryApprovalRuleRepository, InMemoryUserRepository,
        UserRepository,
    };

    fn rule(id: &str, priority: i32, active: bool) -> ApprovalRule {
        let now = Utc::now();
        ApprovalRule {
            id: RuleId(id.to_string()),
            company_id: CompanyId("c-1".to_string()),
            name: id.to_string(),
            description: None,
            min_amount: Decimal::ZERO,
            priority,
            steps: vec![ApprovalStep { level: 1, approver: ApproverSpec::Admin, is_required: true }],
            conditional: None,
            requires_manager_approval_first: false,
            is_active: active,
            created_by: UserId("u-admin".to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn in_memory_rule_repo_orders_by_priority_and_filters_active() {
        let repo = InMemoryApprovalRuleRepository::default();
        repo.save(rule("R-low", 1, true)).await.expect("save low");
        repo.save(rule("R-high", 9, true)).await.expect("save high");
        repo.save(rule("R-off", 5, false)).await.expect("save inactive");

        let company = CompanyId("c-1".to_string());
        let active = repo.list_active_by_company(&company).await.expect("active");
        assert_eq!(active.iter().map(|r| r.id.0.as_str()).collect::<Vec<_>>(), ["R-high", "R-low"]);
        assert!(repo.delete(&RuleId("R-off".to_string())).await.expect("delete"));
    }

    #[tokio::test]
    async fn in_memory_user_repo_lists_active_direct_reports() {
        let repo = InMemoryUserRepository::default();
        for (id, active) in [("u-a", true), ("u-b", false)] {
            repo.save(User {
                id: UserId(id.to_string()),
                company_id: CompanyId("c-1".to_string()),
                name: id.to_string(),
                email: format!("{id}@acme.test"),
                role: UserRole::Employee,
                manager_id: Some(UserId("u-mgr".to_string())),
                is_manager_approver: true,
                is_active: active,
                created_at: Utc::now(),
            })
            .await
            .expect("save user");
        }

        let reports =
            repo.list_direct_reports(&UserId("u-mgr".to_string())).await.expect("reports");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].id.0, "u-a");
    }
}
