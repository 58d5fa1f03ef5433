//! Request-scoped expense operations. Each call loads the actor, the
//! company's directory and active rules, runs the approval engine and writes
//! the result back with a version compare-and-swap. A lost race is retried
//! against fresh state, so a second approver sees the expense as it is after
//! the first one won.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use expensa_core::approvals::{
    ApprovalEngine, ApprovalError, ApprovalStatus, DecisionOutcome, DecisionRequest, Directory,
    NextApprover, NoRulePolicy,
};
use expensa_core::audit::{AuditContext, AuditSink};
use expensa_core::currency::{convert_with_fallback, Conversion, CurrencyConverter};
use expensa_core::domain::company::Company;
use expensa_core::domain::expense::{
    ApprovalDecision, Decision, Expense, ExpenseCategory, ExpenseDraft, ExpenseId, ExpenseStatus,
    ExpenseUpdate,
};
use expensa_core::domain::rule::{ApprovalRule, ApprovalRuleDraft, RuleId};
use expensa_core::domain::user::{CompanyId, User, UserId, UserRole};
use expensa_core::errors::{ApplicationError, DomainError};
use expensa_core::reports::{build_report, status_breakdown, Report, ReportFilter, ReportType, StatusBreakdown};
use expensa_db::repositories::{
    InMemoryApprovalRuleRepository, InMemoryCompanyRepository, InMemoryExpenseRepository,
    InMemoryUserRepository, SqlApprovalRuleRepository, SqlCompanyRepository,
    SqlExpenseRepository, SqlUserRepository,
};
use expensa_db::{
    ApprovalRuleRepository, CompanyRepository, DbPool, ExpenseRepository, Page, RepositoryError,
    UserRepository,
};

const MAX_WRITE_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct Stores {
    pub companies: Arc<dyn CompanyRepository>,
    pub users: Arc<dyn UserRepository>,
    pub rules: Arc<dyn ApprovalRuleRepository>,
    pub expenses: Arc<dyn ExpenseRepository>,
}

impl Stores {
    pub fn sql(pool: DbPool) -> Self {
        Self {
            companies: Arc::new(SqlCompanyRepository::new(pool.clone())),
            users: Arc::new(SqlUserRepository::new(pool.clone())),
            rules: Arc::new(SqlApprovalRuleRepository::new(pool.clone())),
            expenses: Arc::new(SqlExpenseRepository::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            companies: Arc::new(InMemoryCompanyRepository::default()),
            users: Arc::new(InMemoryUserRepository::default()),
            rules: Arc::new(InMemoryApprovalRuleRepository::default()),
            expenses: Arc::new(InMemoryExpenseRepository::default()),
        }
    }
}

/// Caller identity plus the id tying log lines of one request together.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub actor_id: UserId,
    pub correlation_id: String,
}

impl RequestContext {
    pub fn new(actor_id: UserId, correlation_id: impl Into<String>) -> Self {
        Self { actor_id, correlation_id: correlation_id.into() }
    }

    fn audit(&self, expense_id: Option<ExpenseId>) -> AuditContext {
        AuditContext::new(expense_id, self.correlation_id.clone(), self.actor_id.0.clone())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ExpenseView {
    #[serde(flatten)]
    pub expense: Expense,
    pub next_approver: Option<NextApprover>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DecisionView {
    pub expense: Expense,
    pub decision: ApprovalDecision,
    pub status: ApprovalStatus,
}

#[derive(Clone, Debug, Serialize)]
pub struct ExpensePage {
    pub items: Vec<ExpenseView>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}

/// Optional narrowing for expense listings. Date bounds are inclusive.
#[derive(Clone, Debug, Default)]
pub struct ExpenseFilter {
    pub status: Option<ExpenseStatus>,
    pub category: Option<ExpenseCategory>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl ExpenseFilter {
    fn matches(&self, expense: &Expense) -> bool {
        self.status.map_or(true, |status| expense.status == status)
            && self.category.map_or(true, |category| expense.category == category)
            && self.start.map_or(true, |start| expense.expense_date >= start)
            && self.end.map_or(true, |end| expense.expense_date <= end)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct UserPage {
    pub items: Vec<User>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}

#[derive(Clone, Debug, Default)]
pub struct UserFilter {
    pub role: Option<UserRole>,
    /// Case-insensitive substring of the user's name.
    pub search: Option<String>,
}

/// A company member created by an admin. The id is assigned on creation.
#[derive(Clone, Debug)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub role: UserRole,
    pub manager_id: Option<UserId>,
    pub is_manager_approver: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct ApprovalStats {
    pub expense_count: usize,
    pub total_in_base_currency: Decimal,
    pub statuses: Vec<StatusBreakdown>,
}

struct CompanyScope {
    directory: Directory,
    rules: Vec<ApprovalRule>,
}

#[derive(Clone)]
pub struct ExpenseWorkflow {
    stores: Stores,
    converter: Arc<dyn CurrencyConverter>,
    audit: Arc<dyn AuditSink>,
    engine: Arc<ApprovalEngine>,
}

impl ExpenseWorkflow {
    pub fn new(
        stores: Stores,
        converter: Arc<dyn CurrencyConverter>,
        audit: Arc<dyn AuditSink>,
        policy: NoRulePolicy,
    ) -> Self {
        Self { stores, converter, audit, engine: Arc::new(ApprovalEngine::new(policy)) }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub async fn create_expense(
        &self,
        context: &RequestContext,
        draft: ExpenseDraft,
    ) -> Result<ExpenseView, ApplicationError> {
        let actor = self.actor(context).await?;
        let company = self.company(&actor.company_id).await?;
        let draft = draft.normalized()?;
        let conversion = self.convert(context, draft.amount, &draft.currency, &company).await;

        let now = Utc::now();
        let expense = Expense {
            id: ExpenseId(format!("exp-{}", Uuid::new_v4())),
            company_id: actor.company_id.clone(),
            owner_id: actor.id.clone(),
            title: draft.title,
            description: draft.description,
            category: draft.category,
            amount: draft.amount,
            currency: draft.currency,
            amount_in_base_currency: conversion.amount,
            base_currency: company.base_currency.clone(),
            conversion_fallback: conversion.is_fallback(),
            expense_date: draft.expense_date,
            receipt_id: draft.receipt_id,
            ocr_data: draft.ocr_data,
            status: ExpenseStatus::Draft,
            current_approver: None,
            submitted_at: None,
            approved_at: None,
            rejected_at: None,
            paid_at: None,
            rejection_reason: None,
            approval_notes: None,
            approvals: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        };

        let scope = self.company_scope(&actor.company_id).await?;
        let audit = context.audit(Some(expense.id.clone()));
        let (expense, status) = self.engine.submit(
            expense,
            &actor,
            &scope.rules,
            &scope.directory,
            now,
            self.audit.as_ref(),
            &audit,
        )?;
        self.stores.expenses.insert(expense.clone()).await.map_err(persistence)?;

        info!(
            event_name = "expense.created",
            correlation_id = %context.correlation_id,
            expense_id = %expense.id,
            actor_id = %actor.id,
            status = expense.status.as_str(),
            amount_in_base_currency = %expense.amount_in_base_currency,
            "expense submitted"
        );

        let next_approver = match status {
            ApprovalStatus::Pending { next } => next,
            ApprovalStatus::Approved { .. } | ApprovalStatus::Rejected => None,
        };
        Ok(ExpenseView { expense, next_approver })
    }

    /// Visible to the owner and to managers and admins of the company.
    pub async fn get_expense(
        &self,
        context: &RequestContext,
        id: &ExpenseId,
    ) -> Result<ExpenseView, ApplicationError> {
        let actor = self.actor(context).await?;
        let expense = self.load_expense(&actor, id).await?;
        if expense.owner_id != actor.id && !actor.role.can_approve() {
            return Err(unauthorized("only the owner or an approver can view this expense"));
        }

        let scope = self.company_scope(&actor.company_id).await?;
        Ok(self.view(&scope, expense))
    }

    /// Expenses visible to the actor, newest first: employees see their
    /// own, managers their direct reports', admins the whole company.
    pub async fn list_expenses(
        &self,
        context: &RequestContext,
        filter: &ExpenseFilter,
        page: Page,
    ) -> Result<ExpensePage, ApplicationError> {
        let actor = self.actor(context).await?;
        let owners = self.visible_owners(&actor).await?;
        let expenses = self
            .stores
            .expenses
            .list_by_company(&actor.company_id, owners.as_ref())
            .await
            .map_err(persistence)?;

        let matching: Vec<Expense> =
            expenses.into_iter().filter(|expense| filter.matches(expense)).collect();
        let total = matching.len() as u64;
        let scope = self.company_scope(&actor.company_id).await?;
        let items = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .map(|expense| self.view(&scope, expense))
            .collect();
        Ok(ExpensePage { items, page: page.page, limit: page.limit, total })
    }

    pub async fn update_expense(
        &self,
        context: &RequestContext,
        id: &ExpenseId,
        update: ExpenseUpdate,
    ) -> Result<ExpenseView, ApplicationError> {
        let actor = self.actor(context).await?;
        let company = self.company(&actor.company_id).await?;

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut expense = self.load_expense(&actor, id).await?;
            expense.ensure_editable_by(&actor.id)?;

            let changes_amount = update.changes_amount();
            update.clone().apply_to(&mut expense)?;
            if changes_amount {
                let currency = expense.currency.clone();
                let conversion = self.convert(context, expense.amount, &currency, &company).await;
                expense.amount_in_base_currency = conversion.amount;
                expense.conversion_fallback = conversion.is_fallback();
            }
            expense.updated_at = Utc::now();

            // A new amount may select a different rule.
            let scope = self.company_scope(&actor.company_id).await?;
            let mut view = self.view(&scope, expense);
            view.expense.current_approver =
                view.next_approver.as_ref().and_then(NextApprover::single_candidate).cloned();

            match self.stores.expenses.compare_and_swap(view.expense).await {
                Ok(stored) => {
                    info!(
                        event_name = "expense.updated",
                        correlation_id = %context.correlation_id,
                        expense_id = %stored.id,
                        actor_id = %actor.id,
                        amount_changed = changes_amount,
                        "expense updated by owner"
                    );
                    return Ok(ExpenseView { expense: stored, next_approver: view.next_approver });
                }
                Err(RepositoryError::Conflict { .. }) => write_conflict(context, id, attempt),
                Err(error) => return Err(persistence(error)),
            }
        }

        Err(retries_exhausted(id))
    }

    pub async fn delete_expense(
        &self,
        context: &RequestContext,
        id: &ExpenseId,
    ) -> Result<(), ApplicationError> {
        let actor = self.actor(context).await?;

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let expense = self.load_expense(&actor, id).await?;
            expense.ensure_editable_by(&actor.id)?;

            match self.stores.expenses.delete(id, expense.version).await {
                Ok(()) => {
                    info!(
                        event_name = "expense.deleted",
                        correlation_id = %context.correlation_id,
                        expense_id = %id,
                        actor_id = %actor.id,
                        "expense deleted by owner"
                    );
                    return Ok(());
                }
                Err(RepositoryError::Conflict { .. }) => write_conflict(context, id, attempt),
                Err(error) => return Err(persistence(error)),
            }
        }

        Err(retries_exhausted(id))
    }

    pub async fn approve(
        &self,
        context: &RequestContext,
        id: &ExpenseId,
        notes: Option<String>,
    ) -> Result<DecisionView, ApplicationError> {
        self.decide(context, id, Decision::Approved, notes).await
    }

    pub async fn reject(
        &self,
        context: &RequestContext,
        id: &ExpenseId,
        reason: Option<String>,
    ) -> Result<DecisionView, ApplicationError> {
        self.decide(context, id, Decision::Rejected, reason).await
    }

    async fn decide(
        &self,
        context: &RequestContext,
        id: &ExpenseId,
        decision: Decision,
        text: Option<String>,
    ) -> Result<DecisionView, ApplicationError> {
        let actor = self.actor(context).await?;
        let audit = context.audit(Some(id.clone()));

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let expense = self.load_expense(&actor, id).await?;
            let scope = self.company_scope(&actor.company_id).await?;
            let owner = scope
                .directory
                .get(&expense.owner_id)
                .ok_or_else(|| ApprovalError::not_found("user", expense.owner_id.0.clone()))?;

            let request = DecisionRequest {
                expense: &expense,
                owner,
                actor: &actor,
                rules: &scope.rules,
                directory: &scope.directory,
                text: text.as_deref(),
                now: Utc::now(),
            };
            let DecisionOutcome { expense: updated, decision: recorded, status } = match decision {
                Decision::Approved => self.engine.approve(request, self.audit.as_ref(), &audit)?,
                Decision::Rejected => self.engine.reject(request, self.audit.as_ref(), &audit)?,
            };

            match self.stores.expenses.compare_and_swap(updated).await {
                Ok(stored) => {
                    log_decision(context, &stored, &recorded, &status);
                    return Ok(DecisionView { expense: stored, decision: recorded, status });
                }
                Err(RepositoryError::Conflict { .. }) => write_conflict(context, id, attempt),
                Err(error) => return Err(persistence(error)),
            }
        }

        Err(retries_exhausted(id))
    }

    pub async fn mark_paid(
        &self,
        context: &RequestContext,
        id: &ExpenseId,
    ) -> Result<Expense, ApplicationError> {
        let actor = self.actor(context).await?;
        let audit = context.audit(Some(id.clone()));

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let expense = self.load_expense(&actor, id).await?;
            let paid =
                self.engine.mark_paid(&expense, &actor, Utc::now(), self.audit.as_ref(), &audit)?;

            match self.stores.expenses.compare_and_swap(paid).await {
                Ok(stored) => {
                    info!(
                        event_name = "expense.paid",
                        correlation_id = %context.correlation_id,
                        expense_id = %stored.id,
                        actor_id = %actor.id,
                        "expense marked as paid"
                    );
                    return Ok(stored);
                }
                Err(RepositoryError::Conflict { .. }) => write_conflict(context, id, attempt),
                Err(error) => return Err(persistence(error)),
            }
        }

        Err(retries_exhausted(id))
    }

    /// Pending expenses the actor may act on, oldest submission first.
    /// Managers see their active direct reports; admins see the company.
    pub async fn pending_approvals(
        &self,
        context: &RequestContext,
        page: Page,
    ) -> Result<ExpensePage, ApplicationError> {
        let actor = self.actor(context).await?;
        if !actor.role.can_approve() {
            return Err(unauthorized("only managers and admins have an approval queue"));
        }

        let owners = self.visible_owners(&actor).await?;
        let expenses = self
            .stores
            .expenses
            .list_pending(&actor.company_id, owners.as_ref(), page)
            .await
            .map_err(persistence)?;
        let total = self
            .stores
            .expenses
            .count_pending(&actor.company_id, owners.as_ref())
            .await
            .map_err(persistence)?;

        let scope = self.company_scope(&actor.company_id).await?;
        let items = expenses.into_iter().map(|expense| self.view(&scope, expense)).collect();
        Ok(ExpensePage { items, page: page.page, limit: page.limit, total })
    }

    pub async fn approval_stats(
        &self,
        context: &RequestContext,
    ) -> Result<ApprovalStats, ApplicationError> {
        let actor = self.actor(context).await?;
        if !actor.role.can_approve() {
            return Err(unauthorized("only managers and admins can view approval statistics"));
        }

        let owners = self.visible_owners(&actor).await?;
        let expenses = self
            .stores
            .expenses
            .list_by_company(&actor.company_id, owners.as_ref())
            .await
            .map_err(persistence)?;
        let selected: Vec<&Expense> = expenses.iter().collect();

        Ok(ApprovalStats {
            expense_count: selected.len(),
            total_in_base_currency: selected.iter().map(|e| e.amount_in_base_currency).sum(),
            statuses: status_breakdown(&selected),
        })
    }

    pub async fn report(
        &self,
        context: &RequestContext,
        report_type: ReportType,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Report, ApplicationError> {
        let actor = self.actor(context).await?;
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(DomainError::InvariantViolation(format!(
                    "report start {start} is after end {end}"
                ))
                .into());
            }
        }

        let owners = self.visible_owners(&actor).await?;
        let expenses = self
            .stores
            .expenses
            .list_by_company(&actor.company_id, owners.as_ref())
            .await
            .map_err(persistence)?;

        info!(
            event_name = "report.generated",
            correlation_id = %context.correlation_id,
            actor_id = %actor.id,
            report_type = report_type.as_str(),
            expenses = expenses.len(),
            "report generated"
        );
        Ok(build_report(report_type, &expenses, ReportFilter { start, end, owners }, Utc::now()))
    }

    pub async fn list_rules(
        &self,
        context: &RequestContext,
    ) -> Result<Vec<ApprovalRule>, ApplicationError> {
        let actor = self.approver(context).await?;
        self.stores.rules.list_by_company(&actor.company_id).await.map_err(persistence)
    }

    pub async fn get_rule(
        &self,
        context: &RequestContext,
        id: &RuleId,
    ) -> Result<ApprovalRule, ApplicationError> {
        let actor = self.approver(context).await?;
        self.load_rule(&actor, id).await
    }

    pub async fn create_rule(
        &self,
        context: &RequestContext,
        draft: ApprovalRuleDraft,
    ) -> Result<ApprovalRule, ApplicationError> {
        let actor = self.admin(context).await?;
        let rule = draft.into_rule(
            RuleId(format!("rule-{}", Uuid::new_v4())),
            actor.company_id.clone(),
            actor.id.clone(),
            Utc::now(),
        )?;
        self.ensure_rule_users(&rule).await?;
        self.stores.rules.save(rule.clone()).await.map_err(persistence)?;

        info!(
            event_name = "rule.created",
            correlation_id = %context.correlation_id,
            actor_id = %actor.id,
            rule_id = %rule.id,
            min_amount = %rule.min_amount,
            priority = rule.priority,
            "approval rule created"
        );
        Ok(rule)
    }

    pub async fn update_rule(
        &self,
        context: &RequestContext,
        id: &RuleId,
        draft: ApprovalRuleDraft,
    ) -> Result<ApprovalRule, ApplicationError> {
        let actor = self.admin(context).await?;
        let existing = self.load_rule(&actor, id).await?;

        let mut rule = draft.into_rule(
            existing.id.clone(),
            existing.company_id.clone(),
            existing.created_by.clone(),
            existing.created_at,
        )?;
        rule.updated_at = Utc::now();
        self.ensure_rule_users(&rule).await?;
        self.stores.rules.save(rule.clone()).await.map_err(persistence)?;

        info!(
            event_name = "rule.updated",
            correlation_id = %context.correlation_id,
            actor_id = %actor.id,
            rule_id = %rule.id,
            "approval rule updated"
        );
        Ok(rule)
    }

    pub async fn delete_rule(
        &self,
        context: &RequestContext,
        id: &RuleId,
    ) -> Result<(), ApplicationError> {
        let actor = self.admin(context).await?;
        self.load_rule(&actor, id).await?;
        if !self.stores.rules.delete(id).await.map_err(persistence)? {
            return Err(ApprovalError::not_found("rule", id.0.clone()).into());
        }

        info!(
            event_name = "rule.deleted",
            correlation_id = %context.correlation_id,
            actor_id = %actor.id,
            rule_id = %id,
            "approval rule deleted"
        );
        Ok(())
    }

    /// Active managers and admins of the actor's company.
    pub async fn available_approvers(
        &self,
        context: &RequestContext,
    ) -> Result<Vec<User>, ApplicationError> {
        let actor = self.approver(context).await?;
        self.active_approvers(&actor.company_id).await
    }

    /// Candidates for a user's `manager_id`, sorted by name.
    pub async fn list_managers(
        &self,
        context: &RequestContext,
    ) -> Result<Vec<User>, ApplicationError> {
        let actor = self.actor(context).await?;
        let mut managers = self.active_approvers(&actor.company_id).await?;
        managers.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(managers)
    }

    /// Company members, newest first.
    pub async fn list_users(
        &self,
        context: &RequestContext,
        filter: &UserFilter,
        page: Page,
    ) -> Result<UserPage, ApplicationError> {
        let actor = self.admin(context).await?;
        let users = match filter.role {
            Some(role) => self.stores.users.list_by_role(&actor.company_id, role).await,
            None => self.stores.users.list_by_company(&actor.company_id).await,
        }
        .map_err(persistence)?;

        let needle = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|search| !search.is_empty())
            .map(str::to_lowercase);
        let mut matching: Vec<User> = users
            .into_iter()
            .filter(|user| {
                needle.as_ref().map_or(true, |needle| user.name.to_lowercase().contains(needle))
            })
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        let total = matching.len() as u64;
        let items =
            matching.into_iter().skip(page.offset() as usize).take(page.limit as usize).collect();
        Ok(UserPage { items, page: page.page, limit: page.limit, total })
    }

    /// Any active member may look up a colleague; other companies' users
    /// are reported as missing.
    pub async fn get_user(
        &self,
        context: &RequestContext,
        id: &UserId,
    ) -> Result<User, ApplicationError> {
        let actor = self.actor(context).await?;
        self.load_user(&actor, id).await
    }

    pub async fn create_user(
        &self,
        context: &RequestContext,
        new_user: NewUser,
    ) -> Result<User, ApplicationError> {
        let actor = self.admin(context).await?;
        let user = User {
            id: UserId(format!("usr-{}", Uuid::new_v4())),
            company_id: actor.company_id.clone(),
            name: new_user.name.trim().to_string(),
            email: new_user.email.trim().to_lowercase(),
            role: new_user.role,
            manager_id: new_user.manager_id,
            is_manager_approver: new_user.is_manager_approver,
            is_active: true,
            created_at: Utc::now(),
        };
        self.check_user(&user).await?;
        self.stores.users.save(user.clone()).await.map_err(persistence)?;

        info!(
            event_name = "user.created",
            correlation_id = %context.correlation_id,
            actor_id = %actor.id,
            user_id = %user.id,
            role = user.role.as_str(),
            "user created"
        );
        Ok(user)
    }

    /// Creates or replaces a user of the admin's company.
    pub async fn save_user(
        &self,
        context: &RequestContext,
        mut user: User,
    ) -> Result<User, ApplicationError> {
        let actor = self.admin(context).await?;
        if user.company_id != actor.company_id {
            return Err(unauthorized("admins can only manage users of their own company"));
        }
        if let Some(existing) = self.stores.users.find_by_id(&user.id).await.map_err(persistence)? {
            if existing.company_id != actor.company_id {
                return Err(unauthorized("admins can only manage users of their own company"));
            }
            user.created_at = existing.created_at;
        }
        user.email = user.email.trim().to_lowercase();
        self.check_user(&user).await?;
        self.stores.users.save(user.clone()).await.map_err(persistence)?;

        info!(
            event_name = "user.saved",
            correlation_id = %context.correlation_id,
            actor_id = %actor.id,
            user_id = %user.id,
            role = user.role.as_str(),
            "user saved"
        );
        Ok(user)
    }

    /// Soft delete. Users who still manage active reports stay active, and
    /// admins cannot deactivate themselves.
    pub async fn deactivate_user(
        &self,
        context: &RequestContext,
        id: &UserId,
    ) -> Result<User, ApplicationError> {
        let actor = self.admin(context).await?;
        if &actor.id == id {
            return Err(DomainError::InvariantViolation(
                "admins cannot deactivate themselves".to_string(),
            )
            .into());
        }
        let mut user = self.load_user(&actor, id).await?;
        let reports = self.stores.users.list_direct_reports(id).await.map_err(persistence)?;
        if !reports.is_empty() {
            return Err(DomainError::InvariantViolation(format!(
                "user `{id}` still manages {} active user(s)",
                reports.len()
            ))
            .into());
        }

        user.is_active = false;
        self.stores.users.save(user.clone()).await.map_err(persistence)?;

        info!(
            event_name = "user.deactivated",
            correlation_id = %context.correlation_id,
            actor_id = %actor.id,
            user_id = %user.id,
            "user deactivated"
        );
        Ok(user)
    }

    async fn actor(&self, context: &RequestContext) -> Result<User, ApplicationError> {
        match self.stores.users.find_by_id(&context.actor_id).await.map_err(persistence)? {
            Some(user) if user.is_active => Ok(user),
            _ => Err(unauthorized(&format!("`{}` is not an active user", context.actor_id))),
        }
    }

    async fn approver(&self, context: &RequestContext) -> Result<User, ApplicationError> {
        let actor = self.actor(context).await?;
        if !actor.role.can_approve() {
            return Err(unauthorized("only managers and admins can view approval rules"));
        }
        Ok(actor)
    }

    async fn admin(&self, context: &RequestContext) -> Result<User, ApplicationError> {
        let actor = self.actor(context).await?;
        if actor.role != UserRole::Admin {
            return Err(unauthorized("only admins can perform this action"));
        }
        Ok(actor)
    }

    async fn company(&self, id: &CompanyId) -> Result<Company, ApplicationError> {
        self.stores
            .companies
            .find_by_id(id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| ApprovalError::not_found("company", id.0.clone()).into())
    }

    async fn company_scope(&self, company_id: &CompanyId) -> Result<CompanyScope, ApplicationError> {
        let users = self.stores.users.list_by_company(company_id).await.map_err(persistence)?;
        let rules =
            self.stores.rules.list_active_by_company(company_id).await.map_err(persistence)?;
        Ok(CompanyScope { directory: Directory::new(users), rules })
    }

    /// Other companies' expenses are reported as missing.
    async fn load_expense(&self, actor: &User, id: &ExpenseId) -> Result<Expense, ApplicationError> {
        match self.stores.expenses.find_by_id(id).await.map_err(persistence)? {
            Some(expense) if expense.company_id == actor.company_id => Ok(expense),
            _ => Err(ApprovalError::not_found("expense", id.0.clone()).into()),
        }
    }

    async fn load_rule(&self, actor: &User, id: &RuleId) -> Result<ApprovalRule, ApplicationError> {
        match self.stores.rules.find_by_id(id).await.map_err(persistence)? {
            Some(rule) if rule.company_id == actor.company_id => Ok(rule),
            _ => Err(ApprovalError::not_found("rule", id.0.clone()).into()),
        }
    }

    async fn load_user(&self, actor: &User, id: &UserId) -> Result<User, ApplicationError> {
        match self.stores.users.find_by_id(id).await.map_err(persistence)? {
            Some(user) if user.company_id == actor.company_id => Ok(user),
            _ => Err(ApprovalError::not_found("user", id.0.clone()).into()),
        }
    }

    /// Name, email and manager-link checks shared by create and replace.
    async fn check_user(&self, user: &User) -> Result<(), ApplicationError> {
        if user.name.trim().is_empty() {
            return Err(DomainError::InvariantViolation("user name is required".to_string()).into());
        }
        if !user.email.contains('@') {
            return Err(DomainError::InvariantViolation(format!(
                "`{}` is not an email address",
                user.email
            ))
            .into());
        }
        let holder = self.stores.users.find_by_email(&user.email).await.map_err(persistence)?;
        if holder.is_some_and(|holder| holder.id != user.id) {
            return Err(DomainError::InvariantViolation(format!(
                "another user already uses `{}`",
                user.email
            ))
            .into());
        }

        let manager = match &user.manager_id {
            Some(manager_id) => {
                self.stores.users.find_by_id(manager_id).await.map_err(persistence)?
            }
            None => None,
        };
        user.validate_manager(manager.as_ref())?;
        Ok(())
    }

    async fn active_approvers(&self, company_id: &CompanyId) -> Result<Vec<User>, ApplicationError> {
        let users = self.stores.users.list_by_company(company_id).await.map_err(persistence)?;
        Ok(users.into_iter().filter(|user| user.is_active && user.role.can_approve()).collect())
    }

    async fn ensure_rule_users(&self, rule: &ApprovalRule) -> Result<(), ApplicationError> {
        for user_id in rule.referenced_users() {
            let user = self.stores.users.find_by_id(&user_id).await.map_err(persistence)?;
            if !user.is_some_and(|user| user.company_id == rule.company_id) {
                return Err(ApprovalError::RuleMisconfigured(format!(
                    "approver `{user_id}` is not a user of company `{}`",
                    rule.company_id
                ))
                .into());
            }
        }
        Ok(())
    }

    /// `None` means the whole company.
    async fn visible_owners(
        &self,
        actor: &User,
    ) -> Result<Option<BTreeSet<UserId>>, ApplicationError> {
        match actor.role {
            UserRole::Admin => Ok(None),
            UserRole::Manager => {
                let reports =
                    self.stores.users.list_direct_reports(&actor.id).await.map_err(persistence)?;
                Ok(Some(reports.into_iter().map(|user| user.id).collect()))
            }
            UserRole::Employee => Ok(Some(BTreeSet::from([actor.id.clone()]))),
        }
    }

    async fn convert(
        &self,
        context: &RequestContext,
        amount: Decimal,
        currency: &str,
        company: &Company,
    ) -> Conversion {
        let conversion =
            convert_with_fallback(self.converter.as_ref(), amount, currency, &company.base_currency)
                .await;
        if let Some(reason) = &conversion.fallback_reason {
            warn!(
                event_name = "currency.conversion.fallback",
                correlation_id = %context.correlation_id,
                actor_id = %context.actor_id,
                from = currency,
                to = %company.base_currency,
                reason = %reason,
                "currency conversion failed; keeping original amount"
            );
        }
        conversion
    }

    fn view(&self, scope: &CompanyScope, expense: Expense) -> ExpenseView {
        // Display only: a misconfigured rule set must not hide the expense.
        let next_approver = scope.directory.get(&expense.owner_id).and_then(|owner| {
            self.engine
                .next_approver(&expense, owner, &scope.rules, &scope.directory, Utc::now())
                .ok()
                .flatten()
        });
        ExpenseView { expense, next_approver }
    }
}

fn log_decision(
    context: &RequestContext,
    expense: &Expense,
    decision: &ApprovalDecision,
    status: &ApprovalStatus,
) {
    info!(
        event_name = "expense.approval.recorded",
        correlation_id = %context.correlation_id,
        expense_id = %expense.id,
        actor_id = %decision.actor_id,
        decision = decision.decision.as_str(),
        step_level = ?decision.step_level,
        "approval decision recorded"
    );

    match status {
        ApprovalStatus::Approved { resolution } => info!(
            event_name = "expense.approved",
            correlation_id = %context.correlation_id,
            expense_id = %expense.id,
            actor_id = %decision.actor_id,
            resolution = resolution.as_str(),
            "expense approved"
        ),
        ApprovalStatus::Rejected => info!(
            event_name = "expense.rejected",
            correlation_id = %context.correlation_id,
            expense_id = %expense.id,
            actor_id = %decision.actor_id,
            "expense rejected"
        ),
        ApprovalStatus::Pending { next } => info!(
            event_name = "expense.approval.pending",
            correlation_id = %context.correlation_id,
            expense_id = %expense.id,
            actor_id = %decision.actor_id,
            next_approver = ?next.as_ref().and_then(NextApprover::single_candidate),
            "expense awaiting further approval"
        ),
    }
}

fn write_conflict(context: &RequestContext, id: &ExpenseId, attempt: u32) {
    debug!(
        event_name = "expense.write.conflict",
        correlation_id = %context.correlation_id,
        expense_id = %id,
        actor_id = %context.actor_id,
        attempt,
        "expense changed concurrently; re-evaluating"
    );
}

fn retries_exhausted(id: &ExpenseId) -> ApplicationError {
    ApprovalError::Persistence(format!(
        "expense `{id}` kept changing concurrently; gave up after {MAX_WRITE_ATTEMPTS} attempts"
    ))
    .into()
}

fn persistence(error: RepositoryError) -> ApplicationError {
    ApplicationError::Persistence(error.to_string())
}

fn unauthorized(message: &str) -> ApplicationError {
    ApprovalError::Unauthorized(message.to_string()).into()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{NaiveDate, Utc};
    use rust_decimal::Decimal;

    use expensa_core::approvals::{ApprovalError, ApprovalStatus, NextApprover, NoRulePolicy};
    use expensa_core::audit::InMemoryAuditSink;
    use expensa_core::currency::StaticRateConverter;
    use expensa_core::domain::company::Company;
    use expensa_core::domain::expense::{
        ExpenseCategory, ExpenseDraft, ExpenseId, ExpenseStatus, ExpenseUpdate,
    };
    use expensa_core::domain::rule::{
        ApprovalRule, ApprovalRuleDraft, ApprovalStep, ApprovalStepDraft, ApproverKind,
        ApproverSpec, ConditionalApprovalDraft, ConditionalKind, RuleId,
    };
    use expensa_core::domain::user::{CompanyId, User, UserId, UserRole};
    use expensa_core::errors::{ApplicationError, DomainError};
    use expensa_core::reports::ReportType;
    use expensa_db::Page;

    use super::{ExpenseFilter, ExpenseWorkflow, NewUser, RequestContext, Stores, UserFilter};

    fn id(value: &str) -> UserId {
        UserId(value.to_string())
    }

    fn ctx(actor: &str) -> RequestContext {
        RequestContext::new(id(actor), format!("req-{actor}"))
    }

    fn user(id: &str, company: &str, role: UserRole, manager: Option<&str>) -> User {
        User {
            id: UserId(id.to_string()),
            company_id: CompanyId(company.to_string()),
            name: id.to_string(),
            email: format!("{id}@example.com"),
            role,
            manager_id: manager.map(|m| UserId(m.to_string())),
            is_manager_approver: false,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    fn rule(rule_id: &str, min_amount: i64, priority: i32, steps: Vec<ApproverSpec>) -> ApprovalRule {
        let now = Utc::now();
        ApprovalRule {
            id: RuleId(rule_id.to_string()),
            company_id: CompanyId("c-1".to_string()),
            name: rule_id.to_string(),
            description: None,
            min_amount: Decimal::new(min_amount, 0),
            priority,
            steps: steps
                .into_iter()
                .enumerate()
                .map(|(index, approver)| ApprovalStep {
                    level: index as u32 + 1,
                    approver,
                    is_required: true,
                })
                .collect(),
            conditional: None,
            requires_manager_approval_first: true,
            is_active: true,
            created_by: UserId("u-admin".to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    fn draft(amount: i64, currency: &str) -> ExpenseDraft {
        ExpenseDraft {
            title: "  Client visit  ".to_string(),
            description: Some("train tickets".to_string()),
            category: ExpenseCategory::Travel,
            amount: Decimal::new(amount, 0),
            currency: currency.to_string(),
            expense_date: NaiveDate::from_ymd_opt(2026, 9, 14).expect("date"),
            receipt_id: None,
            ocr_data: None,
        }
    }

    async fn workflow_with(policy: NoRulePolicy, rules: Vec<ApprovalRule>) -> (ExpenseWorkflow, InMemoryAuditSink) {
        let stores = Stores::in_memory();
        for (company, currency) in [("c-1", "USD"), ("c-2", "EUR")] {
            stores
                .companies
                .save(Company {
                    id: CompanyId(company.to_string()),
                    name: company.to_string(),
                    country: "US".to_string(),
                    base_currency: currency.to_string(),
                    created_at: Utc::now(),
                })
                .await
                .expect("save company");
        }

        let mut employee = user("u-emp", "c-1", UserRole::Employee, Some("u-mgr"));
        employee.is_manager_approver = true;
        let users = [
            user("u-admin", "c-1", UserRole::Admin, None),
            user("u-admin-2", "c-1", UserRole::Admin, None),
            user("u-mgr", "c-1", UserRole::Manager, None),
            employee,
            user("u-emp-2", "c-1", UserRole::Employee, Some("u-mgr")),
            user("u-emp-3", "c-1", UserRole::Employee, None),
            user("u-outsider", "c-2", UserRole::Admin, None),
        ];
        for user in users {
            stores.users.save(user).await.expect("save user");
        }
        for rule in rules {
            stores.rules.save(rule).await.expect("save rule");
        }

        let converter =
            StaticRateConverter::default().with_rate("EUR", "USD", Decimal::new(11, 1));
        let sink = InMemoryAuditSink::default();
        let workflow = ExpenseWorkflow::new(stores, Arc::new(converter), Arc::new(sink.clone()), policy);
        (workflow, sink)
    }

    async fn workflow() -> (ExpenseWorkflow, InMemoryAuditSink) {
        workflow_with(
            NoRulePolicy::DefaultApprover,
            vec![
                rule("rule-standard", 0, 1, vec![ApproverSpec::Admin]),
                rule("rule-large", 500, 2, vec![ApproverSpec::Manager, ApproverSpec::Admin]),
            ],
        )
        .await
    }

    #[tokio::test]
    async fn create_converts_amount_and_routes_to_direct_manager() {
        let (workflow, sink) = workflow().await;

        let view = workflow.create_expense(&ctx("u-emp"), draft(100, "eur")).await.expect("create");

        assert_eq!(view.expense.title, "Client visit");
        assert_eq!(view.expense.currency, "EUR");
        assert_eq!(view.expense.amount_in_base_currency, Decimal::new(11_000, 2));
        assert_eq!(view.expense.base_currency, "USD");
        assert!(!view.expense.conversion_fallback);
        assert_eq!(view.expense.status, ExpenseStatus::PendingApproval);
        assert_eq!(view.next_approver, Some(NextApprover::DirectManager { manager_id: id("u-mgr") }));
        assert_eq!(view.expense.current_approver, Some(id("u-mgr")));
        assert!(sink.event_types().iter().any(|event| event == "expense.routed"));
    }

    #[tokio::test]
    async fn failed_conversion_keeps_original_amount() {
        let (workflow, _) = workflow().await;

        let view = workflow.create_expense(&ctx("u-emp-2"), draft(80, "GBP")).await.expect("create");

        assert_eq!(view.expense.amount_in_base_currency, Decimal::new(80, 0));
        assert!(view.expense.conversion_fallback);
        assert_eq!(view.expense.status, ExpenseStatus::PendingApproval);
    }

    #[tokio::test]
    async fn manager_then_admin_approve_and_admin_pays() {
        let (workflow, _) = workflow().await;
        let created = workflow.create_expense(&ctx("u-emp"), draft(1_000, "USD")).await.expect("create");
        let expense_id = created.expense.id.clone();

        let early = workflow.approve(&ctx("u-admin"), &expense_id, None).await;
        assert!(matches!(
            early,
            Err(ApplicationError::Approval(ApprovalError::Unauthorized(ref message)))
                if message.contains("direct manager first")
        ));

        let by_manager =
            workflow.approve(&ctx("u-mgr"), &expense_id, Some("ok".to_string())).await.expect("manager");
        assert!(matches!(by_manager.status, ApprovalStatus::Pending { .. }));
        assert_eq!(by_manager.decision.step_level, Some(1));

        let by_admin = workflow.approve(&ctx("u-admin"), &expense_id, None).await.expect("admin");
        assert!(matches!(by_admin.status, ApprovalStatus::Approved { .. }));
        assert_eq!(by_admin.expense.status, ExpenseStatus::Approved);
        assert_eq!(by_admin.expense.approvals.len(), 2);
        assert_eq!(by_admin.expense.version, 3);

        let by_manager_pay = workflow.mark_paid(&ctx("u-mgr"), &expense_id).await;
        assert!(matches!(
            by_manager_pay,
            Err(ApplicationError::Approval(ApprovalError::Unauthorized(_)))
        ));

        let paid = workflow.mark_paid(&ctx("u-admin"), &expense_id).await.expect("pay");
        assert_eq!(paid.status, ExpenseStatus::Paid);
        assert!(paid.paid_at.is_some());
    }

    #[tokio::test]
    async fn rejection_needs_reason_and_ends_the_expense() {
        let (workflow, _) = workflow().await;
        let created = workflow.create_expense(&ctx("u-emp-2"), draft(50, "USD")).await.expect("create");
        let expense_id = created.expense.id.clone();

        let blank = workflow.reject(&ctx("u-admin"), &expense_id, Some("   ".to_string())).await;
        assert_eq!(blank.err(), Some(ApplicationError::Approval(ApprovalError::MissingReason)));

        let rejected = workflow
            .reject(&ctx("u-admin"), &expense_id, Some("duplicate receipt".to_string()))
            .await
            .expect("reject");
        assert_eq!(rejected.status, ApprovalStatus::Rejected);
        assert_eq!(rejected.expense.rejection_reason.as_deref(), Some("duplicate receipt"));

        let late = workflow.approve(&ctx("u-admin-2"), &expense_id, None).await;
        assert!(matches!(
            late,
            Err(ApplicationError::Approval(ApprovalError::NotPendingApproval { .. }))
        ));
    }

    #[tokio::test]
    async fn owner_edits_reconvert_until_first_decision() {
        let (workflow, _) = workflow().await;
        let created = workflow.create_expense(&ctx("u-emp"), draft(100, "USD")).await.expect("create");
        let expense_id = created.expense.id.clone();

        let update = ExpenseUpdate {
            amount: Some(Decimal::new(200, 0)),
            currency: Some("EUR".to_string()),
            ..ExpenseUpdate::default()
        };
        let stranger = workflow.update_expense(&ctx("u-emp-2"), &expense_id, update.clone()).await;
        assert!(matches!(stranger, Err(ApplicationError::Domain(DomainError::InvariantViolation(_)))));

        let updated =
            workflow.update_expense(&ctx("u-emp"), &expense_id, update.clone()).await.expect("update");
        assert_eq!(updated.expense.amount_in_base_currency, Decimal::new(22_000, 2));
        assert_eq!(updated.expense.version, 2);

        workflow.approve(&ctx("u-mgr"), &expense_id, None).await.expect("manager");
        let frozen = workflow.update_expense(&ctx("u-emp"), &expense_id, update).await;
        assert!(matches!(frozen, Err(ApplicationError::Domain(DomainError::InvariantViolation(ref m))) if m.contains("approval decisions")));
        let undeletable = workflow.delete_expense(&ctx("u-emp"), &expense_id).await;
        assert!(undeletable.is_err());
    }

    #[tokio::test]
    async fn owner_can_delete_untouched_expense() {
        let (workflow, _) = workflow().await;
        let created = workflow.create_expense(&ctx("u-emp-2"), draft(30, "USD")).await.expect("create");
        let expense_id = created.expense.id.clone();

        workflow.delete_expense(&ctx("u-emp-2"), &expense_id).await.expect("delete");

        let missing = workflow.get_expense(&ctx("u-admin"), &expense_id).await;
        assert!(matches!(missing, Err(ApplicationError::Approval(ApprovalError::NotFound { .. }))));
    }

    #[tokio::test]
    async fn pending_queue_is_scoped_by_role_and_paginated() {
        let (workflow, _) = workflow().await;
        workflow.create_expense(&ctx("u-emp"), draft(10, "USD")).await.expect("emp");
        workflow.create_expense(&ctx("u-emp-2"), draft(20, "USD")).await.expect("emp 2");
        workflow.create_expense(&ctx("u-emp-3"), draft(30, "USD")).await.expect("emp 3");

        let manager = workflow.pending_approvals(&ctx("u-mgr"), Page::default()).await.expect("mgr");
        assert_eq!(manager.total, 2);
        assert!(manager.items.iter().all(|item| item.expense.owner_id != id("u-emp-3")));

        let admin = workflow.pending_approvals(&ctx("u-admin"), Page::new(1, 2)).await.expect("admin");
        assert_eq!(admin.total, 3);
        assert_eq!(admin.items.len(), 2);

        let outsider = workflow.pending_approvals(&ctx("u-outsider"), Page::default()).await.expect("c-2");
        assert_eq!(outsider.total, 0);

        let employee = workflow.pending_approvals(&ctx("u-emp"), Page::default()).await;
        assert!(matches!(employee, Err(ApplicationError::Approval(ApprovalError::Unauthorized(_)))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_approvals_on_single_step_let_exactly_one_win() {
        let (workflow, _) = workflow().await;
        let created = workflow.create_expense(&ctx("u-emp-2"), draft(40, "USD")).await.expect("create");
        let expense_id = created.expense.id.clone();

        let handles: Vec<_> = ["u-admin", "u-admin-2"]
            .into_iter()
            .map(|actor| {
                let workflow = workflow.clone();
                let expense_id = expense_id.clone();
                tokio::spawn(async move { workflow.approve(&ctx(actor), &expense_id, None).await })
            })
            .collect();

        let mut successes = 0;
        let mut not_pending = 0;
        for handle in handles {
            match handle.await.expect("task") {
                Ok(view) => {
                    successes += 1;
                    assert_eq!(view.expense.status, ExpenseStatus::Approved);
                }
                Err(ApplicationError::Approval(ApprovalError::NotPendingApproval { .. })) => {
                    not_pending += 1;
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!((successes, not_pending), (1, 1));

        let stored = workflow.get_expense(&ctx("u-admin"), &expense_id).await.expect("get");
        assert_eq!(stored.expense.approvals.len(), 1);
        assert_eq!(stored.expense.version, 2);
    }

    #[tokio::test]
    async fn no_rule_policy_reject_refuses_submission() {
        let (workflow, _) = workflow_with(NoRulePolicy::Reject, Vec::new()).await;

        let result = workflow.create_expense(&ctx("u-emp"), draft(10, "USD")).await;
        assert!(matches!(
            result,
            Err(ApplicationError::Approval(ApprovalError::RuleMisconfigured(_)))
        ));

        let queue = workflow.pending_approvals(&ctx("u-admin"), Page::default()).await.expect("queue");
        assert_eq!(queue.total, 0);
    }

    #[tokio::test]
    async fn no_rule_policy_auto_approve_skips_approvers() {
        let (workflow, _) = workflow_with(NoRulePolicy::AutoApprove, Vec::new()).await;

        let view = workflow.create_expense(&ctx("u-emp"), draft(10, "USD")).await.expect("create");
        assert_eq!(view.expense.status, ExpenseStatus::Approved);
        assert_eq!(view.next_approver, None);
    }

    fn rule_draft(approver_type: ApproverKind, approver_id: Option<&str>) -> ApprovalRuleDraft {
        ApprovalRuleDraft {
            name: "Equipment".to_string(),
            description: None,
            min_amount: Decimal::new(2_000, 0),
            priority: Some(5),
            sequential_approvers: vec![ApprovalStepDraft {
                level: 1,
                approver_type,
                approver_id: approver_id.map(id),
                is_required: None,
            }],
            conditional_approval: None,
            requires_manager_approval_first: Some(false),
            is_active: None,
        }
    }

    #[tokio::test]
    async fn rule_crud_validates_drafts_and_referenced_users() {
        let (workflow, _) = workflow().await;

        let by_manager = workflow.create_rule(&ctx("u-mgr"), rule_draft(ApproverKind::Admin, None)).await;
        assert!(matches!(by_manager, Err(ApplicationError::Approval(ApprovalError::Unauthorized(_)))));

        let foreign = workflow
            .create_rule(&ctx("u-admin"), rule_draft(ApproverKind::SpecificUser, Some("u-outsider")))
            .await;
        assert!(matches!(
            foreign,
            Err(ApplicationError::Approval(ApprovalError::RuleMisconfigured(ref m))) if m.contains("u-outsider")
        ));

        let mut bad_conditional = rule_draft(ApproverKind::Admin, None);
        bad_conditional.conditional_approval = Some(ConditionalApprovalDraft {
            enabled: true,
            kind: Some(ConditionalKind::Percentage),
            ..ConditionalApprovalDraft::default()
        });
        let invalid = workflow.create_rule(&ctx("u-admin"), bad_conditional).await;
        assert!(matches!(invalid, Err(ApplicationError::Approval(ApprovalError::RuleMisconfigured(_)))));

        let created = workflow
            .create_rule(&ctx("u-admin"), rule_draft(ApproverKind::SpecificUser, Some("u-mgr")))
            .await
            .expect("create");
        assert_eq!(created.created_by, id("u-admin"));

        let mut renamed = rule_draft(ApproverKind::Admin, None);
        renamed.name = "Equipment (admin)".to_string();
        let updated = workflow.update_rule(&ctx("u-admin-2"), &created.id, renamed).await.expect("update");
        assert_eq!(updated.name, "Equipment (admin)");
        assert_eq!(updated.created_by, id("u-admin"));
        assert_eq!(updated.created_at, created.created_at);

        let listed = workflow.list_rules(&ctx("u-mgr")).await.expect("list");
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].id, created.id);

        let hidden = workflow.get_rule(&ctx("u-outsider"), &created.id).await;
        assert!(matches!(hidden, Err(ApplicationError::Approval(ApprovalError::NotFound { .. }))));

        workflow.delete_rule(&ctx("u-admin"), &created.id).await.expect("delete");
        let gone = workflow.get_rule(&ctx("u-admin"), &created.id).await;
        assert!(matches!(gone, Err(ApplicationError::Approval(ApprovalError::NotFound { .. }))));
    }

    #[tokio::test]
    async fn available_approvers_are_active_managers_and_admins() {
        let (workflow, _) = workflow().await;

        let approvers = workflow.available_approvers(&ctx("u-admin")).await.expect("approvers");
        let ids: Vec<&str> = approvers.iter().map(|user| user.id.0.as_str()).collect();

        assert_eq!(ids, vec!["u-admin", "u-admin-2", "u-mgr"]);
    }

    #[tokio::test]
    async fn reports_and_stats_are_scoped_to_the_team() {
        let (workflow, _) = workflow().await;
        let first = workflow.create_expense(&ctx("u-emp-2"), draft(50, "USD")).await.expect("emp 2");
        workflow.create_expense(&ctx("u-emp-3"), draft(70, "USD")).await.expect("emp 3");
        workflow.approve(&ctx("u-admin"), &first.expense.id, None).await.expect("approve");

        let team = workflow
            .report(&ctx("u-mgr"), ReportType::UserExpenses, None, None)
            .await
            .expect("team report");
        assert_eq!(team.summary.count, 1);
        assert_eq!(team.by_user.as_ref().map(Vec::len), Some(1));

        let company = workflow
            .report(&ctx("u-admin"), ReportType::ApprovalAnalysis, None, None)
            .await
            .expect("company report");
        assert_eq!(company.summary.count, 2);
        assert_eq!(company.approval_rate.as_ref().map(|rate| rate.approved), Some(1));

        let inverted = workflow
            .report(
                &ctx("u-admin"),
                ReportType::ExpenseSummary,
                NaiveDate::from_ymd_opt(2026, 10, 1),
                NaiveDate::from_ymd_opt(2026, 9, 1),
            )
            .await;
        assert!(matches!(inverted, Err(ApplicationError::Domain(_))));

        let stats = workflow.approval_stats(&ctx("u-mgr")).await.expect("stats");
        assert_eq!(stats.expense_count, 1);
        assert_eq!(stats.total_in_base_currency, Decimal::new(50, 0));
    }

    #[tokio::test]
    async fn save_user_enforces_directory_invariants() {
        let (workflow, _) = workflow().await;

        let own_manager = user("u-new", "c-1", UserRole::Employee, Some("u-new"));
        let result = workflow.save_user(&ctx("u-admin"), own_manager).await;
        assert!(matches!(result, Err(ApplicationError::Domain(DomainError::InvariantViolation(_)))));

        let foreign_manager = user("u-new", "c-1", UserRole::Employee, Some("u-outsider"));
        let result = workflow.save_user(&ctx("u-admin"), foreign_manager).await;
        assert!(matches!(result, Err(ApplicationError::Domain(DomainError::InvariantViolation(ref m))) if m.contains("not in company")));

        let other_company = user("u-new", "c-2", UserRole::Employee, None);
        let result = workflow.save_user(&ctx("u-admin"), other_company).await;
        assert!(matches!(result, Err(ApplicationError::Approval(ApprovalError::Unauthorized(_)))));

        let saved = workflow
            .save_user(&ctx("u-admin"), user("u-new", "c-1", UserRole::Employee, Some("u-mgr")))
            .await
            .expect("save");
        assert_eq!(saved.manager_id, Some(id("u-mgr")));

        let by_employee = workflow.save_user(&ctx("u-emp"), user("u-x", "c-1", UserRole::Admin, None)).await;
        assert!(matches!(by_employee, Err(ApplicationError::Approval(ApprovalError::Unauthorized(_)))));
    }

    #[tokio::test]
    async fn expense_listing_follows_role_visibility_and_filters() {
        let (workflow, _) = workflow().await;
        for owner in ["u-emp", "u-emp-2", "u-emp-3"] {
            workflow.create_expense(&ctx(owner), draft(100, "usd")).await.expect("create");
        }
        let all = ExpenseFilter::default();

        let own = workflow.list_expenses(&ctx("u-emp"), &all, Page::default()).await.expect("own");
        assert_eq!(own.total, 1);
        assert!(own.items.iter().all(|view| view.expense.owner_id == id("u-emp")));

        let team = workflow.list_expenses(&ctx("u-mgr"), &all, Page::default()).await.expect("team");
        assert_eq!(team.total, 2);

        let company =
            workflow.list_expenses(&ctx("u-admin"), &all, Page::new(1, 2)).await.expect("company");
        assert_eq!(company.total, 3);
        assert_eq!(company.items.len(), 2);

        let approved = ExpenseFilter { status: Some(ExpenseStatus::Approved), ..all.clone() };
        let none = workflow.list_expenses(&ctx("u-admin"), &approved, Page::default()).await.expect("filter");
        assert_eq!(none.total, 0);

        let september = ExpenseFilter {
            category: Some(ExpenseCategory::Travel),
            start: NaiveDate::from_ymd_opt(2026, 9, 1),
            end: NaiveDate::from_ymd_opt(2026, 9, 14),
            ..all
        };
        let travel = workflow.list_expenses(&ctx("u-admin"), &september, Page::default()).await.expect("filter");
        assert_eq!(travel.total, 3);
    }

    #[tokio::test]
    async fn admins_manage_company_membership() {
        let (workflow, _) = workflow().await;
        let new_user = |email: &str| NewUser {
            name: "  New Hire ".to_string(),
            email: email.to_string(),
            role: UserRole::Employee,
            manager_id: Some(id("u-mgr")),
            is_manager_approver: true,
        };

        let created =
            workflow.create_user(&ctx("u-admin"), new_user("New.Hire@Example.com")).await.expect("create");
        assert!(created.id.0.starts_with("usr-"));
        assert_eq!(created.name, "New Hire");
        assert_eq!(created.email, "new.hire@example.com");
        assert_eq!(created.company_id, CompanyId("c-1".to_string()));
        assert!(created.is_active);

        let duplicate = workflow.create_user(&ctx("u-admin"), new_user("U-EMP@example.com")).await;
        assert!(matches!(duplicate, Err(ApplicationError::Domain(DomainError::InvariantViolation(ref m))) if m.contains("already uses")));
        let by_manager = workflow.create_user(&ctx("u-mgr"), new_user("x@example.com")).await;
        assert!(matches!(by_manager, Err(ApplicationError::Approval(ApprovalError::Unauthorized(_)))));

        let employees = UserFilter { role: Some(UserRole::Employee), search: None };
        let page = workflow.list_users(&ctx("u-admin"), &employees, Page::default()).await.expect("list");
        assert_eq!(page.total, 4);
        let search = UserFilter { role: None, search: Some("EMP-".to_string()) };
        let page = workflow.list_users(&ctx("u-admin"), &search, Page::default()).await.expect("search");
        assert_eq!(page.total, 2);

        let fetched = workflow.get_user(&ctx("u-emp"), &created.id).await.expect("colleague");
        assert_eq!(fetched.id, created.id);
        let foreign = workflow.get_user(&ctx("u-admin"), &id("u-outsider")).await;
        assert!(matches!(foreign, Err(ApplicationError::Approval(ApprovalError::NotFound { .. }))));

        let managers = workflow.list_managers(&ctx("u-emp")).await.expect("managers");
        let names: Vec<&str> = managers.iter().map(|user| user.name.as_str()).collect();
        assert_eq!(names, vec!["u-admin", "u-admin-2", "u-mgr"]);

        let still_managing = workflow.deactivate_user(&ctx("u-admin"), &id("u-mgr")).await;
        assert!(matches!(still_managing, Err(ApplicationError::Domain(DomainError::InvariantViolation(ref m))) if m.contains("manages")));
        let self_service = workflow.deactivate_user(&ctx("u-admin"), &id("u-admin")).await;
        assert!(matches!(self_service, Err(ApplicationError::Domain(_))));

        let deactivated =
            workflow.deactivate_user(&ctx("u-admin"), &created.id).await.expect("deactivate");
        assert!(!deactivated.is_active);
        let reloaded = workflow.get_user(&ctx("u-admin"), &created.id).await.expect("still listed");
        assert!(!reloaded.is_active);
    }

    #[tokio::test]
    async fn unknown_or_inactive_actor_is_unauthorized() {
        let (workflow, _) = workflow().await;
        let mut inactive = user("u-gone", "c-1", UserRole::Admin, None);
        inactive.is_active = false;
        workflow.stores().users.save(inactive).await.expect("save");

        for actor in ["u-ghost", "u-gone"] {
            let result = workflow.pending_approvals(&ctx(actor), Page::default()).await;
            assert!(matches!(result, Err(ApplicationError::Approval(ApprovalError::Unauthorized(_)))));
        }
        let missing = workflow.get_expense(&ctx("u-admin"), &ExpenseId("exp-none".to_string())).await;
        assert!(missing.is_err());
    }
}
