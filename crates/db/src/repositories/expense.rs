use std::collections::BTreeSet;

use sqlx::{QueryBuilder, Sqlite};

use expensa_core::domain::expense::{
    ApprovalDecision, Decision, Expense, ExpenseCategory, ExpenseId, ExpenseStatus,
};
use expensa_core::domain::rule::RuleId;
use expensa_core::domain::user::{CompanyId, UserId};

use super::decode::{column, date, decimal, optional_timestamp, timestamp, unknown};
use super::{ExpenseRepository, Page, RepositoryError};
use crate::DbPool;

const EXPENSE_COLUMNS: &str = "id, company_id, owner_id, title, description, category, amount,
                               currency, amount_in_base_currency, base_currency,
                               conversion_fallback, expense_date, receipt_id, ocr_data, status,
                               current_approver, submitted_at, approved_at, rejected_at, paid_at,
                               rejection_reason, approval_notes, version, created_at, updated_at";

pub struct SqlExpenseRepository {
    pool: DbPool,
}

impl SqlExpenseRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_trail(&self, expense_id: &str) -> Result<Vec<ApprovalDecision>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT actor_id, decision, step_level, rule_id, notes, decided_at
             FROM expense_approvals
             WHERE expense_id = ?
             ORDER BY sequence ASC",
        )
        .bind(expense_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_decision).collect()
    }

    async fn hydrate(
        &self,
        rows: Vec<sqlx::sqlite::SqliteRow>,
    ) -> Result<Vec<Expense>, RepositoryError> {
        let mut expenses = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut expense = row_to_expense(row)?;
            expense.approvals = self.load_trail(&expense.id.0).await?;
            expenses.push(expense);
        }
        Ok(expenses)
    }
}

fn row_to_decision(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalDecision, RepositoryError> {
    let decision: String = column(row, "decision")?;
    let step_level: Option<i64> = column(row, "step_level")?;
    let rule_id: Option<String> = column(row, "rule_id")?;
    let decided_at: String = column(row, "decided_at")?;

    Ok(ApprovalDecision {
        actor_id: UserId(column(row, "actor_id")?),
        decision: Decision::parse(&decision).ok_or_else(|| unknown("decision", &decision))?,
        step_level: step_level
            .map(|level| u32::try_from(level).map_err(|_| unknown("step_level", &level.to_string())))
            .transpose()?,
        rule_id: rule_id.map(RuleId),
        notes: column(row, "notes")?,
        decided_at: timestamp("decided_at", &decided_at)?,
    })
}

fn row_to_expense(row: &sqlx::sqlite::SqliteRow) -> Result<Expense, RepositoryError> {
    let category: String = column(row, "category")?;
    let status: String = column(row, "status")?;
    let amount: String = column(row, "amount")?;
    let amount_in_base: String = column(row, "amount_in_base_currency")?;
    let expense_date: String = column(row, "expense_date")?;
    let ocr_data: Option<String> = column(row, "ocr_data")?;
    let current_approver: Option<String> = column(row, "current_approver")?;
    let created_at: String = column(row, "created_at")?;
    let updated_at: String = column(row, "updated_at")?;

    Ok(Expense {
        id: ExpenseId(column(row, "id")?),
        company_id: CompanyId(column(row, "company_id")?),
        owner_id: UserId(column(row, "owner_id")?),
        title: column(row, "title")?,
        description: column(row, "description")?,
        category: ExpenseCategory::parse(&category)
            .ok_or_else(|| unknown("category", &category))?,
        amount: decimal("amount", &amount)?,
        currency: column(row, "currency")?,
        amount_in_base_currency: decimal("amount_in_base_currency", &amount_in_base)?,
        base_currency: column(row, "base_currency")?,
        conversion_fallback: column(row, "conversion_fallback")?,
        expense_date: date("expense_date", &expense_date)?,
        receipt_id: column(row, "receipt_id")?,
        ocr_data: ocr_data
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| RepositoryError::Decode(format!("ocr_data: {e}")))?,
        status: ExpenseStatus::parse(&status).ok_or_else(|| unknown("status", &status))?,
        current_approver: current_approver.map(UserId),
        submitted_at: optional_timestamp("submitted_at", column(row, "submitted_at")?)?,
        approved_at: optional_timestamp("approved_at", column(row, "approved_at")?)?,
        rejected_at: optional_timestamp("rejected_at", column(row, "rejected_at")?)?,
        paid_at: optional_timestamp("paid_at", column(row, "paid_at")?)?,
        rejection_reason: column(row, "rejection_reason")?,
        approval_notes: column(row, "approval_notes")?,
        approvals: Vec::new(),
        version: column(row, "version")?,
        created_at: timestamp("created_at", &created_at)?,
        updated_at: timestamp("updated_at", &updated_at)?,
    })
}

fn ocr_json(expense: &Expense) -> Result<Option<String>, RepositoryError> {
    expense
        .ocr_data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| RepositoryError::Decode(format!("ocr_data: {e}")))
}

fn push_owner_filter(builder: &mut QueryBuilder<'_, Sqlite>, owners: Option<&BTreeSet<UserId>>) {
    let Some(owners) = owners else {
        return;
    };
    if owners.is_empty() {
        builder.push(" AND 0");
        return;
    }

    builder.push(" AND owner_id IN (");
    let mut separated = builder.separated(", ");
    for owner in owners {
        separated.push_bind(owner.0.clone());
    }
    separated.push_unseparated(")");
}

async fn append_decisions(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    expense: &Expense,
) -> Result<(), RepositoryError> {
    let stored: i64 =
        sqlx::query_scalar("SELECT COUNT(1) FROM expense_approvals WHERE expense_id = ?")
            .bind(&expense.id.0)
            .fetch_one(&mut **tx)
            .await?;
    let stored = usize::try_from(stored).unwrap_or_default();

    for (sequence, decision) in expense.approvals.iter().enumerate().skip(stored) {
        sqlx::query(
            "INSERT INTO expense_approvals (expense_id, sequence, actor_id, decision, step_level,
                                            rule_id, notes, decided_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&expense.id.0)
        .bind(sequence as i64)
        .bind(&decision.actor_id.0)
        .bind(decision.decision.as_str())
        .bind(decision.step_level.map(i64::from))
        .bind(decision.rule_id.as_ref().map(|id| id.0.as_str()))
        .bind(&decision.notes)
        .bind(decision.decided_at.to_rfc3339())
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

#[async_trait::async_trait]
impl ExpenseRepository for SqlExpenseRepository {
    async fn find_by_id(&self, id: &ExpenseId) -> Result<Option<Expense>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {EXPENSE_COLUMNS} FROM expenses WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut expense = row_to_expense(&row)?;
        expense.approvals = self.load_trail(&expense.id.0).await?;
        Ok(Some(expense))
    }

    async fn insert(&self, expense: Expense) -> Result<(), RepositoryError> {
        let ocr_data = ocr_json(&expense)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO expenses ({EXPENSE_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&expense.id.0)
        .bind(&expense.company_id.0)
        .bind(&expense.owner_id.0)
        .bind(&expense.title)
        .bind(&expense.description)
        .bind(expense.category.as_str())
        .bind(expense.amount.to_string())
        .bind(&expense.currency)
        .bind(expense.amount_in_base_currency.to_string())
        .bind(&expense.base_currency)
        .bind(expense.conversion_fallback)
        .bind(expense.expense_date.format("%Y-%m-%d").to_string())
        .bind(&expense.receipt_id)
        .bind(ocr_data)
        .bind(expense.status.as_str())
        .bind(expense.current_approver.as_ref().map(|id| id.0.as_str()))
        .bind(expense.submitted_at.map(|dt| dt.to_rfc3339()))
        .bind(expense.approved_at.map(|dt| dt.to_rfc3339()))
        .bind(expense.rejected_at.map(|dt| dt.to_rfc3339()))
        .bind(expense.paid_at.map(|dt| dt.to_rfc3339()))
        .bind(&expense.rejection_reason)
        .bind(&expense.approval_notes)
        .bind(expense.version)
        .bind(expense.created_at.to_rfc3339())
        .bind(expense.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        append_decisions(&mut tx, &expense).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn compare_and_swap(&self, mut expense: Expense) -> Result<Expense, RepositoryError> {
        let ocr_data = ocr_json(&expense)?;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE expenses SET
                 title = ?, description = ?, category = ?, amount = ?, currency = ?,
                 amount_in_base_currency = ?, base_currency = ?, conversion_fallback = ?,
                 expense_date = ?, receipt_id = ?, ocr_data = ?, status = ?,
                 current_approver = ?, submitted_at = ?, approved_at = ?, rejected_at = ?,
                 paid_at = ?, rejection_reason = ?, approval_notes = ?, updated_at = ?,
                 version = version + 1
             WHERE id = ? AND version = ?",
        )
        .bind(&expense.title)
        .bind(&expense.description)
        .bind(expense.category.as_str())
        .bind(expense.amount.to_string())
        .bind(&expense.currency)
        .bind(expense.amount_in_base_currency.to_string())
        .bind(&expense.base_currency)
        .bind(expense.conversion_fallback)
        .bind(expense.expense_date.format("%Y-%m-%d").to_string())
        .bind(&expense.receipt_id)
        .bind(ocr_data)
        .bind(expense.status.as_str())
        .bind(expense.current_approver.as_ref().map(|id| id.0.as_str()))
        .bind(expense.submitted_at.map(|dt| dt.to_rfc3339()))
        .bind(expense.approved_at.map(|dt| dt.to_rfc3339()))
        .bind(expense.rejected_at.map(|dt| dt.to_rfc3339()))
        .bind(expense.paid_at.map(|dt| dt.to_rfc3339()))
        .bind(&expense.rejection_reason)
        .bind(&expense.approval_notes)
        .bind(expense.updated_at.to_rfc3339())
        .bind(&expense.id.0)
        .bind(expense.version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict {
                entity: "expense",
                id: expense.id.0.clone(),
                expected_version: expense.version,
            });
        }

        append_decisions(&mut tx, &expense).await?;
        tx.commit().await?;

        expense.version += 1;
        Ok(expense)
    }

    async fn delete(&self, id: &ExpenseId, expected_version: i64) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM expenses WHERE id = ? AND version = ?")
            .bind(&id.0)
            .bind(expected_version)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict {
                entity: "expense",
                id: id.0.clone(),
                expected_version,
            });
        }
        Ok(())
    }

    async fn list_by_company(
        &self,
        company_id: &CompanyId,
        owners: Option<&BTreeSet<UserId>>,
    ) -> Result<Vec<Expense>, RepositoryError> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {EXPENSE_COLUMNS} FROM expenses WHERE company_id = "
        ));
        builder.push_bind(company_id.0.clone());
        push_owner_filter(&mut builder, owners);
        builder.push(" ORDER BY created_at DESC, id ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        self.hydrate(rows).await
    }

    async fn list_pending(
        &self,
        company_id: &CompanyId,
        owners: Option<&BTreeSet<UserId>>,
        page: Page,
    ) -> Result<Vec<Expense>, RepositoryError> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {EXPENSE_COLUMNS} FROM expenses WHERE status = 'pending_approval' AND company_id = "
        ));
        builder.push_bind(company_id.0.clone());
        push_owner_filter(&mut builder, owners);
        builder.push(" ORDER BY submitted_at ASC, id ASC LIMIT ");
        builder.push_bind(i64::from(page.limit));
        builder.push(" OFFSET ");
        builder.push_bind(i64::from(page.offset()));

        let rows = builder.build().fetch_all(&self.pool).await?;
        self.hydrate(rows).await
    }

    async fn count_pending(
        &self,
        company_id: &CompanyId,
        owners: Option<&BTreeSet<UserId>>,
    ) -> Result<u64, RepositoryError> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(1) FROM expenses WHERE status = 'pending_approval' AND company_id = ",
        );
        builder.push_bind(company_id.0.clone());
        push_owner_filter(&mut builder, owners);

        let count: i64 = builder.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}
