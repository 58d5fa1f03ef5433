use sqlx::Executor;

use crate::connection::DbPool;
use crate::repositories::RepositoryError;

/// Seeded expenses and the state each one must be in after loading.
const SEED_EXPENSES: &[SeedExpenseContract] = &[
    SeedExpenseContract {
        expense_id: "exp-demo-001",
        owner_id: "u-emp",
        status: "pending_approval",
        decisions: 0,
        trail_label: "exp-demo-001-trail",
        description: "Manager-gated travel expense awaiting its first approval",
    },
    SeedExpenseContract {
        expense_id: "exp-demo-002",
        owner_id: "u-emp-2",
        status: "approved",
        decisions: 1,
        trail_label: "exp-demo-002-trail",
        description: "Small meal expense approved by the direct manager",
    },
];

const SEED_COMPANY_ID: &str = "c-acme";

const SEED_USER_IDS: &[&str] = &["u-admin", "u-cfo", "u-mgr", "u-emp", "u-emp-2"];

const SEED_RULE_IDS: &[&str] = &["rule-standard", "rule-large", "rule-executive"];

/// Demo dataset for local runs of the approval workflow.
pub struct DemoSeedDataset;

impl DemoSeedDataset {
    pub const SQL: &str = include_str!("../../../config/fixtures/demo_seed.sql");

    /// Loads the dataset. Re-running is a no-op for rows that already exist.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;

        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;

        Ok(SeedResult {
            company_id: SEED_COMPANY_ID,
            users_seeded: SEED_USER_IDS.len(),
            rules_seeded: SEED_RULE_IDS.len(),
            expenses_seeded: SEED_EXPENSES
                .iter()
                .map(|expense| ExpenseSeedInfo {
                    expense_id: expense.expense_id,
                    status: expense.status,
                    description: expense.description,
                })
                .collect(),
        })
    }

    /// Checks that every seeded row exists in the expected state.
    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        let company_exists: i64 =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM companies WHERE id = ?1)")
                .bind(SEED_COMPANY_ID)
                .fetch_one(pool)
                .await?;
        checks.push(("company", company_exists == 1));

        let users: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(1) FROM users WHERE id IN {}",
            sql_array_from_ids(SEED_USER_IDS)
        ))
        .fetch_one(pool)
        .await?;
        checks.push(("users", users == SEED_USER_IDS.len() as i64));

        let rules: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(1) FROM approval_rules WHERE id IN {} AND is_active = 1",
            sql_array_from_ids(SEED_RULE_IDS)
        ))
        .fetch_one(pool)
        .await?;
        checks.push(("rules", rules == SEED_RULE_IDS.len() as i64));

        for expense in SEED_EXPENSES {
            let in_state: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM expenses WHERE id = ?1 AND owner_id = ?2 AND status = ?3)",
            )
            .bind(expense.expense_id)
            .bind(expense.owner_id)
            .bind(expense.status)
            .fetch_one(pool)
            .await?;
            checks.push((expense.expense_id, in_state == 1));

            let decisions: i64 =
                sqlx::query_scalar("SELECT COUNT(1) FROM expense_approvals WHERE expense_id = ?1")
                    .bind(expense.expense_id)
                    .fetch_one(pool)
                    .await?;
            checks.push((expense.trail_label, decisions == expense.decisions));
        }

        let all_present = checks.iter().all(|(_, ok)| *ok);
        Ok(VerificationResult { all_present, checks })
    }

    /// Removes the seeded rows.
    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let mut tx = pool.begin().await?;

        for statement in [
            "DELETE FROM expense_approvals
             WHERE expense_id IN (SELECT id FROM expenses WHERE company_id = ?1)",
            "DELETE FROM expenses WHERE company_id = ?1",
            "DELETE FROM approval_rules WHERE company_id = ?1",
            "UPDATE users SET manager_id = NULL WHERE company_id = ?1",
            "DELETE FROM users WHERE company_id = ?1",
            "DELETE FROM companies WHERE id = ?1",
        ] {
            sqlx::query(statement).bind(SEED_COMPANY_ID).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct SeedExpenseContract {
    expense_id: &'static str,
    owner_id: &'static str,
    status: &'static str,
    decisions: i64,
    trail_label: &'static str,
    description: &'static str,
}

fn sql_array_from_ids(ids: &[&str]) -> String {
    let quoted = ids.iter().map(|id| format!("'{}'", id)).collect::<Vec<_>>().join(",");
    format!("({quoted})")
}

#[derive(Debug)]
pub struct SeedResult {
    pub company_id: &'static str,
    pub users_seeded: usize,
    pub rules_seeded: usize,
    pub expenses_seeded: Vec<ExpenseSeedInfo>,
}

#[derive(Debug)]
pub struct ExpenseSeedInfo {
    pub expense_id: &'static str,
    pub status: &'static str,
    pub description: &'static str,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}

#[cfg(test)]
mod tests {
    use expensa_core::domain::expense::{ExpenseId, ExpenseStatus};
    use expensa_core::domain::rule::ConditionalApproval;
    use expensa_core::domain::user::CompanyId;

    use super::*;
    use crate::repositories::{
        ApprovalRuleRepository, ExpenseRepository, SqlApprovalRuleRepository,
        SqlExpenseRepository,
    };
    use crate::{connect_with_settings, migrations};

    #[test]
    fn sql_fixture_is_valid() {
        assert!(!DemoSeedDataset::SQL.is_empty());
    }

    #[tokio::test]
    async fn verify_seed_contract_and_idempotency() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect to test database");
        migrations::run_pending(&pool).await.expect("run migrations");

        let first = DemoSeedDataset::load(&pool).await.expect("load seed fixtures");
        assert_eq!(first.expenses_seeded.len(), 2);
        assert!(DemoSeedDataset::verify(&pool).await.expect("verify").all_present);

        DemoSeedDataset::load(&pool).await.expect("reload seed fixtures");
        let second = DemoSeedDataset::verify(&pool).await.expect("verify again");
        assert!(second.all_present, "reloading must not duplicate rows: {:?}", second.checks);

        DemoSeedDataset::clean(&pool).await.expect("clean");
        assert!(!DemoSeedDataset::verify(&pool).await.expect("verify cleaned").all_present);
    }

    #[tokio::test]
    async fn seeded_rows_decode_through_repositories() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        DemoSeedDataset::load(&pool).await.expect("load seed fixtures");

        let rules = SqlApprovalRuleRepository::new(pool.clone())
            .list_active_by_company(&CompanyId(SEED_COMPANY_ID.to_string()))
            .await
            .expect("decode rules");
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].id.0, "rule-executive");
        assert!(matches!(
            rules[0].conditional,
            Some(ConditionalApproval::SpecificApprover { auto_approve_if_specific_approves: true, .. })
        ));

        let approved = SqlExpenseRepository::new(pool)
            .find_by_id(&ExpenseId("exp-demo-002".to_string()))
            .await
            .expect("decode expense")
            .expect("seeded expense exists");
        assert_eq!(approved.status, ExpenseStatus::Approved);
        assert_eq!(approved.approvals.len(), 1);
    }
}
