use expensa_core::domain::rule::{ApprovalRule, ApprovalStep, ConditionalApproval, RuleId};
use expensa_core::domain::user::{CompanyId, UserId};

use super::decode::{column, decimal, timestamp};
use super::{ApprovalRuleRepository, RepositoryError};
use crate::DbPool;

const RULE_COLUMNS: &str = "id, company_id, name, description, min_amount, priority, steps_json,
                            conditional_json, requires_manager_approval_first, is_active,
                            created_by, created_at, updated_at";

pub struct SqlApprovalRuleRepository {
    pool: DbPool,
}

impl SqlApprovalRuleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_rule(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalRule, RepositoryError> {
    let min_amount: String = column(row, "min_amount")?;
    let steps_json: String = column(row, "steps_json")?;
    let conditional_json: Option<String> = column(row, "conditional_json")?;
    let created_at: String = column(row, "created_at")?;
    let updated_at: String = column(row, "updated_at")?;

    let mut steps: Vec<ApprovalStep> = serde_json::from_str(&steps_json)
        .map_err(|e| RepositoryError::Decode(format!("steps_json: {e}")))?;
    steps.sort_by_key(|step| step.level);
    let conditional = conditional_json
        .map(|raw| serde_json::from_str::<ConditionalApproval>(&raw))
        .transpose()
        .map_err(|e| RepositoryError::Decode(format!("conditional_json: {e}")))?;

    Ok(ApprovalRule {
        id: RuleId(column(row, "id")?),
        company_id: CompanyId(column(row, "company_id")?),
        name: column(row, "name")?,
        description: column(row, "description")?,
        min_amount: decimal("min_amount", &min_amount)?,
        priority: column(row, "priority")?,
        steps,
        conditional,
        requires_manager_approval_first: column(row, "requires_manager_approval_first")?,
        is_active: column(row, "is_active")?,
        created_by: UserId(column(row, "created_by")?),
        created_at: timestamp("created_at", &created_at)?,
        updated_at: timestamp("updated_at", &updated_at)?,
    })
}

#[async_trait::async_trait]
impl ApprovalRuleRepository for SqlApprovalRuleRepository {
    async fn find_by_id(&self, id: &RuleId) -> Result<Option<ApprovalRule>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {RULE_COLUMNS} FROM approval_rules WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_rule).transpose()
    }

    async fn list_by_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalRule>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM approval_rules
             WHERE company_id = ?
             ORDER BY priority DESC, created_at DESC"
        ))
        .bind(&company_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_rule).collect()
    }

    async fn list_active_by_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalRule>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM approval_rules
             WHERE company_id = ? AND is_active = 1
             ORDER BY priority DESC, id ASC"
        ))
        .bind(&company_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_rule).collect()
    }

    async fn save(&self, rule: ApprovalRule) -> Result<(), RepositoryError> {
        let steps_json = serde_json::to_string(&rule.steps)
            .map_err(|e| RepositoryError::Decode(format!("steps_json: {e}")))?;
        let conditional_json = rule
            .conditional
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Decode(format!("conditional_json: {e}")))?;

        sqlx::query(
            "INSERT INTO approval_rules (id, company_id, name, description, min_amount, priority,
                                         steps_json, conditional_json,
                                         requires_manager_approval_first, is_active, created_by,
                                         created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 description = excluded.description,
                 min_amount = excluded.min_amount,
                 priority = excluded.priority,
                 steps_json = excluded.steps_json,
                 conditional_json = excluded.conditional_json,
                 requires_manager_approval_first = excluded.requires_manager_approval_first,
                 is_active = excluded.is_active,
                 updated_at = excluded.updated_at",
        )
        .bind(&rule.id.0)
        .bind(&rule.company_id.0)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(rule.min_amount.to_string())
        .bind(rule.priority)
        .bind(steps_json)
        .bind(conditional_json)
        .bind(rule.requires_manager_approval_first)
        .bind(rule.is_active)
        .bind(&rule.created_by.0)
        .bind(rule.created_at.to_rfc3339())
        .bind(rule.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: &RuleId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM approval_rules WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use expensa_core::domain::company::Company;
    use expensa_core::domain::rule::{
        ApprovalRule, ApprovalStep, ApproverSpec, ConditionalApproval, RuleId,
    };
    use expensa_core::domain::user::{CompanyId, UserId};

    use super::SqlApprovalRuleRepository;
    use crate::repositories::{ApprovalRuleRepository, CompanyRepository, SqlCompanyRepository};
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlCompanyRepository::new(pool.clone())
            .save(Company {
                id: CompanyId("c-1".to_string()),
                name: "Acme".to_string(),
                country: "US".to_string(),
                base_currency: "USD".to_string(),
                created_at: Utc::now(),
            })
            .await
            .expect("insert parent company");
        pool
    }

    fn sample_rule(id: &str, min_amount: i64, priority: i32) -> ApprovalRule {
        let now = Utc::now();
        ApprovalRule {
            id: RuleId(id.to_string()),
            company_id: CompanyId("c-1".to_string()),
            name: format!("Rule {id}"),
            description: None,
            min_amount: Decimal::new(min_amount, 0),
            priority,
            steps: vec![
                ApprovalStep { level: 1, approver: ApproverSpec::Manager, is_required: true },
                ApprovalStep {
                    level: 2,
                    approver: ApproverSpec::SpecificUser {
                        approver_id: UserId("u-cfo".to_string()),
                    },
                    is_required: false,
                },
            ],
            conditional: Some(ConditionalApproval::Hybrid {
                approval_percentage: Decimal::new(60, 0),
                specific_approvers: vec![UserId("u-cfo".to_string())],
            }),
            requires_manager_approval_first: true,
            is_active: true,
            created_by: UserId("u-admin".to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn save_and_find_round_trips_steps_and_conditional() {
        let repo = SqlApprovalRuleRepository::new(setup().await);
        let rule = sample_rule("R-1", 500, 2);

        repo.save(rule.clone()).await.expect("save");
        let found = repo.find_by_id(&rule.id).await.expect("find").expect("should exist");

        assert_eq!(found.steps, rule.steps);
        assert_eq!(found.conditional, rule.conditional);
        assert_eq!(found.min_amount, Decimal::new(500, 0));
    }

    #[tokio::test]
    async fn active_listing_skips_disabled_rules() {
        let repo = SqlApprovalRuleRepository::new(setup().await);
        repo.save(sample_rule("R-1", 0, 1)).await.expect("save 1");
        repo.save(sample_rule("R-2", 1000, 5)).await.expect("save 2");
        let mut disabled = sample_rule("R-3", 100, 9);
        disabled.is_active = false;
        repo.save(disabled).await.expect("save 3");

        let company = CompanyId("c-1".to_string());
        let active = repo.list_active_by_company(&company).await.expect("active");
        assert_eq!(active.iter().map(|r| r.id.0.as_str()).collect::<Vec<_>>(), ["R-2", "R-1"]);
        assert_eq!(repo.list_by_company(&company).await.expect("all").len(), 3);
    }

    #[tokio::test]
    async fn delete_reports_whether_a_row_was_removed() {
        let repo = SqlApprovalRuleRepository::new(setup().await);
        repo.save(sample_rule("R-1", 0, 1)).await.expect("save");

        assert!(repo.delete(&RuleId("R-1".to_string())).await.expect("delete"));
        assert!(!repo.delete(&RuleId("R-1".to_string())).await.expect("delete again"));
    }
}
