use expensa_core::domain::company::Company;
use expensa_core::domain::user::CompanyId;

use super::decode::{column, timestamp};
use super::{CompanyRepository, RepositoryError};
use crate::DbPool;

pub struct SqlCompanyRepository {
    pool: DbPool,
}

impl SqlCompanyRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_company(row: &sqlx::sqlite::SqliteRow) -> Result<Company, RepositoryError> {
    let created_at: String = column(row, "created_at")?;
    Ok(Company {
        id: CompanyId(column(row, "id")?),
        name: column(row, "name")?,
        country: column(row, "country")?,
        base_currency: column(row, "base_currency")?,
        created_at: timestamp("created_at", &created_at)?,
    })
}

#[async_trait::async_trait]
impl CompanyRepository for SqlCompanyRepository {
    async fn find_by_id(&self, id: &CompanyId) -> Result<Option<Company>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, name, country, base_currency, created_at FROM companies WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_company).transpose()
    }

    async fn save(&self, company: Company) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO companies (id, name, country, base_currency, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 country = excluded.country,
                 base_currency = excluded.base_currency",
        )
        .bind(&company.id.0)
        .bind(&company.name)
        .bind(&company.country)
        .bind(&company.base_currency)
        .bind(company.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
