use expensa_core::domain::user::{CompanyId, User, UserId, UserRole};

use super::decode::{column, timestamp, unknown};
use super::{RepositoryError, UserRepository};
use crate::DbPool;

const USER_COLUMNS: &str = "id, company_id, name, email, role, manager_id, is_manager_approver,
                            is_active, created_at";

pub struct SqlUserRepository {
    pool: DbPool,
}

impl SqlUserRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> Result<User, RepositoryError> {
    let role: String = column(row, "role")?;
    let manager_id: Option<String> = column(row, "manager_id")?;
    let created_at: String = column(row, "created_at")?;

    Ok(User {
        id: UserId(column(row, "id")?),
        company_id: CompanyId(column(row, "company_id")?),
        name: column(row, "name")?,
        email: column(row, "email")?,
        role: UserRole::parse(&role).ok_or_else(|| unknown("role", &role))?,
        manager_id: manager_id.map(UserId),
        is_manager_approver: column(row, "is_manager_approver")?,
        is_active: column(row, "is_active")?,
        created_at: timestamp("created_at", &created_at)?,
    })
}

#[async_trait::async_trait]
impl UserRepository for SqlUserRepository {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_user).transpose()
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower(?)"
        ))
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_user).transpose()
    }

    async fn list_by_company(&self, company_id: &CompanyId) -> Result<Vec<User>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE company_id = ? ORDER BY id ASC"
        ))
        .bind(&company_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_user).collect()
    }

    async fn list_by_role(
        &self,
        company_id: &CompanyId,
        role: UserRole,
    ) -> Result<Vec<User>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE company_id = ? AND role = ? ORDER BY id ASC"
        ))
        .bind(&company_id.0)
        .bind(role.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_user).collect()
    }

    async fn list_direct_reports(&self, manager_id: &UserId) -> Result<Vec<User>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users
             WHERE manager_id = ? AND is_active = 1
             ORDER BY id ASC"
        ))
        .bind(&manager_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_user).collect()
    }

    async fn save(&self, user: User) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO users (id, company_id, name, email, role, manager_id,
                                is_manager_approver, is_active, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 email = excluded.email,
                 role = excluded.role,
                 manager_id = excluded.manager_id,
                 is_manager_approver = excluded.is_manager_approver,
                 is_active = excluded.is_active",
        )
        .bind(&user.id.0)
        .bind(&user.company_id.0)
        .bind(&user.name)
        .bind(&user.email)
        .bind(user.role.as_str())
        .bind(user.manager_id.as_ref().map(|id| id.0.as_str()))
        .bind(user.is_manager_approver)
        .bind(user.is_active)
        .bind(user.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
