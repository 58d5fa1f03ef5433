use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompanyId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for CompanyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Employee,
    Manager,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Employee => "employee",
            Self::Manager => "manager",
            Self::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "employee" => Some(Self::Employee),
            "manager" => Some(Self::Manager),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn can_approve(&self) -> bool {
        matches!(self, Self::Manager | Self::Admin)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub company_id: CompanyId,
    pub name: String,
    pub email: String,
    pub role: UserRole,
    pub manager_id: Option<UserId>,
    /// When set, the direct manager must act before any rule-based approver.
    pub is_manager_approver: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    pub fn is_active_admin_of(&self, company_id: &CompanyId) -> bool {
        self.is_active && self.is_admin() && &self.company_id == company_id
    }

    /// Checks the manager link against the directory invariants: no
    /// self-management and the manager belongs to the same company.
    pub fn validate_manager(&self, manager: Option<&User>) -> Result<(), DomainError> {
        let Some(manager_id) = &self.manager_id else {
            return Ok(());
        };

        if manager_id == &self.id {
            return Err(DomainError::InvariantViolation(format!(
                "user `{}` cannot be their own manager",
                self.id
            )));
        }

        match manager {
            Some(manager) if &manager.id == manager_id => {
                if manager.company_id != self.company_id {
                    return Err(DomainError::InvariantViolation(format!(
                        "manager `{manager_id}` is not in company `{}`",
                        self.company_id
                    )));
                }
                Ok(())
            }
            _ => Err(DomainError::InvariantViolation(format!(
                "manager `{manager_id}` not found in company `{}`",
                self.company_id
            ))),
        }
    }
}
