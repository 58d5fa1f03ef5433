use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::user::CompanyId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    pub name: String,
    pub country: String,
    /// Reporting currency; every rule threshold is expressed in it.
    pub base_currency: String,
    pub created_at: DateTime<Utc>,
}

/// Accepts three ASCII letters and returns the upper-cased code.
pub fn normalize_currency_code(code: &str) -> Option<String> {
    let code = code.trim();
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(code.to_ascii_uppercase())
    } else {
        None
    }
}
