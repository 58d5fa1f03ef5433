use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::RepositoryError;

pub(crate) fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name).map_err(|e| RepositoryError::Decode(format!("{name}: {e}")))
}

pub(crate) fn timestamp(name: &str, value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("{name}: {e}")))
}

pub(crate) fn optional_timestamp(
    name: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|raw| timestamp(name, &raw)).transpose()
}

pub(crate) fn decimal(name: &str, value: &str) -> Result<Decimal, RepositoryError> {
    Decimal::from_str(value).map_err(|e| RepositoryError::Decode(format!("{name}: {e}")))
}

pub(crate) fn date(name: &str, value: &str) -> Result<NaiveDate, RepositoryError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| RepositoryError::Decode(format!("{name}: {e}")))
}

pub(crate) fn unknown(name: &str, value: &str) -> RepositoryError {
    RepositoryError::Decode(format!("{name}: unknown value `{value}`"))
}
