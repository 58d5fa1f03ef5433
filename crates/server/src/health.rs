use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use expensa_db::DbPool;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: Readiness,
    pub expense_store: String,
    /// Absent when the store could not be queried.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_approvals: Option<i64>,
    pub checked_at: DateTime<Utc>,
}

pub fn router(db_pool: DbPool) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let probe = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM expenses WHERE status = 'pending_approval'",
    )
    .fetch_one(&state.db_pool)
    .await;

    let (status_code, payload) = match probe {
        Ok(pending) => (
            StatusCode::OK,
            HealthResponse {
                status: Readiness::Ready,
                expense_store: "reachable".to_string(),
                pending_approvals: Some(pending),
                checked_at: Utc::now(),
            },
        ),
        Err(error) => (
            StatusCode::SERVICE_UNAVAILABLE,
            HealthResponse {
                status: Readiness::Degraded,
                expense_store: format!("query failed: {error}"),
                pending_approvals: None,
                checked_at: Utc::now(),
            },
        ),
    };
    (status_code, Json(payload))
}
