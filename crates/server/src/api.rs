//! JSON surface over [`ExpenseWorkflow`]. The caller is identified by the
//! `x-actor-id` header set by the upstream auth layer.

use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use expensa_core::domain::expense::{
    Expense, ExpenseCategory, ExpenseDraft, ExpenseId, ExpenseStatus, ExpenseUpdate,
};
use expensa_core::domain::rule::{ApprovalRule, ApprovalRuleDraft, RuleId};
use expensa_core::domain::user::{CompanyId, User, UserId, UserRole};
use expensa_core::errors::{ApplicationError, InterfaceError};
use expensa_core::reports::{Report, ReportType};
use expensa_db::Page;

use crate::workflow::{
    ApprovalStats, DecisionView, ExpenseFilter, ExpensePage, ExpenseView, ExpenseWorkflow, NewUser,
    RequestContext, UserFilter, UserPage,
};

pub const ACTOR_HEADER: &str = "x-actor-id";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ApiState {
    workflow: ExpenseWorkflow,
}

pub fn router(workflow: ExpenseWorkflow) -> Router {
    Router::new()
        .route("/api/v1/expenses", get(list_expenses).post(create_expense))
        .route(
            "/api/v1/expenses/{id}",
            get(get_expense).patch(update_expense).delete(delete_expense),
        )
        .route("/api/v1/expenses/{id}/approve", post(approve_expense))
        .route("/api/v1/expenses/{id}/reject", post(reject_expense))
        .route("/api/v1/expenses/{id}/pay", post(pay_expense))
        .route("/api/v1/approvals/pending", get(pending_approvals))
        .route("/api/v1/approvals/stats", get(approval_stats))
        .route("/api/v1/rules", get(list_rules).post(create_rule))
        .route("/api/v1/rules/approvers", get(available_approvers))
        .route("/api/v1/rules/{id}", get(get_rule).put(update_rule).delete(delete_rule))
        .route("/api/v1/reports/{report_type}", get(report))
        .route("/api/v1/users", get(list_users).post(create_user))
        .route("/api/v1/users/managers", get(list_managers))
        .route("/api/v1/users/{id}", get(get_user).put(save_user).delete(deactivate_user))
        .with_state(ApiState { workflow })
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl ApiError {
    fn bad_request(code: &'static str, message: impl Into<String>, correlation_id: &str) -> Self {
        Self(InterfaceError::BadRequest {
            code,
            message: message.into(),
            correlation_id: correlation_id.to_string(),
        })
    }

    fn from_application(error: ApplicationError, context: &RequestContext) -> Self {
        Self(error.into_interface(context.correlation_id.clone()))
    }

    fn status(&self) -> StatusCode {
        match &self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::Forbidden { .. } => StatusCode::FORBIDDEN,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
            InterfaceError::Unprocessable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(
                event_name = "api.request.failed",
                correlation_id = %self.0.correlation_id(),
                code = self.0.code(),
                error = %self.0,
                "request failed"
            );
        } else {
            warn!(
                event_name = "api.request.refused",
                correlation_id = %self.0.correlation_id(),
                code = self.0.code(),
                error = %self.0,
                "request refused"
            );
        }

        let body = ErrorBody { error: self.0.code(), message: self.0.message().to_string() };
        let mut response = (status, Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(self.0.correlation_id()) {
            response.headers_mut().insert(CORRELATION_HEADER, value);
        }
        response
    }
}

fn request_context(headers: &HeaderMap) -> Result<RequestContext, ApiError> {
    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("req-{}", Uuid::new_v4()));

    let actor = headers
        .get(ACTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match actor {
        Some(actor) => Ok(RequestContext::new(UserId(actor.to_string()), correlation_id)),
        None => Err(ApiError::bad_request(
            "missing_actor",
            format!("the `{ACTOR_HEADER}` header is required"),
            &correlation_id,
        )),
    }
}

fn query_params<T>(
    query: Result<Query<T>, QueryRejection>,
    context: &RequestContext,
) -> Result<T, ApiError> {
    query.map(|Query(value)| value).map_err(|rejection| {
        ApiError::bad_request("invalid_query", rejection.body_text(), &context.correlation_id)
    })
}

fn json_body<T>(
    body: Result<Json<T>, JsonRejection>,
    context: &RequestContext,
) -> Result<T, ApiError> {
    body.map(|Json(value)| value).map_err(|rejection| {
        ApiError::bad_request("invalid_body", rejection.body_text(), &context.correlation_id)
    })
}

/// An empty body means "all defaults".
fn optional_body<T>(body: &Bytes, context: &RequestContext) -> Result<T, ApiError>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|error| {
        ApiError::bad_request("invalid_body", error.to_string(), &context.correlation_id)
    })
}

#[derive(Debug, Default, Deserialize)]
struct ApproveBody {
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RejectBody {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    page: Option<u32>,
    limit: Option<u32>,
}

impl PageQuery {
    fn page(&self) -> Page {
        let defaults = Page::default();
        Page::new(self.page.unwrap_or(defaults.page), self.limit.unwrap_or(defaults.limit))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ExpenseQuery {
    page: Option<u32>,
    limit: Option<u32>,
    status: Option<ExpenseStatus>,
    category: Option<ExpenseCategory>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

#[derive(Debug, Default, Deserialize)]
struct UserQuery {
    page: Option<u32>,
    limit: Option<u32>,
    role: Option<UserRole>,
    search: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NewUserBody {
    name: String,
    email: String,
    #[serde(default = "employee_by_default")]
    role: UserRole,
    #[serde(default)]
    manager_id: Option<UserId>,
    #[serde(default)]
    is_manager_approver: bool,
}

fn employee_by_default() -> UserRole {
    UserRole::Employee
}

#[derive(Debug, Deserialize)]
struct UserBody {
    company_id: CompanyId,
    name: String,
    email: String,
    role: UserRole,
    #[serde(default)]
    manager_id: Option<UserId>,
    #[serde(default)]
    is_manager_approver: bool,
    #[serde(default = "active_by_default")]
    is_active: bool,
}

fn active_by_default() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct ReportQuery {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

async fn create_expense(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Result<Json<ExpenseDraft>, JsonRejection>,
) -> Result<(StatusCode, Json<ExpenseView>), ApiError> {
    let context = request_context(&headers)?;
    let draft = json_body(body, &context)?;
    let view = state
        .workflow
        .create_expense(&context, draft)
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn list_expenses(
    State(state): State<ApiState>,
    headers: HeaderMap,
    query: Result<Query<ExpenseQuery>, QueryRejection>,
) -> Result<Json<ExpensePage>, ApiError> {
    let context = request_context(&headers)?;
    let query = query_params(query, &context)?;
    let page = PageQuery { page: query.page, limit: query.limit }.page();
    let filter = ExpenseFilter {
        status: query.status,
        category: query.category,
        start: query.start,
        end: query.end,
    };

    let expenses = state
        .workflow
        .list_expenses(&context, &filter, page)
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok(Json(expenses))
}

async fn get_expense(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ExpenseView>, ApiError> {
    let context = request_context(&headers)?;
    let view = state
        .workflow
        .get_expense(&context, &ExpenseId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok(Json(view))
}

async fn update_expense(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<ExpenseUpdate>, JsonRejection>,
) -> Result<Json<ExpenseView>, ApiError> {
    let context = request_context(&headers)?;
    let update = json_body(body, &context)?;
    let view = state
        .workflow
        .update_expense(&context, &ExpenseId(id), update)
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok(Json(view))
}

async fn delete_expense(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let context = request_context(&headers)?;
    state
        .workflow
        .delete_expense(&context, &ExpenseId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn approve_expense(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<DecisionView>, ApiError> {
    let context = request_context(&headers)?;
    let ApproveBody { notes } = optional_body(&body, &context)?;
    let view = state
        .workflow
        .approve(&context, &ExpenseId(id), notes)
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok(Json(view))
}

async fn reject_expense(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<DecisionView>, ApiError> {
    let context = request_context(&headers)?;
    let RejectBody { reason } = optional_body(&body, &context)?;
    let view = state
        .workflow
        .reject(&context, &ExpenseId(id), reason)
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok(Json(view))
}

async fn pay_expense(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Expense>, ApiError> {
    let context = request_context(&headers)?;
    let expense = state
        .workflow
        .mark_paid(&context, &ExpenseId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok(Json(expense))
}

async fn pending_approvals(
    State(state): State<ApiState>,
    headers: HeaderMap,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> Result<Json<ExpensePage>, ApiError> {
    let context = request_context(&headers)?;
    let page = query_params(query, &context)?.page();

    let pending = state
        .workflow
        .pending_approvals(&context, page)
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok(Json(pending))
}

async fn approval_stats(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<ApprovalStats>, ApiError> {
    let context = request_context(&headers)?;
    let stats = state
        .workflow
        .approval_stats(&context)
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok(Json(stats))
}

async fn list_rules(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ApprovalRule>>, ApiError> {
    let context = request_context(&headers)?;
    let rules = state
        .workflow
        .list_rules(&context)
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok(Json(rules))
}

async fn create_rule(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Result<Json<ApprovalRuleDraft>, JsonRejection>,
) -> Result<(StatusCode, Json<ApprovalRule>), ApiError> {
    let context = request_context(&headers)?;
    let draft = json_body(body, &context)?;
    let rule = state
        .workflow
        .create_rule(&context, draft)
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn get_rule(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ApprovalRule>, ApiError> {
    let context = request_context(&headers)?;
    let rule = state
        .workflow
        .get_rule(&context, &RuleId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok(Json(rule))
}

async fn update_rule(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<ApprovalRuleDraft>, JsonRejection>,
) -> Result<Json<ApprovalRule>, ApiError> {
    let context = request_context(&headers)?;
    let draft = json_body(body, &context)?;
    let rule = state
        .workflow
        .update_rule(&context, &RuleId(id), draft)
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok(Json(rule))
}

async fn delete_rule(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let context = request_context(&headers)?;
    state
        .workflow
        .delete_rule(&context, &RuleId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn available_approvers(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<User>>, ApiError> {
    let context = request_context(&headers)?;
    let users = state
        .workflow
        .available_approvers(&context)
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok(Json(users))
}

async fn report(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(report_type): Path<String>,
    query: Result<Query<ReportQuery>, QueryRejection>,
) -> Result<Json<Report>, ApiError> {
    let context = request_context(&headers)?;
    let query = query_params(query, &context)?;
    let Some(report_type) = ReportType::parse(&report_type) else {
        return Err(ApiError::bad_request(
            "unknown_report_type",
            format!("`{report_type}` is not a report type"),
            &context.correlation_id,
        ));
    };

    let report = state
        .workflow
        .report(&context, report_type, query.start, query.end)
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok(Json(report))
}

async fn list_users(
    State(state): State<ApiState>,
    headers: HeaderMap,
    query: Result<Query<UserQuery>, QueryRejection>,
) -> Result<Json<UserPage>, ApiError> {
    let context = request_context(&headers)?;
    let query = query_params(query, &context)?;
    let page = PageQuery { page: query.page, limit: query.limit }.page();
    let filter = UserFilter { role: query.role, search: query.search };

    let users = state
        .workflow
        .list_users(&context, &filter, page)
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok(Json(users))
}

async fn create_user(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Result<Json<NewUserBody>, JsonRejection>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let context = request_context(&headers)?;
    let body = json_body(body, &context)?;
    let new_user = NewUser {
        name: body.name,
        email: body.email,
        role: body.role,
        manager_id: body.manager_id,
        is_manager_approver: body.is_manager_approver,
    };

    let user = state
        .workflow
        .create_user(&context, new_user)
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn list_managers(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<User>>, ApiError> {
    let context = request_context(&headers)?;
    let managers = state
        .workflow
        .list_managers(&context)
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok(Json(managers))
}

async fn get_user(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<User>, ApiError> {
    let context = request_context(&headers)?;
    let user = state
        .workflow
        .get_user(&context, &UserId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok(Json(user))
}

async fn deactivate_user(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<User>, ApiError> {
    let context = request_context(&headers)?;
    let user = state
        .workflow
        .deactivate_user(&context, &UserId(id))
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok(Json(user))
}

async fn save_user(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<UserBody>, JsonRejection>,
) -> Result<Json<User>, ApiError> {
    let context = request_context(&headers)?;
    let body = json_body(body, &context)?;
    let user = User {
        id: UserId(id),
        company_id: body.company_id,
        name: body.name,
        email: body.email,
        role: body.role,
        manager_id: body.manager_id,
        is_manager_approver: body.is_manager_approver,
        is_active: body.is_active,
        created_at: Utc::now(),
    };

    let saved = state
        .workflow
        .save_user(&context, user)
        .await
        .map_err(|error| ApiError::from_application(error, &context))?;
    Ok(Json(saved))
}
