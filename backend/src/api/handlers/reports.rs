//! Usage report handlers.

use axum::{
    extract::{Extension, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use utoipa::{IntoParams, OpenApi};
use uuid::Uuid;

use crate::api::middleware::auth::AuthExtension;
use crate::api::SharedState;
use crate::error::Result;
use crate::services::report_service::{
    AccountOverview, AccountOverviews, DailyUsage, ReportFilter, ReportService, UsageReport,
};

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/report/accounts/", get(account_overviews))
        .route("/report/instances/", get(daily_instance_usage))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ReportQuery {
    /// Start of the period (inclusive)
    pub start: DateTime<Utc>,
    /// End of the period (exclusive)
    pub end: DateTime<Utc>,
    /// Only accounts whose name contains any of these words
    pub name_pattern: Option<String>,
    pub account_id: Option<Uuid>,
    /// Superusers only: report on another user's accounts
    pub user_id: Option<Uuid>,
}

impl ReportQuery {
    fn filter(&self, auth: &AuthExtension) -> ReportFilter {
        ReportFilter {
            user_id: auth.report_user(self.user_id),
            name_pattern: self.name_pattern.clone(),
            account_id: self.account_id,
        }
    }
}

/// Per-account overview for a period
#[utoipa::path(
    get,
    path = "/report/accounts/",
    context_path = "/api/v1",
    tag = "reports",
    params(ReportQuery),
    responses(
        (status = 200, description = "Account overviews", body = AccountOverviews),
        (status = 400, description = "Invalid period")
    ),
    security(("token_auth" = []))
)]
pub async fn account_overviews(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthExtension>,
    Query(query): Query<ReportQuery>,
) -> Result<Json<AccountOverviews>> {
    let report = ReportService::new(state.db.clone())
        .get_account_overviews(&query.filter(&auth), query.start, query.end)
        .await?;
    Ok(Json(report))
}

/// Daily RHEL and OpenShift instance usage for a period
#[utoipa::path(
    get,
    path = "/report/instances/",
    context_path = "/api/v1",
    tag = "reports",
    params(ReportQuery),
    responses(
        (status = 200, description = "Daily usage", body = UsageReport),
        (status = 400, description = "Invalid period")
    ),
    security(("token_auth" = []))
)]
pub async fn daily_instance_usage(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthExtension>,
    Query(query): Query<ReportQuery>,
) -> Result<Json<UsageReport>> {
    let report = ReportService::new(state.db.clone())
        .get_daily_usage(&query.filter(&auth), query.start, query.end)
        .await?;
    Ok(Json(report))
}

#[derive(OpenApi)]
#[openapi(
    paths(account_overviews, daily_instance_usage),
    components(schemas(AccountOverview, AccountOverviews, DailyUsage, UsageReport))
)]
pub struct ReportsApiDoc;
