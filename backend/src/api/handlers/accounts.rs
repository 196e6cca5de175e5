//! Account handlers.

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

use crate::api::dto::{AccountListResponse, ListQuery, Paginated};
use crate::api::middleware::auth::AuthExtension;
use crate::api::SharedState;
use crate::error::Result;
use crate::models::account::Account;
use crate::services::account_service::{RegisterAccountRequest, AWS_ACCOUNT_RESOURCE_TYPE};
use crate::services::inventory_service::InventoryService;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/account/", get(list_accounts).post(create_account))
        .route("/account/:id/", get(get_account).patch(update_account))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateAccountRequest {
    /// ARN of the IAM role cloudigrade may assume
    pub account_arn: String,
    pub name: Option<String>,
    /// Must be `AwsAccount` when given
    pub resourcetype: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateAccountRequest {
    pub name: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AccountResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: Option<String>,
    pub aws_account_id: String,
    pub account_arn: String,
    pub resourcetype: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Account> for AccountResponse {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            user_id: account.user_id,
            name: account.name,
            aws_account_id: account.aws_account_id,
            account_arn: account.account_arn,
            resourcetype: AWS_ACCOUNT_RESOURCE_TYPE.to_string(),
            created_at: account.created_at,
            updated_at: account.updated_at,
        }
    }
}

/// Register a new AWS account
#[utoipa::path(
    post,
    path = "/account/",
    context_path = "/api/v1",
    tag = "accounts",
    request_body = CreateAccountRequest,
    responses(
        (status = 201, description = "Account registered", body = AccountResponse),
        (status = 400, description = "Invalid ARN, already registered, or access check failed"),
        (status = 401, description = "Not authenticated")
    ),
    security(("token_auth" = []))
)]
pub async fn create_account(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthExtension>,
    Json(payload): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<AccountResponse>)> {
    let registration = state
        .create_account_service()
        .register(
            auth.user_id,
            RegisterAccountRequest {
                account_arn: payload.account_arn,
                name: payload.name,
                resourcetype: payload.resourcetype,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(registration.account.into())))
}

/// List accounts
#[utoipa::path(
    get,
    path = "/account/",
    context_path = "/api/v1",
    tag = "accounts",
    params(ListQuery),
    responses(
        (status = 200, description = "Accounts", body = AccountListResponse),
        (status = 401, description = "Not authenticated")
    ),
    security(("token_auth" = []))
)]
pub async fn list_accounts(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthExtension>,
    Query(query): Query<ListQuery>,
) -> Result<Json<AccountListResponse>> {
    let page = InventoryService::new(state.db.clone())
        .list_accounts(auth.owner_filter(query.user_id), query.params())
        .await?;
    Ok(Json(Paginated::from_page(page, AccountResponse::from)))
}

/// Get an account
#[utoipa::path(
    get,
    path = "/account/{id}/",
    context_path = "/api/v1",
    tag = "accounts",
    params(("id" = Uuid, Path, description = "Account ID")),
    responses(
        (status = 200, description = "Account", body = AccountResponse),
        (status = 404, description = "Account not found")
    ),
    security(("token_auth" = []))
)]
pub async fn get_account(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthExtension>,
    Path(id): Path<Uuid>,
) -> Result<Json<AccountResponse>> {
    let account = InventoryService::new(state.db.clone())
        .get_account(auth.owner_filter(None), id)
        .await?;
    Ok(Json(account.into()))
}

/// Rename an account
#[utoipa::path(
    patch,
    path = "/account/{id}/",
    context_path = "/api/v1",
    tag = "accounts",
    params(("id" = Uuid, Path, description = "Account ID")),
    request_body = UpdateAccountRequest,
    responses(
        (status = 200, description = "Account updated", body = AccountResponse),
        (status = 400, description = "Invalid name"),
        (status = 404, description = "Account not found")
    ),
    security(("token_auth" = []))
)]
pub async fn update_account(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthExtension>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateAccountRequest>,
) -> Result<Json<AccountResponse>> {
    let account = InventoryService::new(state.db.clone())
        .update_account_name(auth.owner_filter(None), id, payload.name)
        .await?;
    Ok(Json(account.into()))
}

#[derive(OpenApi)]
#[openapi(
    paths(create_account, list_accounts, get_account, update_account),
    components(schemas(
        CreateAccountRequest,
        UpdateAccountRequest,
        AccountResponse,
        AccountListResponse,
    ))
)]
pub struct AccountsApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_response_carries_resourcetype() {
        let now = Utc::now();
        let response = AccountResponse::from(Account {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: None,
            aws_account_id: "123456789012".into(),
            account_arn: "arn:aws:iam::123456789012:role/cloudigrade".into(),
            created_at: now,
            updated_at: now,
        });
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["resourcetype"], "AwsAccount");
        assert_eq!(json["aws_account_id"], "123456789012");
        assert!(json["name"].is_null());
    }

    #[test]
    fn test_create_request_optional_fields() {
        let req: CreateAccountRequest =
            serde_json::from_str(r#"{"account_arn": "arn:aws:iam::123456789012:role/x"}"#)
                .unwrap();
        assert!(req.name.is_none());
        assert!(req.resourcetype.is_none());
    }
}
