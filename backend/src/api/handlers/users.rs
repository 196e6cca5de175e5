//! User listing for superusers.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

use crate::api::dto::{Paginated, PaginationQuery, UserListResponse};
use crate::api::SharedState;
use crate::error::Result;
use crate::services::inventory_service::{InventoryService, UserSummary};

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/user/", get(list_users))
        .route("/user/:id/", get(get_user))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserResponse {
    pub id: Uuid,
    pub username: String,
    pub is_superuser: bool,
    /// Number of registered cloud accounts
    pub accounts: i64,
}

impl From<UserSummary> for UserResponse {
    fn from(user: UserSummary) -> Self {
        Self {
            id: user.id,
            username: user.username,
            is_superuser: user.is_superuser,
            accounts: user.accounts,
        }
    }
}

/// List users
#[utoipa::path(
    get,
    path = "/user/",
    context_path = "/api/v1",
    tag = "users",
    params(PaginationQuery),
    responses(
        (status = 200, description = "Users", body = UserListResponse),
        (status = 403, description = "Superuser required")
    ),
    security(("token_auth" = []))
)]
pub async fn list_users(
    State(state): State<SharedState>,
    Query(query): Query<PaginationQuery>,
) -> Result<Json<UserListResponse>> {
    let page = InventoryService::new(state.db.clone())
        .list_users(query.params())
        .await?;
    Ok(Json(Paginated::from_page(page, UserResponse::from)))
}

/// Get a user
#[utoipa::path(
    get,
    path = "/user/{id}/",
    context_path = "/api/v1",
    tag = "users",
    params(("id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "User", body = UserResponse),
        (status = 403, description = "Superuser required"),
        (status = 404, description = "User not found")
    ),
    security(("token_auth" = []))
)]
pub async fn get_user(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<UserResponse>> {
    let user = InventoryService::new(state.db.clone()).get_user(id).await?;
    Ok(Json(user.into()))
}

#[derive(OpenApi)]
#[openapi(
    paths(list_users, get_user),
    components(schemas(UserResponse, UserListResponse))
)]
pub struct UsersApiDoc;
