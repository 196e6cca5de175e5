//! Token authentication handlers.

use axum::{
    extract::{Extension, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use utoipa::{OpenApi, ToSchema};

use crate::api::middleware::auth::AuthExtension;
use crate::api::SharedState;
use crate::error::Result;
use crate::services::auth_service::AuthService;

/// Routes reachable without a token.
pub fn public_router() -> Router<SharedState> {
    Router::new().route("/auth/token/create/", post(create_token))
}

/// Routes that need a valid token.
pub fn protected_router() -> Router<SharedState> {
    Router::new().route("/auth/token/destroy/", post(destroy_token))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TokenCreateRequest {
    pub username: String,
    #[schema(format = Password)]
    pub password: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TokenCreateResponse {
    /// Send as `Authorization: Token <auth_token>`
    pub auth_token: String,
    pub is_superuser: bool,
}

/// Exchange credentials for an API token
#[utoipa::path(
    post,
    path = "/auth/token/create/",
    context_path = "/api/v1",
    tag = "auth",
    request_body = TokenCreateRequest,
    responses(
        (status = 200, description = "Token issued", body = TokenCreateResponse),
        (status = 401, description = "Invalid credentials")
    )
)]
pub async fn create_token(
    State(state): State<SharedState>,
    Json(payload): Json<TokenCreateRequest>,
) -> Result<Json<TokenCreateResponse>> {
    let auth_service = AuthService::new(state.db.clone());
    let user = auth_service
        .authenticate(&payload.username, &payload.password)
        .await?;
    let auth_token = auth_service.create_token(user.id).await?;

    Ok(Json(TokenCreateResponse {
        auth_token,
        is_superuser: user.is_superuser,
    }))
}

/// Revoke the caller's token
#[utoipa::path(
    post,
    path = "/auth/token/destroy/",
    context_path = "/api/v1",
    tag = "auth",
    responses(
        (status = 204, description = "Token revoked"),
        (status = 401, description = "Not authenticated")
    ),
    security(("token_auth" = []))
)]
pub async fn destroy_token(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthExtension>,
) -> Result<StatusCode> {
    AuthService::new(state.db.clone())
        .destroy_token(auth.user_id)
        .await?;
    tracing::info!(user = %auth.username, "Revoked auth token");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(OpenApi)]
#[openapi(
    paths(create_token, destroy_token),
    components(schemas(TokenCreateRequest, TokenCreateResponse))
)]
pub struct AuthApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_response_shape() {
        let json = serde_json::to_value(TokenCreateResponse {
            auth_token: "abc".into(),
            is_superuser: false,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"auth_token": "abc", "is_superuser": false}));
    }
}
