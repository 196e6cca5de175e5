//! System configuration a customer needs before registering an account.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use utoipa::{OpenApi, ToSchema};

use crate::api::SharedState;
use crate::cloud::traditional_inspection_policy;
use crate::error::Result;

pub fn router() -> Router<SharedState> {
    Router::new().route("/sysconfig/", get(get_sysconfig))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AwsPolicies {
    /// IAM policy the customer role must grant
    #[schema(value_type = Object)]
    pub traditional_inspection: serde_json::Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SysconfigResponse {
    /// Account that will assume the customer role
    pub aws_account_id: String,
    pub aws_policies: AwsPolicies,
}

/// Get system configuration
#[utoipa::path(
    get,
    path = "/sysconfig/",
    context_path = "/api/v1",
    tag = "sysconfig",
    responses(
        (status = 200, description = "System configuration", body = SysconfigResponse)
    ),
    security(("token_auth" = []))
)]
pub async fn get_sysconfig(State(state): State<SharedState>) -> Result<Json<SysconfigResponse>> {
    let aws_account_id = state.cloud.own_account_id().await?;
    Ok(Json(SysconfigResponse {
        aws_account_id,
        aws_policies: AwsPolicies {
            traditional_inspection: traditional_inspection_policy(),
        },
    }))
}

#[derive(OpenApi)]
#[openapi(
    paths(get_sysconfig),
    components(schemas(SysconfigResponse, AwsPolicies))
)]
pub struct SysconfigApiDoc;
