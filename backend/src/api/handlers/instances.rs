//! Instance handlers.

use axum::{
    extract::{Extension, Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

use crate::api::dto::{InstanceListResponse, ListQuery, Paginated};
use crate::api::middleware::auth::AuthExtension;
use crate::api::SharedState;
use crate::error::Result;
use crate::models::instance::Instance;
use crate::services::inventory_service::InventoryService;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/instance/", get(list_instances))
        .route("/instance/:id/", get(get_instance))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct InstanceResponse {
    pub id: Uuid,
    pub account_id: Uuid,
    pub ec2_instance_id: String,
    pub region: String,
    pub resourcetype: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Instance> for InstanceResponse {
    fn from(instance: Instance) -> Self {
        Self {
            id: instance.id,
            account_id: instance.account_id,
            ec2_instance_id: instance.ec2_instance_id,
            region: instance.region,
            resourcetype: "AwsInstance".to_string(),
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }
}

/// List instances
#[utoipa::path(
    get,
    path = "/instance/",
    context_path = "/api/v1",
    tag = "inventory",
    params(ListQuery),
    responses(
        (status = 200, description = "Instances", body = InstanceListResponse),
        (status = 401, description = "Not authenticated")
    ),
    security(("token_auth" = []))
)]
pub async fn list_instances(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthExtension>,
    Query(query): Query<ListQuery>,
) -> Result<Json<InstanceListResponse>> {
    let page = InventoryService::new(state.db.clone())
        .list_instances(auth.owner_filter(query.user_id), query.params())
        .await?;
    Ok(Json(Paginated::from_page(page, InstanceResponse::from)))
}

/// Get an instance
#[utoipa::path(
    get,
    path = "/instance/{id}/",
    context_path = "/api/v1",
    tag = "inventory",
    params(("id" = Uuid, Path, description = "Instance ID")),
    responses(
        (status = 200, description = "Instance", body = InstanceResponse),
        (status = 404, description = "Instance not found")
    ),
    security(("token_auth" = []))
)]
pub async fn get_instance(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthExtension>,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>> {
    let instance = InventoryService::new(state.db.clone())
        .get_instance(auth.owner_filter(None), id)
        .await?;
    Ok(Json(instance.into()))
}

#[derive(OpenApi)]
#[openapi(
    paths(list_instances, get_instance),
    components(schemas(InstanceResponse, InstanceListResponse))
)]
pub struct InstancesApiDoc;
