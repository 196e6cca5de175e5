//! Machine image handlers.

use axum::{
    extract::{Extension, Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

use crate::api::dto::{ImageListResponse, ListQuery, Paginated};
use crate::api::middleware::auth::AuthExtension;
use crate::api::SharedState;
use crate::error::Result;
use crate::models::machine_image::MachineImage;
use crate::services::inventory_service::InventoryService;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/image/", get(list_images))
        .route("/image/:id/", get(get_image))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ImageResponse {
    pub id: Uuid,
    pub account_id: Uuid,
    pub ec2_ami_id: String,
    /// pending, preparing, inspecting or inspected
    pub status: String,
    pub is_encrypted: Option<bool>,
    pub platform: Option<String>,
    pub is_windows: bool,
    pub rhel: bool,
    pub openshift: bool,
    pub inspection_json: Option<String>,
    pub reference_image_id: Option<Uuid>,
    pub resourcetype: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<MachineImage> for ImageResponse {
    fn from(image: MachineImage) -> Self {
        Self {
            is_windows: image.is_windows(),
            id: image.id,
            account_id: image.account_id,
            ec2_ami_id: image.ec2_ami_id,
            status: image.status.as_str().to_string(),
            is_encrypted: image.is_encrypted,
            platform: image.platform,
            rhel: image.rhel,
            openshift: image.openshift,
            inspection_json: image.inspection_json,
            reference_image_id: image.reference_image_id,
            resourcetype: "AwsMachineImage".to_string(),
            created_at: image.created_at,
            updated_at: image.updated_at,
        }
    }
}

/// List machine images
#[utoipa::path(
    get,
    path = "/image/",
    context_path = "/api/v1",
    tag = "inventory",
    params(ListQuery),
    responses(
        (status = 200, description = "Images", body = ImageListResponse),
        (status = 401, description = "Not authenticated")
    ),
    security(("token_auth" = []))
)]
pub async fn list_images(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthExtension>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ImageListResponse>> {
    let page = InventoryService::new(state.db.clone())
        .list_images(auth.owner_filter(query.user_id), query.params())
        .await?;
    Ok(Json(Paginated::from_page(page, ImageResponse::from)))
}

/// Get a machine image
#[utoipa::path(
    get,
    path = "/image/{id}/",
    context_path = "/api/v1",
    tag = "inventory",
    params(("id" = Uuid, Path, description = "Image ID")),
    responses(
        (status = 200, description = "Image", body = ImageResponse),
        (status = 404, description = "Image not found")
    ),
    security(("token_auth" = []))
)]
pub async fn get_image(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthExtension>,
    Path(id): Path<Uuid>,
) -> Result<Json<ImageResponse>> {
    let image = InventoryService::new(state.db.clone())
        .get_image(auth.owner_filter(None), id)
        .await?;
    Ok(Json(image.into()))
}

#[derive(OpenApi)]
#[openapi(
    paths(list_images, get_image),
    components(schemas(ImageResponse, ImageListResponse))
)]
pub struct ImagesApiDoc;
