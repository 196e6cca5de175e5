//! Instance event handlers.

use axum::{
    extract::{Extension, Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

use crate::api::dto::{EventListResponse, ListQuery, Paginated};
use crate::api::middleware::auth::AuthExtension;
use crate::api::SharedState;
use crate::error::Result;
use crate::models::instance::{InstanceEvent, InstanceEventType};
use crate::services::inventory_service::InventoryService;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/event/", get(list_events))
        .route("/event/:id/", get(get_event))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EventResponse {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub machineimage_id: Uuid,
    /// power_on or power_off
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub subnet: Option<String>,
    pub instance_type: String,
    pub resourcetype: String,
}

impl From<InstanceEvent> for EventResponse {
    fn from(event: InstanceEvent) -> Self {
        let event_type = match event.event_type {
            InstanceEventType::PowerOn => "power_on",
            InstanceEventType::PowerOff => "power_off",
        };
        Self {
            id: event.id,
            instance_id: event.instance_id,
            machineimage_id: event.machineimage_id,
            event_type: event_type.to_string(),
            occurred_at: event.occurred_at,
            subnet: event.subnet,
            instance_type: event.instance_type,
            resourcetype: "AwsInstanceEvent".to_string(),
        }
    }
}

/// List instance events
#[utoipa::path(
    get,
    path = "/event/",
    context_path = "/api/v1",
    tag = "inventory",
    params(ListQuery),
    responses(
        (status = 200, description = "Events", body = EventListResponse),
        (status = 401, description = "Not authenticated")
    ),
    security(("token_auth" = []))
)]
pub async fn list_events(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthExtension>,
    Query(query): Query<ListQuery>,
) -> Result<Json<EventListResponse>> {
    let page = InventoryService::new(state.db.clone())
        .list_events(auth.owner_filter(query.user_id), query.params())
        .await?;
    Ok(Json(Paginated::from_page(page, EventResponse::from)))
}

/// Get an instance event
#[utoipa::path(
    get,
    path = "/event/{id}/",
    context_path = "/api/v1",
    tag = "inventory",
    params(("id" = Uuid, Path, description = "Event ID")),
    responses(
        (status = 200, description = "Event", body = EventResponse),
        (status = 404, description = "Event not found")
    ),
    security(("token_auth" = []))
)]
pub async fn get_event(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthExtension>,
    Path(id): Path<Uuid>,
) -> Result<Json<EventResponse>> {
    let event = InventoryService::new(state.db.clone())
        .get_event(auth.owner_filter(None), id)
        .await?;
    Ok(Json(event.into()))
}

#[derive(OpenApi)]
#[openapi(
    paths(list_events, get_event),
    components(schemas(EventResponse, EventListResponse))
)]
pub struct EventsApiDoc;
