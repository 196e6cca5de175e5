//! OpenAPI specification generated from handler annotations via utoipa.

use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};
use utoipa::{Modify, OpenApi};

/// Top-level OpenAPI document for the cloudigrade API.
///
/// Each handler module contributes its own paths and schemas via per-module
/// `#[derive(OpenApi)]` structs that are merged into this root document at
/// startup.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "cloudigrade API",
        description = "Tracks RHEL and OpenShift usage in customer AWS accounts.",
        version = "0.1.0",
        license(name = "GPL-3.0", url = "https://www.gnu.org/licenses/gpl-3.0.html")
    ),
    servers(
        (url = "/", description = "Current server"),
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "auth", description = "API token management"),
        (name = "accounts", description = "Cloud account registration"),
        (name = "inventory", description = "Discovered instances, images and power events"),
        (name = "reports", description = "Usage reports"),
        (name = "sysconfig", description = "Setup information for customers"),
        (name = "users", description = "User listing for superusers"),
    ),
    components(schemas(ErrorResponse))
)]
pub struct ApiDoc;

/// Standard error response body returned by all endpoints on failure.
#[derive(serde::Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g. "NOT_FOUND", "VALIDATION_ERROR")
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

/// Adds the `Authorization: Token <key>` scheme to the OpenAPI spec.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "token_auth",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "Authorization",
                    "Token <key>",
                ))),
            );
        }
    }
}

/// Build the merged OpenAPI document from all handler modules.
pub fn build_openapi() -> utoipa::openapi::OpenApi {
    let mut doc = ApiDoc::openapi();

    doc.merge(super::handlers::auth::AuthApiDoc::openapi());
    doc.merge(super::handlers::accounts::AccountsApiDoc::openapi());
    doc.merge(super::handlers::instances::InstancesApiDoc::openapi());
    doc.merge(super::handlers::images::ImagesApiDoc::openapi());
    doc.merge(super::handlers::events::EventsApiDoc::openapi());
    doc.merge(super::handlers::reports::ReportsApiDoc::openapi());
    doc.merge(super::handlers::sysconfig::SysconfigApiDoc::openapi());
    doc.merge(super::handlers::users::UsersApiDoc::openapi());

    doc
}
