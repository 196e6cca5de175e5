//! Route definitions for the API.

use axum::{extract::DefaultBodyLimit, middleware, routing::get, Router};
use std::sync::Arc;
use utoipa_swagger_ui::SwaggerUi;

use super::handlers;
use super::middleware::auth::{auth_middleware, superuser_middleware};
use super::middleware::tracing::request_id_middleware;
use super::SharedState;
use crate::services::auth_service::AuthService;

/// Create the main API router
pub fn create_router(state: SharedState) -> Router {
    let openapi = super::openapi::build_openapi();

    Router::new()
        // Health endpoints (no auth required)
        .route("/healthz", get(handlers::health::health_check))
        .route("/healthz/", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::metrics))
        .merge(SwaggerUi::new("/swagger-ui").url("/api/v1/openapi.json", openapi))
        // Older clients call the token endpoints outside /api/v1.
        .merge(auth_routes(&state))
        .nest("/api/v1", api_v1_routes(state.clone()))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Token create (public) and destroy (needs a token).
fn auth_routes(state: &SharedState) -> Router<SharedState> {
    let auth_service = Arc::new(AuthService::new(state.db.clone()));
    handlers::auth::public_router().merge(
        handlers::auth::protected_router()
            .layer(middleware::from_fn_with_state(auth_service, auth_middleware)),
    )
}

/// API v1 routes
fn api_v1_routes(state: SharedState) -> Router<SharedState> {
    let auth_service = Arc::new(AuthService::new(state.db.clone()));

    let protected = Router::new()
        .merge(handlers::accounts::router())
        .merge(handlers::instances::router())
        .merge(handlers::images::router())
        .merge(handlers::events::router())
        .merge(handlers::reports::router())
        .merge(handlers::sysconfig::router())
        .layer(middleware::from_fn_with_state(
            auth_service.clone(),
            auth_middleware,
        ));

    // superuser_middleware authenticates on its own
    let superuser_only = handlers::users::router().layer(middleware::from_fn_with_state(
        auth_service,
        superuser_middleware,
    ));

    Router::new()
        .merge(auth_routes(&state))
        .merge(protected)
        .merge(superuser_only)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::AppState;
    use crate::cloud::mock::MockCloud;
    use crate::config::Config;
    use crate::queue::memory::MemoryQueue;
    use crate::services::task_worker::TaskDispatcher;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sqlx::postgres::PgPoolOptions;
    use tower::ServiceExt;

    fn app() -> Router {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/cloudigrade_test")
            .unwrap();
        let dispatcher = TaskDispatcher::new(Arc::new(MemoryQueue::new()), "test-");
        let state = AppState::new(
            Config::for_tests(),
            pool,
            Arc::new(MockCloud::default()),
            dispatcher,
        );
        create_router(Arc::new(state))
    }

    async fn status(method: &str, uri: &str, auth: Option<&str>) -> StatusCode {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(auth) = auth {
            request = request.header("Authorization", auth);
        }
        app()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_protected_routes_require_token() {
        for uri in [
            "/api/v1/account/",
            "/api/v1/instance/",
            "/api/v1/image/",
            "/api/v1/event/",
            "/api/v1/sysconfig/",
            "/api/v1/report/accounts/",
            "/api/v1/user/",
        ] {
            assert_eq!(status("GET", uri, None).await, StatusCode::UNAUTHORIZED, "{uri}");
        }
        assert_eq!(
            status("POST", "/api/v1/auth/token/destroy/", None).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn test_token_endpoints_served_at_both_prefixes() {
        for prefix in ["", "/api/v1"] {
            assert_eq!(
                status("POST", &format!("{prefix}/auth/token/destroy/"), None).await,
                StatusCode::UNAUTHORIZED,
                "{prefix}"
            );
            // No JSON body: rejected by the extractor, so the route exists.
            assert_eq!(
                status("POST", &format!("{prefix}/auth/token/create/"), None).await,
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "{prefix}"
            );
        }
    }

    #[tokio::test]
    async fn test_wrong_scheme_is_rejected() {
        assert_eq!(
            status("GET", "/api/v1/account/", Some("Bearer abc")).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn test_unknown_route() {
        assert_eq!(status("GET", "/api/v2/account/", None).await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_request_id_header_added() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/account/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.headers().contains_key("x-request-id"));
    }
}
