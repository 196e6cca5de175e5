//! Authentication middleware.
//!
//! Requests authenticate with `Authorization: Token <key>`, where the key was
//! issued by `POST /api/v1/auth/token/create/`.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::user::User;
use crate::services::auth_service::AuthService;

/// Extension that holds authenticated user information
#[derive(Debug, Clone)]
pub struct AuthExtension {
    pub user_id: Uuid,
    pub username: String,
    pub is_superuser: bool,
}

impl From<User> for AuthExtension {
    fn from(user: User) -> Self {
        Self {
            user_id: user.id,
            username: user.username,
            is_superuser: user.is_superuser,
        }
    }
}

impl AuthExtension {
    /// Owner filter for inventory queries: superusers see everything unless
    /// they ask for one user, everyone else sees only their own objects.
    pub fn owner_filter(&self, requested_user: Option<Uuid>) -> Option<Uuid> {
        if self.is_superuser {
            requested_user
        } else {
            Some(self.user_id)
        }
    }

    /// User a report is computed for. Only superusers may pick another user.
    pub fn report_user(&self, requested_user: Option<Uuid>) -> Uuid {
        match requested_user {
            Some(user_id) if self.is_superuser => user_id,
            _ => self.user_id,
        }
    }
}

/// Token extraction result
#[derive(Debug, PartialEq, Eq)]
enum ExtractedToken<'a> {
    Token(&'a str),
    None,
    Invalid,
}

fn extract_token_from_auth_header(auth_header: &str) -> ExtractedToken<'_> {
    match auth_header.strip_prefix("Token ") {
        Some(token) if !token.trim().is_empty() => ExtractedToken::Token(token.trim()),
        _ => ExtractedToken::Invalid,
    }
}

fn extract_token(request: &Request) -> ExtractedToken<'_> {
    match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        Some(auth_header) => extract_token_from_auth_header(auth_header),
        None => ExtractedToken::None,
    }
}

/// A token lookup that failed for reasons other than a bad token is a
/// server error, not an authentication failure.
fn token_rejection(err: AppError) -> Response {
    match err {
        AppError::Authentication(_) => (StatusCode::UNAUTHORIZED, "Invalid token").into_response(),
        other => {
            tracing::error!(error = %other, "Token validation failed");
            other.into_response()
        }
    }
}

async fn authenticate(
    auth_service: &AuthService,
    request: &Request,
) -> std::result::Result<AuthExtension, Response> {
    match extract_token(request) {
        ExtractedToken::Token(token) => auth_service
            .validate_token(token)
            .await
            .map(AuthExtension::from)
            .map_err(token_rejection),
        ExtractedToken::None => {
            Err((StatusCode::UNAUTHORIZED, "Authentication credentials were not provided")
                .into_response())
        }
        ExtractedToken::Invalid => {
            Err((StatusCode::UNAUTHORIZED, "Invalid authorization header format").into_response())
        }
    }
}

/// Authentication middleware function - requires valid token
pub async fn auth_middleware(
    State(auth_service): State<Arc<AuthService>>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticate(&auth_service, &request).await {
        Ok(auth_ext) => {
            request.extensions_mut().insert(auth_ext);
            next.run(request).await
        }
        Err(response) => response,
    }
}

/// Superuser-only middleware
pub async fn superuser_middleware(
    State(auth_service): State<Arc<AuthService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let auth_ext = match authenticate(&auth_service, &request).await {
        Ok(auth_ext) => auth_ext,
        Err(response) => return response,
    };

    if !auth_ext.is_superuser {
        return (StatusCode::FORBIDDEN, "Superuser access required").into_response();
    }

    request.extensions_mut().insert(auth_ext);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_extract_token_scheme() {
        assert_eq!(
            extract_token_from_auth_header("Token abc123"),
            ExtractedToken::Token("abc123")
        );
        assert_eq!(
            extract_token_from_auth_header("Bearer abc123"),
            ExtractedToken::Invalid
        );
        assert_eq!(extract_token_from_auth_header("Token "), ExtractedToken::Invalid);
    }

    #[test]
    fn test_token_rejection_status() {
        assert_eq!(
            token_rejection(AppError::Authentication("Invalid token".into())).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            token_rejection(AppError::Database("connection refused".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_extract_token_missing_header() {
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        assert_eq!(extract_token(&request), ExtractedToken::None);
    }

    fn auth(is_superuser: bool) -> AuthExtension {
        AuthExtension {
            user_id: Uuid::new_v4(),
            username: "user".into(),
            is_superuser,
        }
    }

    #[test]
    fn test_owner_filter() {
        let other = Uuid::new_v4();

        let regular = auth(false);
        assert_eq!(regular.owner_filter(None), Some(regular.user_id));
        assert_eq!(regular.owner_filter(Some(other)), Some(regular.user_id));

        let superuser = auth(true);
        assert_eq!(superuser.owner_filter(None), None);
        assert_eq!(superuser.owner_filter(Some(other)), Some(other));
    }

    #[test]
    fn test_report_user() {
        let other = Uuid::new_v4();
        let regular = auth(false);
        assert_eq!(regular.report_user(Some(other)), regular.user_id);

        let superuser = auth(true);
        assert_eq!(superuser.report_user(Some(other)), other);
        assert_eq!(superuser.report_user(None), superuser.user_id);
    }
}
