//! Caller identity for vutf-server.
//!
//! The API gateway verifies tokens and forwards the caller as `x-user-id`.
//! This layer only turns that header into a [`UserContext`].

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use vutf_core::UserIdentity;

/// Header set by the gateway after token verification
pub const USER_ID_HEADER: &str = "x-user-id";

/// Caller identity attached to every `/api` request
#[derive(Debug, Clone)]
pub struct UserContext {
    pub user: UserIdentity,
}

/// Identity error
#[derive(Debug)]
pub enum IdentityError {
    MissingUserId,
    InvalidUserId,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for IdentityError {
    fn into_response(self) -> Response {
        let (error, code) = match self {
            IdentityError::MissingUserId => ("Missing user ID header", "MISSING_USER_ID"),
            IdentityError::InvalidUserId => ("Invalid user ID header", "INVALID_USER_ID"),
        };

        let body = Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        });

        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}

/// Resolve the caller from `x-user-id`
pub async fn identity_middleware(
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, IdentityError> {
    let raw = request
        .headers()
        .get(USER_ID_HEADER)
        .ok_or(IdentityError::MissingUserId)?
        .to_str()
        .map_err(|_| IdentityError::InvalidUserId)?;

    let user = UserIdentity::parse(raw).map_err(|_| IdentityError::InvalidUserId)?;
    request.extensions_mut().insert(UserContext { user });

    Ok(next.run(request).await)
}
