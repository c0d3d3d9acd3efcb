use crate::{error::ApiError, state::AppState};
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};

/// Bearer-token check for the workspace routes
///
/// Only enforced when the service is configured with a token; without one
/// every request passes, matching a deployment behind an authenticating
/// proxy.
pub async fn auth_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.api_token.as_deref() else {
        return Ok(next.run(req).await);
    };

    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match presented {
        Some(token) if token == expected => Ok(next.run(req).await),
        Some(_) => Err(ApiError::Unauthorized("Invalid API token".to_string())),
        None => Err(ApiError::Unauthorized("Missing bearer token".to_string())),
    }
}
