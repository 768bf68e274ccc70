use axum::{
    body::Body,
    extract::State,
    http::{Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{error::AppError, state::AppState};

/// Extracts the bearer token from the `Authorization` header.
fn extract_bearer_token(request: &Request<Body>) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let (scheme, token) = value.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|token| !token.is_empty())
}

/// A middleware that requires a valid access token.
///
/// On success the caller's `Principal` is inserted into the request
/// extensions. Any failure is answered with 401 before the handler runs.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let principal = match extract_bearer_token(&request) {
        Some(token) => state.sessions.authenticate(token),
        None => {
            tracing::debug!("No bearer token on protected route");
            Err(AppError::TokenInvalidOrExpired)
        }
    };

    match principal {
        Ok(principal) => {
            tracing::debug!(user_id = %principal.user_id, "Request authenticated");
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}
