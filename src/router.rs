use axum::{
    Router,
    http::{HeaderValue, header},
    middleware::from_fn_with_state,
    routing::{get, post},
};
use tower_cookies::CookieManagerLayer;
use tower_http::{
    set_header::SetResponseHeaderLayer,
    trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::{handlers, middleware_layer, state::AppState};

/// Builds the `/auth` router.
///
/// Rate limiting and CORS depend on the serving context and are layered by
/// the binary.
pub fn app(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/auth/logout", post(handlers::auth::logout));

    let protected_routes = Router::new()
        .route("/auth/me", get(handlers::auth::me))
        .route("/auth/change-password", post(handlers::auth::change_password))
        .route("/auth/2fa/setup", post(handlers::two_factor::setup))
        .route("/auth/2fa/enable", post(handlers::two_factor::enable))
        .route("/auth/2fa/disable", post(handlers::two_factor::disable))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware_layer::auth::require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(CookieManagerLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false))
                .on_request(DefaultOnRequest::default().level(Level::DEBUG))
                .on_response(DefaultOnResponse::default().level(Level::DEBUG))
                .on_failure(DefaultOnFailure::default().level(Level::ERROR)),
        )
}
