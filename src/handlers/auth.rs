use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use garde::Validate;
use serde::{Deserialize, Serialize};
use tower_cookies::Cookies;

use crate::{
    cookie::CookiePolicy,
    error::Result,
    handlers::json::JsonBody,
    models::{principal::Principal, user::PublicUser},
    services::session::{Registration, SessionGrant},
    state::AppState,
    validation::auth::*,
};

/// The request payload for user registration.
#[derive(Deserialize, Validate)]
pub struct RegisterRequest {
    #[garde(email)]
    pub email: String,
    #[garde(length(min = 8, max = 128))]
    pub password: String,
    #[garde(length(max = 100))]
    pub name: Option<String>,
}

/// The request payload for user login.
#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    /// Step-up code, required once a second factor is enabled.
    #[serde(default)]
    pub code: Option<String>,
}

/// The request payload for changing a user's password.
#[derive(Deserialize, Validate)]
pub struct ChangePasswordRequest {
    #[garde(skip)]
    pub current_password: String,
    #[garde(length(min = 8, max = 128))]
    pub new_password: String,
}

/// The response payload for token-issuing requests.
#[derive(Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub user: PublicUser,
}

/// The response payload for requests that only report success.
#[derive(Serialize)]
pub struct AuthResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Serialize)]
pub struct UserResponse {
    pub user: PublicUser,
}

impl AuthResponse {
    fn ok(message: &str) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.to_string(),
        })
    }
}

/// Writes the refresh cookie and returns the access token body.
fn grant_response(policy: &CookiePolicy, cookies: &Cookies, grant: SessionGrant) -> Response {
    policy.write(cookies, grant.refresh_token);

    let body = TokenResponse {
        access_token: grant.access_token.token,
        token_type: "Bearer",
        expires_in: grant.access_token.expires_in,
        user: grant.user,
    };

    (StatusCode::OK, Json(body)).into_response()
}

/// Handles user registration.
pub async fn register(
    State(state): State<AppState>,
    JsonBody(mut payload): JsonBody<RegisterRequest>,
) -> Result<Response> {
    payload.email = normalize_email(&payload.email);
    payload.validate()?;

    let user = state
        .sessions
        .register(Registration {
            email: payload.email,
            password: payload.password,
            name: payload.name,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(UserResponse { user })).into_response())
}

/// Handles user login.
pub async fn login(
    State(state): State<AppState>,
    cookies: Cookies,
    JsonBody(payload): JsonBody<LoginRequest>,
) -> Result<Response> {
    let code = optional_step_up_code(payload.code.as_deref())?;

    let grant = state
        .sessions
        .login(&normalize_email(&payload.email), &payload.password, code)
        .await?;

    Ok(grant_response(&state.cookie_policy, &cookies, grant))
}

/// Rotates the refresh cookie and issues a new access token.
pub async fn refresh(State(state): State<AppState>, cookies: Cookies) -> Result<Response> {
    let presented = CookiePolicy::read(&cookies);

    match state.sessions.refresh(presented.as_deref()).await {
        Ok(grant) => Ok(grant_response(&state.cookie_policy, &cookies, grant)),
        Err(e) => {
            if presented.is_some() {
                state.cookie_policy.clear(&cookies);
            }
            Err(e)
        }
    }
}

/// Handles user logout. Always succeeds.
pub async fn logout(State(state): State<AppState>, cookies: Cookies) -> Response {
    let presented = CookiePolicy::read(&cookies);
    state.sessions.logout(presented.as_deref()).await;
    state.cookie_policy.clear(&cookies);

    (StatusCode::OK, AuthResponse::ok("Logout successful")).into_response()
}

/// Returns the authenticated user.
pub async fn me(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<UserResponse>> {
    let user = state.sessions.current_user(principal.user_id).await?;
    Ok(Json(UserResponse { user }))
}

/// Handles changing a user's password. Ends every session of the user.
pub async fn change_password(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    cookies: Cookies,
    JsonBody(payload): JsonBody<ChangePasswordRequest>,
) -> Result<Response> {
    payload.validate()?;

    state
        .sessions
        .change_password(principal.user_id, &payload.current_password, &payload.new_password)
        .await?;
    state.cookie_policy.clear(&cookies);

    Ok((StatusCode::OK, AuthResponse::ok("Password changed successfully")).into_response())
}
