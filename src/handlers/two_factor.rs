use axum::{extract::State, Extension, Json};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    handlers::json::JsonBody,
    models::principal::Principal,
    state::AppState,
    validation::auth::validate_step_up_code,
};

#[derive(Deserialize)]
pub struct CodeRequest {
    pub code: String,
}

#[derive(Serialize)]
pub struct SetupResponse {
    /// Base32 secret for manual entry.
    pub secret: String,
    pub otpauth_url: String,
}

#[derive(Serialize)]
pub struct TwoFactorResponse {
    pub two_factor_enabled: bool,
}

/// Starts enrollment with a fresh pending secret.
pub async fn setup(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<SetupResponse>> {
    let enrollment = state.sessions.setup_two_factor(principal.user_id).await?;
    Ok(Json(SetupResponse {
        secret: enrollment.secret_base32,
        otpauth_url: enrollment.otpauth_url,
    }))
}

pub async fn enable(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    JsonBody(payload): JsonBody<CodeRequest>,
) -> Result<Json<TwoFactorResponse>> {
    let code = payload.code.trim();
    validate_step_up_code(code)?;

    state.sessions.enable_two_factor(principal.user_id, code).await?;
    Ok(Json(TwoFactorResponse {
        two_factor_enabled: true,
    }))
}

pub async fn disable(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    JsonBody(payload): JsonBody<CodeRequest>,
) -> Result<Json<TwoFactorResponse>> {
    let code = payload.code.trim();
    validate_step_up_code(code)?;

    state.sessions.disable_two_factor(principal.user_id, code).await?;
    Ok(Json(TwoFactorResponse {
        two_factor_enabled: false,
    }))
}
