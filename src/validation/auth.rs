use crate::error::{AppError, Result};

/// Number of digits in a step-up code.
pub const STEP_UP_CODE_LEN: usize = 6;

/// Normalizes an email address for lookup and storage.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Validates a password.
///
/// # Arguments
///
/// * `password` - The password to validate.
///
/// # Returns
///
/// A `Result<()>` indicating whether the password is valid.
pub fn validate_password(password: &str) -> Result<()> {
    if password.len() < 8 {
        return Err(AppError::Validation(
            "Password must be at least 8 characters long".to_string(),
        ));
    }

    if password.len() > 128 {
        return Err(AppError::Validation(
            "Password must be at most 128 characters".to_string(),
        ));
    }

    Ok(())
}

/// Validates the shape of a step-up code: exactly six ASCII digits.
pub fn validate_step_up_code(code: &str) -> Result<()> {
    if code.len() != STEP_UP_CODE_LEN || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::Validation(
            "2FA code must be exactly 6 digits".to_string(),
        ));
    }

    Ok(())
}

/// Normalizes an optional step-up code: blank means absent, anything else
/// must be well-formed.
pub fn optional_step_up_code(code: Option<&str>) -> Result<Option<&str>> {
    match code.map(str::trim) {
        None | Some("") => Ok(None),
        Some(code) => validate_step_up_code(code).map(|_| Some(code)),
    }
}
