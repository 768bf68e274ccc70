use axum::extract::FromRequest;

use crate::error::AppError;

/// `axum::Json` whose rejections answer as `AppError::Validation`, so a
/// malformed body gets the same 400 JSON error as any other bad input.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct JsonBody<T>(pub T);
