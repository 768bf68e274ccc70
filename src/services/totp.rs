use totp_rs::{Algorithm, Secret, TOTP};
use zeroize::Zeroizing;
use crate::error::{AppError, Result};

const DIGITS: usize = 6;
/// Accepted steps either side of the current one.
const SKEW: u8 = 1;
const STEP_SECONDS: u64 = 30;

/// Time-based one-time codes (RFC 6238, SHA-1, 6 digits, 30 s steps).
#[derive(Clone, Debug)]
pub struct StepUpVerifier {
    issuer: String,
}

/// What a client needs to enroll an authenticator app.
#[derive(Debug, Clone)]
pub struct Enrollment {
    /// Base32 secret for manual entry.
    pub secret_base32: String,
    /// `otpauth://` URI for QR presentation.
    pub otpauth_url: String,
}

impl StepUpVerifier {
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
        }
    }

    fn totp(&self, secret: &[u8], account: &str) -> Result<TOTP> {
        TOTP::new(
            Algorithm::SHA1,
            DIGITS,
            SKEW,
            STEP_SECONDS,
            secret.to_vec(),
            Some(self.issuer.clone()),
            account.to_string(),
        )
        .map_err(|e| AppError::Internal(format!("TOTP init error: {}", e)))
    }

    /// Generates a new random 160-bit secret.
    pub fn generate_secret(&self) -> Result<Zeroizing<Vec<u8>>> {
        Secret::generate_secret()
            .to_bytes()
            .map(Zeroizing::new)
            .map_err(|e| AppError::Internal(format!("Secret gen error: {}", e)))
    }

    /// Builds the enrollment URI and manual-entry secret for `account`.
    pub fn enrollment(&self, account: &str, secret: &[u8]) -> Result<Enrollment> {
        let totp = self.totp(secret, account)?;
        Ok(Enrollment {
            secret_base32: totp.get_secret_base32(),
            otpauth_url: totp.get_url(),
        })
    }

    /// Checks `code` against `secret` at the current time, within the skew window.
    pub fn check(&self, code: &str, secret: &[u8]) -> bool {
        if code.len() != DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }

        match self.totp(secret, "check") {
            Ok(totp) => totp.check_current(code).unwrap_or(false),
            Err(e) => {
                tracing::error!("Failed to build TOTP verifier: {}", e);
                false
            }
        }
    }
}
