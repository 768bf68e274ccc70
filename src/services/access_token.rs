use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::{
    error::{AppError, Result},
    models::{principal::Principal, user::Role},
};

const ACCESS_TOKEN_TYPE: &str = "access";

#[derive(Debug, Serialize, Deserialize)]
struct AccessClaims {
    sub: Uuid,
    role: Role,
    iat: i64,
    exp: i64,
    jti: Uuid,
    typ: String,
}

/// A freshly signed access token.
#[derive(Debug, Clone)]
pub struct IssuedAccessToken {
    pub token: String,
    /// Seconds until expiry.
    pub expires_in: i64,
}

/// Issues and verifies short-lived HS256 access tokens.
///
/// Verification is signature and expiry only; nothing is looked up, so a
/// token stays valid until it expires.
#[derive(Clone)]
pub struct AccessTokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl AccessTokenIssuer {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl,
        }
    }

    /// Signs a token for `subject` carrying `role`.
    pub fn issue(&self, subject: Uuid, role: Role) -> Result<IssuedAccessToken> {
        let now = Utc::now();
        let claims = AccessClaims {
            sub: subject,
            role,
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
            jti: Uuid::new_v4(),
            typ: ACCESS_TOKEN_TYPE.to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AppError::Internal(format!("Access token signing failed: {}", e)))?;

        Ok(IssuedAccessToken {
            token,
            expires_in: self.ttl.num_seconds(),
        })
    }

    /// Verifies signature and expiry and returns the principal.
    pub fn verify(&self, token: &str) -> Result<Principal> {
        let data = decode::<AccessClaims>(token, &self.decoding, &self.validation).map_err(|e| {
            tracing::debug!("Access token rejected: {}", e);
            AppError::TokenInvalidOrExpired
        })?;

        if data.claims.typ != ACCESS_TOKEN_TYPE {
            return Err(AppError::TokenInvalidOrExpired);
        }

        Ok(Principal {
            user_id: data.claims.sub,
            role: data.claims.role,
        })
    }
}
