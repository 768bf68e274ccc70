use base64::{Engine as _, engine::general_purpose};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// The size of an opaque refresh token in random bytes.
pub const OPAQUE_TOKEN_BYTES: usize = 48;
/// Length of the encoded opaque token (base64url, no padding).
pub const OPAQUE_TOKEN_LEN: usize = 64;
/// Upper bound on anything we are willing to parse as a legacy token.
const MAX_LEGACY_TOKEN_LEN: usize = 4096;

/// Generates a new random opaque refresh token.
///
/// # Returns
///
/// A URL-safe base64-encoded token.
pub fn generate_opaque_token() -> String {
    let mut token = [0u8; OPAQUE_TOKEN_BYTES];
    OsRng.fill_bytes(&mut token);

    general_purpose::URL_SAFE_NO_PAD.encode(token)
}

/// Digest under which a refresh token is persisted.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// The structural kind of a presented refresh token, resolved once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenShape<'a> {
    /// The current opaque format.
    Opaque(&'a str),
    /// A signed token from before refresh tokens were stored server-side.
    Legacy(&'a str),
    /// Anything else.
    Malformed,
}

fn is_base64url(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Classifies a raw cookie value.
pub fn classify(raw: &str) -> TokenShape<'_> {
    if raw.len() == OPAQUE_TOKEN_LEN && is_base64url(raw) {
        return TokenShape::Opaque(raw);
    }

    if raw.len() <= MAX_LEGACY_TOKEN_LEN {
        let mut segments = raw.split('.');
        let well_formed = segments.by_ref().take(3).filter(|s| is_base64url(s)).count() == 3
            && segments.next().is_none();
        if well_formed {
            return TokenShape::Legacy(raw);
        }
    }

    TokenShape::Malformed
}

#[derive(Deserialize)]
struct LegacyRefreshClaims {
    #[serde(alias = "userId", alias = "user_id")]
    sub: String,
    #[serde(default)]
    typ: Option<String>,
}

/// Recovers the subject of a legacy signed refresh token.
///
/// The signature must verify against `secret`; expiry is not checked. Returns
/// `None` for forged tokens, access tokens, and subjects that are not user ids.
pub fn decode_legacy_subject(raw: &str, secret: &[u8]) -> Option<Uuid> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    let data = decode::<LegacyRefreshClaims>(raw, &DecodingKey::from_secret(secret), &validation)
        .ok()?;

    if data.claims.typ.as_deref() == Some("access") {
        return None;
    }

    Uuid::parse_str(&data.claims.sub).ok()
}
