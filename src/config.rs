use std::env;
use std::net::SocketAddr;
use anyhow::{Context, Result};
use tower_cookies::cookie::SameSite;
use zeroize::{Zeroize, Zeroizing};

/// Minimum length of the access-token signing key in bytes.
const MIN_JWT_SECRET_LEN: usize = 32;

/// The application's configuration.
#[derive(Clone)]
pub struct Config {
    /// The URL of the PostgreSQL database. In-memory stores are used when unset.
    pub database_url: Option<String>,
    /// The address the HTTP server binds to.
    pub bind_addr: SocketAddr,
    /// Key that signs and verifies access tokens.
    pub jwt_secret: Zeroizing<Vec<u8>>,
    /// Key that verifies legacy signed refresh tokens, if any were ever issued.
    pub legacy_refresh_secret: Option<Zeroizing<Vec<u8>>>,
    /// The master key used to seal second factor secrets.
    pub master_key: Zeroizing<Vec<u8>>,
    /// Lifetime of an access token in minutes.
    pub access_token_ttl_minutes: i64,
    /// Lifetime of a refresh token in days.
    pub refresh_token_ttl_days: i64,
    /// Issuer label shown by authenticator apps.
    pub totp_issuer: String,
    /// Whether the refresh cookie carries the `Secure` flag.
    pub cookie_secure: bool,
    /// `SameSite` policy of the refresh cookie.
    pub cookie_same_site: SameSite,
    /// Optional `Domain` of the refresh cookie.
    pub cookie_domain: Option<String>,
    /// Revoke every session of a user when a revoked refresh token is replayed.
    pub refresh_reuse_revokes_all: bool,
    /// Origins allowed by CORS.
    pub cors_origins: Vec<String>,
}

impl Config {
    /// Creates a new `Config` from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Creates a new `Config` from an arbitrary key lookup.
    ///
    /// # Arguments
    ///
    /// * `lookup` - Returns the raw value of a configuration key, if set.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `Config`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut master_key_hex = lookup("MASTER_KEY")
            .context("MASTER_KEY must be set (generate with: openssl rand -hex 32)")?;

        let master_key_bytes = hex::decode(master_key_hex.trim())
            .context("MASTER_KEY must be valid hexadecimal");

        master_key_hex.zeroize();
        let master_key_bytes = master_key_bytes?;

        if master_key_bytes.len() != 32 {
            anyhow::bail!("MASTER_KEY must be exactly 32 bytes (64 hex characters)");
        }

        let jwt_secret = lookup("JWT_SECRET")
            .context("JWT_SECRET must be set")?
            .into_bytes();
        if jwt_secret.len() < MIN_JWT_SECRET_LEN {
            anyhow::bail!("JWT_SECRET must be at least {} bytes", MIN_JWT_SECRET_LEN);
        }

        let legacy_refresh_secret = lookup("LEGACY_REFRESH_SECRET")
            .filter(|s| !s.is_empty())
            .map(|s| Zeroizing::new(s.into_bytes()));

        let access_token_ttl_minutes: i64 = lookup("ACCESS_TOKEN_TTL_MINUTES")
            .unwrap_or_else(|| "15".to_string())
            .parse()
            .context("Invalid ACCESS_TOKEN_TTL_MINUTES")?;

        let refresh_token_ttl_days: i64 = lookup("REFRESH_TOKEN_TTL_DAYS")
            .unwrap_or_else(|| "7".to_string())
            .parse()
            .context("Invalid REFRESH_TOKEN_TTL_DAYS")?;

        if access_token_ttl_minutes <= 0 || refresh_token_ttl_days <= 0 {
            anyhow::bail!("Token lifetimes must be positive");
        }

        let cookie_secure = parse_bool(lookup("COOKIE_SECURE"), true)
            .context("Invalid COOKIE_SECURE")?;

        let cookie_same_site = match lookup("COOKIE_SAME_SITE")
            .unwrap_or_else(|| "Lax".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "strict" => SameSite::Strict,
            "lax" => SameSite::Lax,
            "none" => SameSite::None,
            other => anyhow::bail!("Invalid COOKIE_SAME_SITE: {}", other),
        };

        if cookie_same_site == SameSite::None && !cookie_secure {
            anyhow::bail!("COOKIE_SAME_SITE=None requires COOKIE_SECURE=true");
        }

        let bind_addr = lookup("BIND_ADDR")
            .unwrap_or_else(|| "127.0.0.1:3000".to_string())
            .parse()
            .context("Invalid BIND_ADDR")?;

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|s| !s.is_empty()),
            bind_addr,
            jwt_secret: Zeroizing::new(jwt_secret),
            legacy_refresh_secret,
            master_key: Zeroizing::new(master_key_bytes),
            access_token_ttl_minutes,
            refresh_token_ttl_days,
            totp_issuer: lookup("TOTP_ISSUER").unwrap_or_else(|| "Storefront".to_string()),
            cookie_secure,
            cookie_same_site,
            cookie_domain: lookup("COOKIE_DOMAIN").filter(|s| !s.is_empty()),
            refresh_reuse_revokes_all: parse_bool(lookup("REFRESH_REUSE_REVOKES_ALL"), false)
                .context("Invalid REFRESH_REUSE_REVOKES_ALL")?,
            cors_origins: lookup("CORS_ORIGINS")
                .unwrap_or_else(|| "http://localhost:3000".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }
}

fn parse_bool(raw: Option<String>, default: bool) -> Result<bool> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("false") || v == "0" => Ok(false),
        Some(v) => anyhow::bail!("expected true or false, got {}", v),
    }
}
