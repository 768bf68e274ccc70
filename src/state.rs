use std::sync::Arc;
use crate::config::Config;
use crate::cookie::CookiePolicy;
use crate::crypto::{aes::SecretBox, password::{HashParams, PasswordHasher}};
use crate::error::Result;
use crate::repositories::{
    memory::{MemoryRefreshTokenStore, MemoryUserStore},
    refresh_token::{PgRefreshTokenStore, RefreshTokenStore},
    user::{PgUserStore, UserStore},
};
use crate::services::{
    access_token::AccessTokenIssuer,
    session::{SessionService, SessionSettings},
    totp::StepUpVerifier,
};

/// The application's state.
#[derive(Clone)]
pub struct AppState {
    /// The session lifecycle.
    pub sessions: Arc<SessionService>,
    /// How the refresh token cookie is written.
    pub cookie_policy: CookiePolicy,
}

impl AppState {
    /// Creates a new `AppState`, connecting to PostgreSQL when configured.
    ///
    /// # Arguments
    ///
    /// * `config` - The application's configuration.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `AppState`.
    pub async fn new(config: &Config) -> Result<Self> {
        let (users, refresh_tokens): (Arc<dyn UserStore>, Arc<dyn RefreshTokenStore>) =
            match &config.database_url {
                Some(url) => {
                    let pool = crate::db::create_pool(url)?;
                    crate::db::run_migrations(&pool).await?;
                    tracing::info!("PostgreSQL pool initialized, schema up to date");
                    (
                        Arc::new(PgUserStore::new(pool.clone())),
                        Arc::new(PgRefreshTokenStore::new(pool)),
                    )
                }
                None => {
                    tracing::warn!("DATABASE_URL not set, using in-memory stores; nothing survives a restart");
                    (
                        Arc::new(MemoryUserStore::new()),
                        Arc::new(MemoryRefreshTokenStore::new()),
                    )
                }
            };

        let state = Self::with_stores(config, users, refresh_tokens, HashParams::default())?;
        if !state.sessions.detects_legacy_reuse() {
            tracing::warn!(
                "LEGACY_REFRESH_SECRET not set; replayed legacy refresh tokens are rejected without revoking the owner's sessions"
            );
        }

        Ok(state)
    }

    /// Creates an `AppState` over the given stores.
    pub fn with_stores(
        config: &Config,
        users: Arc<dyn UserStore>,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
        hash_params: HashParams,
    ) -> Result<Self> {
        let sessions = SessionService::new(
            users,
            refresh_tokens,
            PasswordHasher::new(hash_params)?,
            StepUpVerifier::new(config.totp_issuer.clone()),
            AccessTokenIssuer::new(
                &config.jwt_secret,
                chrono::Duration::minutes(config.access_token_ttl_minutes),
            ),
            SecretBox::new(&config.master_key)?,
            SessionSettings {
                refresh_ttl: chrono::Duration::days(config.refresh_token_ttl_days),
                reuse_revokes_all: config.refresh_reuse_revokes_all,
                legacy_refresh_secret: config.legacy_refresh_secret.clone(),
            },
        );

        Ok(AppState {
            sessions: Arc::new(sessions),
            cookie_policy: CookiePolicy::from_config(config),
        })
    }
}
