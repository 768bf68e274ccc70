//! Register, login, refresh, logout and second factor flows.
//!
//! A session is one lineage of refresh tokens started by a login. Every
//! refresh revokes the presented token and issues its successor in one store
//! operation; a token that was rotated away, logged out or expired never
//! authenticates again.

use std::sync::Arc;
use chrono::{Duration, Utc};
use uuid::Uuid;
use zeroize::Zeroizing;
use crate::{
    crypto::{
        aes::SecretBox,
        password::PasswordHasher,
        token::{self, TokenShape},
    },
    error::{AppError, Result},
    models::{
        principal::Principal,
        user::{NewUser, PublicUser, Role, User},
    },
    repositories::{refresh_token::RefreshTokenStore, user::UserStore},
    services::{
        access_token::{AccessTokenIssuer, IssuedAccessToken},
        totp::{Enrollment, StepUpVerifier},
    },
    validation::auth::{normalize_email, validate_password},
};

/// Tunables of the session lifecycle.
#[derive(Clone)]
pub struct SessionSettings {
    /// Lifetime of each refresh token, counted from its own issuance.
    pub refresh_ttl: Duration,
    /// Revoke every session of the owner when a revoked opaque token is replayed.
    pub reuse_revokes_all: bool,
    /// Key that verifies legacy signed refresh tokens.
    pub legacy_refresh_secret: Option<Zeroizing<Vec<u8>>>,
}

/// Input of a registration.
#[derive(Clone)]
pub struct Registration {
    pub email: String,
    pub password: String,
    pub name: Option<String>,
}

/// The result of a login or a refresh.
#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub access_token: IssuedAccessToken,
    /// Opaque refresh token, for the cookie only.
    pub refresh_token: String,
    pub user: PublicUser,
}

/// Composes the credential store, hasher, step-up verifier, access token
/// issuer and refresh token store.
pub struct SessionService {
    users: Arc<dyn UserStore>,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
    hasher: Arc<PasswordHasher>,
    step_up: StepUpVerifier,
    access_tokens: AccessTokenIssuer,
    secrets: SecretBox,
    settings: SessionSettings,
}

impl SessionService {
    pub fn new(
        users: Arc<dyn UserStore>,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
        hasher: PasswordHasher,
        step_up: StepUpVerifier,
        access_tokens: AccessTokenIssuer,
        secrets: SecretBox,
        settings: SessionSettings,
    ) -> Self {
        Self {
            users,
            refresh_tokens,
            hasher: Arc::new(hasher),
            step_up,
            access_tokens,
            secrets,
            settings,
        }
    }

    async fn hash_password(&self, password: &str) -> Result<String> {
        let hasher = Arc::clone(&self.hasher);
        let password = Zeroizing::new(password.to_string());
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AppError::Internal(format!("Hashing task failed: {}", e)))?
    }

    /// Verifies against the user's digest, or a decoy digest when there is no user.
    async fn verify_password(&self, user: Option<&User>, password: &str) -> Result<bool> {
        let hasher = Arc::clone(&self.hasher);
        let digest = user.map(|u| u.password_hash.clone());
        let password = Zeroizing::new(password.to_string());
        tokio::task::spawn_blocking(move || match digest {
            Some(digest) => hasher.verify(&digest, &password),
            None => {
                hasher.verify_decoy(&password);
                false
            }
        })
        .await
        .map_err(|e| AppError::Internal(format!("Verification task failed: {}", e)))
    }

    /// Creates an account with no second factor.
    pub async fn register(&self, registration: Registration) -> Result<PublicUser> {
        let email = normalize_email(&registration.email);
        validate_password(&registration.password)?;

        if self.users.find_by_email(&email).await?.is_some() {
            return Err(AppError::DuplicateAccount);
        }

        let password_hash = self.hash_password(&registration.password).await?;

        // The store enforces uniqueness again for concurrent registrations.
        let user = self
            .users
            .create(NewUser {
                email,
                name: registration.name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
                password_hash,
                role: Role::Customer,
            })
            .await?;

        tracing::info!(user_id = %user.id, "User registered");
        Ok(PublicUser::from(&user))
    }

    /// Authenticates by password and, when enrolled, by second factor code.
    pub async fn login(&self, email: &str, password: &str, code: Option<&str>) -> Result<SessionGrant> {
        let email = normalize_email(email);
        let user = self.users.find_by_email(&email).await?;

        if !self.verify_password(user.as_ref(), password).await? {
            return Err(AppError::InvalidCredentials);
        }
        let user = user.ok_or(AppError::InvalidCredentials)?;

        if user.two_factor_enabled {
            let code = code.filter(|c| !c.is_empty()).ok_or(AppError::StepUpRequired)?;
            if !self.check_step_up(&user, code)? {
                tracing::warn!(user_id = %user.id, "Login rejected: invalid second factor code");
                return Err(AppError::InvalidStepUpCode);
            }
        }

        let grant = self.open_session(&user).await?;
        tracing::info!(user_id = %user.id, "User logged in");
        Ok(grant)
    }

    async fn open_session(&self, user: &User) -> Result<SessionGrant> {
        let access_token = self.access_tokens.issue(user.id, user.role)?;
        let refresh_token = self
            .refresh_tokens
            .create(user.id, Utc::now() + self.settings.refresh_ttl)
            .await?;

        Ok(SessionGrant {
            access_token,
            refresh_token,
            user: PublicUser::from(user),
        })
    }

    /// Rotates the presented refresh token into a new session grant.
    ///
    /// Every failure denies. Once the presented token has been found live,
    /// any failure also leaves it revoked.
    pub async fn refresh(&self, presented: Option<&str>) -> Result<SessionGrant> {
        let presented = presented.ok_or(AppError::TokenInvalidOrExpired)?;

        match token::classify(presented) {
            TokenShape::Opaque(raw) => self.rotate(raw).await,
            TokenShape::Legacy(raw) => {
                self.handle_legacy_replay(raw).await;
                Err(AppError::TokenInvalidOrExpired)
            }
            TokenShape::Malformed => {
                tracing::debug!("Refresh rejected: malformed token");
                Err(AppError::TokenInvalidOrExpired)
            }
        }
    }

    async fn rotate(&self, raw: &str) -> Result<SessionGrant> {
        let now = Utc::now();

        let Some(record) = self.refresh_tokens.find(raw).await? else {
            tracing::debug!("Refresh rejected: unknown token");
            return Err(AppError::TokenInvalidOrExpired);
        };

        if record.revoked {
            let age = now - record.created_at;
            tracing::warn!(
                user_id = %record.user_id,
                token_age_secs = age.num_seconds(),
                "Replay of a revoked refresh token"
            );
            if self.settings.reuse_revokes_all {
                self.revoke_all_after_reuse(record.user_id).await;
            }
            return Err(AppError::TokenInvalidOrExpired);
        }

        if record.is_expired_at(now) {
            tracing::debug!(user_id = %record.user_id, "Refresh rejected: token expired");
            return Err(AppError::TokenInvalidOrExpired);
        }

        let user = match self.users.find_by_id(record.user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                self.invalidate(raw).await;
                return Err(AppError::TokenInvalidOrExpired);
            }
            Err(e) => {
                self.invalidate(raw).await;
                return Err(e);
            }
        };

        let next = match self
            .refresh_tokens
            .rotate(raw, user.id, now + self.settings.refresh_ttl)
            .await
        {
            Ok(Some(next)) => next,
            Ok(None) => {
                tracing::warn!(user_id = %user.id, "Refresh lost a rotation race");
                return Err(AppError::TokenInvalidOrExpired);
            }
            Err(e) => {
                self.invalidate(raw).await;
                return Err(e);
            }
        };

        let access_token = match self.access_tokens.issue(user.id, user.role) {
            Ok(access_token) => access_token,
            Err(e) => {
                self.invalidate(&next).await;
                return Err(e);
            }
        };

        tracing::debug!(user_id = %user.id, "Refresh token rotated");
        Ok(SessionGrant {
            access_token,
            refresh_token: next,
            user: PublicUser::from(&user),
        })
    }

    /// Best-effort revocation on a failure path.
    async fn invalidate(&self, raw: &str) {
        if let Err(e) = self.refresh_tokens.revoke(raw).await {
            tracing::error!("Failed to revoke refresh token after a failed refresh: {}", e);
        }
    }

    async fn revoke_all_after_reuse(&self, user_id: Uuid) {
        match self.refresh_tokens.revoke_all_for_user(user_id).await {
            Ok(revoked) => tracing::warn!(
                user_id = %user_id,
                revoked,
                "Refresh token reuse detected, revoked all sessions"
            ),
            Err(e) => tracing::error!(
                user_id = %user_id,
                "Refresh token reuse detected but mass revocation failed: {}",
                e
            ),
        }
    }

    /// Whether a replayed legacy token can be attributed and its owner's
    /// sessions revoked.
    pub fn detects_legacy_reuse(&self) -> bool {
        self.settings.legacy_refresh_secret.is_some()
    }

    async fn handle_legacy_replay(&self, raw: &str) {
        let Some(secret) = self.settings.legacy_refresh_secret.as_ref() else {
            tracing::warn!("Legacy refresh token presented but no legacy key is configured");
            return;
        };

        match token::decode_legacy_subject(raw, secret) {
            Some(user_id) => {
                tracing::warn!(user_id = %user_id, "Legacy refresh token replayed");
                self.revoke_all_after_reuse(user_id).await;
            }
            None => tracing::warn!("Unverifiable legacy-format refresh token presented"),
        }
    }

    /// Revokes the presented refresh token. Never fails.
    pub async fn logout(&self, presented: Option<&str>) {
        let Some(raw) = presented else {
            return;
        };

        if let TokenShape::Opaque(raw) = token::classify(raw) {
            match self.refresh_tokens.revoke(raw).await {
                Ok(()) => tracing::info!("Refresh token revoked on logout"),
                Err(e) => tracing::error!("Failed to revoke refresh token on logout: {}", e),
            }
        }
    }

    /// Verifies an access token for downstream handlers.
    pub fn authenticate(&self, access_token: &str) -> Result<Principal> {
        self.access_tokens.verify(access_token)
    }

    async fn load_user(&self, user_id: Uuid) -> Result<User> {
        self.users
            .find_by_id(user_id)
            .await?
            .ok_or(AppError::TokenInvalidOrExpired)
    }

    pub async fn current_user(&self, user_id: Uuid) -> Result<PublicUser> {
        Ok(PublicUser::from(&self.load_user(user_id).await?))
    }

    fn check_step_up(&self, user: &User, code: &str) -> Result<bool> {
        let sealed = user
            .two_factor_secret
            .as_ref()
            .ok_or_else(|| AppError::Internal("Second factor enabled without a secret".to_string()))?;
        let secret = self.secrets.open(sealed)?;
        Ok(self.step_up.check(code, &secret))
    }

    /// Stores a fresh pending secret, replacing any abandoned one.
    pub async fn setup_two_factor(&self, user_id: Uuid) -> Result<Enrollment> {
        let user = self.load_user(user_id).await?;
        if user.two_factor_enabled {
            return Err(AppError::Validation("2FA is already enabled".to_string()));
        }

        let secret = self.step_up.generate_secret()?;
        let enrollment = self.step_up.enrollment(&user.email, &secret)?;
        self.users
            .set_pending_two_factor(user.id, self.secrets.seal(&secret)?)
            .await?;

        tracing::info!(user_id = %user.id, "Second factor enrollment started");
        Ok(enrollment)
    }

    /// Turns the pending secret into the enforced one after a fresh code check.
    pub async fn enable_two_factor(&self, user_id: Uuid, code: &str) -> Result<()> {
        let user = self.load_user(user_id).await?;
        if user.two_factor_enabled {
            return Err(AppError::Validation("2FA is already enabled".to_string()));
        }
        if user.two_factor_secret.is_none() {
            return Err(AppError::Validation("2FA setup has not been started".to_string()));
        }

        if !self.check_step_up(&user, code)? {
            tracing::warn!(user_id = %user.id, "Second factor enable rejected: invalid code");
            return Err(AppError::InvalidStepUpCode);
        }

        self.users.enable_two_factor(user.id).await?;
        tracing::info!(user_id = %user.id, "Second factor enabled");
        Ok(())
    }

    /// Removes the second factor. Requires a valid current code.
    pub async fn disable_two_factor(&self, user_id: Uuid, code: &str) -> Result<()> {
        let user = self.load_user(user_id).await?;
        if !user.two_factor_enabled {
            return Err(AppError::Validation("2FA is not enabled".to_string()));
        }

        if !self.check_step_up(&user, code)? {
            tracing::warn!(user_id = %user.id, "Second factor disable rejected: invalid code");
            return Err(AppError::InvalidStepUpCode);
        }

        self.users.disable_two_factor(user.id).await?;
        tracing::info!(user_id = %user.id, "Second factor disabled");
        Ok(())
    }

    /// Replaces the password and ends every session of the user.
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> Result<()> {
        validate_password(new_password)?;
        let user = self.load_user(user_id).await?;

        if !self.verify_password(Some(&user), current_password).await? {
            return Err(AppError::InvalidCredentials);
        }

        let password_hash = self.hash_password(new_password).await?;
        self.users.update_password(user.id, &password_hash).await?;

        let revoked = self.refresh_tokens.revoke_all_for_user(user.id).await?;
        tracing::info!(user_id = %user.id, revoked, "Password changed, sessions revoked");
        Ok(())
    }

    /// Deletes expired refresh token rows.
    pub async fn purge_expired(&self) -> Result<u64> {
        self.refresh_tokens.purge_expired(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use totp_rs::{Algorithm, Secret, TOTP};
    use crate::{
        crypto::password::HashParams,
        models::refresh_token::RefreshToken,
        repositories::memory::{MemoryRefreshTokenStore, MemoryUserStore},
    };

    const JWT_SECRET: &[u8] = b"an-access-token-signing-key-of-32-bytes";
    const LEGACY_SECRET: &[u8] = b"legacy-refresh-signing-key";

    struct Harness {
        service: SessionService,
        tokens: Arc<MemoryRefreshTokenStore>,
    }

    fn harness_with(
        tokens: Arc<dyn RefreshTokenStore>,
        memory: Arc<MemoryRefreshTokenStore>,
        reuse_revokes_all: bool,
        legacy_secret: Option<&[u8]>,
    ) -> Harness {
        let hasher = PasswordHasher::new(HashParams {
            memory_kib: 256,
            iterations: 1,
            parallelism: 1,
        })
        .unwrap();
        let service = SessionService::new(
            Arc::new(MemoryUserStore::new()),
            tokens,
            hasher,
            StepUpVerifier::new("Storefront"),
            AccessTokenIssuer::new(JWT_SECRET, Duration::minutes(15)),
            SecretBox::new(&[3u8; 32]).unwrap(),
            SessionSettings {
                refresh_ttl: Duration::days(7),
                reuse_revokes_all,
                legacy_refresh_secret: legacy_secret.map(|k| Zeroizing::new(k.to_vec())),
            },
        );
        Harness {
            service,
            tokens: memory,
        }
    }

    fn harness() -> Harness {
        let memory = Arc::new(MemoryRefreshTokenStore::new());
        harness_with(memory.clone(), memory, false, Some(LEGACY_SECRET))
    }

    async fn register(h: &Harness, email: &str) -> PublicUser {
        h.service
            .register(Registration {
                email: email.to_string(),
                password: "Sup3rSecret!".to_string(),
                name: Some("Alice".to_string()),
            })
            .await
            .unwrap()
    }

    fn code_for(secret_base32: &str) -> String {
        let secret = Secret::Encoded(secret_base32.to_string()).to_bytes().unwrap();
        TOTP::new(Algorithm::SHA1, 6, 1, 30, secret, None, "t".to_string())
            .unwrap()
            .generate_current()
            .unwrap()
    }

    fn wrong_code(right: &str) -> String {
        let n: u32 = right.parse().unwrap();
        format!("{:06}", (n + 500_000) % 1_000_000)
    }

    #[tokio::test]
    async fn rotation_scenario() {
        let h = harness();
        register(&h, "alice@example.com").await;

        let login = h.service.login("alice@example.com", "Sup3rSecret!", None).await.unwrap();
        let (a1, r1) = (login.access_token.token, login.refresh_token);

        let second = h.service.refresh(Some(&r1)).await.unwrap();
        assert_ne!(second.access_token.token, a1);
        assert_ne!(second.refresh_token, r1);
        assert!(h.tokens.find(&r1).await.unwrap().unwrap().revoked);

        assert!(matches!(
            h.service.refresh(Some(&r1)).await,
            Err(AppError::TokenInvalidOrExpired)
        ));

        let third = h.service.refresh(Some(&second.refresh_token)).await.unwrap();
        assert_eq!(third.user.email, "alice@example.com");
    }

    #[tokio::test]
    async fn rotated_token_stays_dead() {
        let h = harness();
        register(&h, "alice@example.com").await;
        let login = h.service.login("alice@example.com", "Sup3rSecret!", None).await.unwrap();

        let mut current = login.refresh_token.clone();
        for _ in 0..3 {
            current = h.service.refresh(Some(&current)).await.unwrap().refresh_token;
        }
        for _ in 0..2 {
            assert!(h.service.refresh(Some(&login.refresh_token)).await.is_err());
        }
        // Default policy: a replayed opaque token does not end other sessions.
        assert!(h.service.refresh(Some(&current)).await.is_ok());
    }

    #[tokio::test]
    async fn reuse_policy_can_revoke_every_session() {
        let memory = Arc::new(MemoryRefreshTokenStore::new());
        let h = harness_with(memory.clone(), memory, true, Some(LEGACY_SECRET));
        register(&h, "alice@example.com").await;

        let phone = h.service.login("alice@example.com", "Sup3rSecret!", None).await.unwrap();
        let laptop = h.service.login("alice@example.com", "Sup3rSecret!", None).await.unwrap();
        let rotated = h.service.refresh(Some(&phone.refresh_token)).await.unwrap();

        assert!(h.service.refresh(Some(&phone.refresh_token)).await.is_err());
        assert!(h.service.refresh(Some(&rotated.refresh_token)).await.is_err());
        assert!(h.service.refresh(Some(&laptop.refresh_token)).await.is_err());
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let h = harness();
        let user = register(&h, "alice@example.com").await;
        let stale = h
            .tokens
            .create(user.id, Utc::now() - Duration::seconds(1))
            .await
            .unwrap();

        assert!(matches!(
            h.service.refresh(Some(&stale)).await,
            Err(AppError::TokenInvalidOrExpired)
        ));
    }

    #[tokio::test]
    async fn missing_unknown_and_malformed_tokens_are_rejected() {
        let h = harness();
        for presented in [None, Some(""), Some("garbage"), Some(&*token::generate_opaque_token())] {
            assert!(matches!(
                h.service.refresh(presented).await,
                Err(AppError::TokenInvalidOrExpired)
            ));
        }
    }

    #[tokio::test]
    async fn legacy_token_replay_revokes_all_sessions() {
        use jsonwebtoken::{EncodingKey, Header, encode};

        let h = harness();
        let user = register(&h, "alice@example.com").await;
        let session = h.service.login("alice@example.com", "Sup3rSecret!", None).await.unwrap();

        let legacy = encode(
            &Header::default(),
            &serde_json::json!({ "userId": user.id.to_string(), "exp": 1 }),
            &EncodingKey::from_secret(LEGACY_SECRET),
        )
        .unwrap();

        assert!(matches!(
            h.service.refresh(Some(&legacy)).await,
            Err(AppError::TokenInvalidOrExpired)
        ));
        assert!(h.tokens.find(&session.refresh_token).await.unwrap().unwrap().revoked);
    }

    #[tokio::test]
    async fn forged_legacy_token_revokes_nothing() {
        use jsonwebtoken::{EncodingKey, Header, encode};

        let h = harness();
        let user = register(&h, "alice@example.com").await;
        let session = h.service.login("alice@example.com", "Sup3rSecret!", None).await.unwrap();

        let forged = encode(
            &Header::default(),
            &serde_json::json!({ "sub": user.id.to_string() }),
            &EncodingKey::from_secret(b"not-the-legacy-key"),
        )
        .unwrap();

        assert!(h.service.refresh(Some(&forged)).await.is_err());
        assert!(!h.tokens.find(&session.refresh_token).await.unwrap().unwrap().revoked);
    }

    #[tokio::test]
    async fn legacy_token_without_key_is_only_rejected() {
        use jsonwebtoken::{EncodingKey, Header, encode};

        let memory = Arc::new(MemoryRefreshTokenStore::new());
        let h = harness_with(memory.clone(), memory, false, None);
        assert!(!h.service.detects_legacy_reuse());

        let user = register(&h, "alice@example.com").await;
        let session = h.service.login("alice@example.com", "Sup3rSecret!", None).await.unwrap();
        let legacy = encode(
            &Header::default(),
            &serde_json::json!({ "userId": user.id.to_string() }),
            &EncodingKey::from_secret(LEGACY_SECRET),
        )
        .unwrap();

        assert!(matches!(
            h.service.refresh(Some(&legacy)).await,
            Err(AppError::TokenInvalidOrExpired)
        ));
        assert!(!h.tokens.find(&session.refresh_token).await.unwrap().unwrap().revoked);
    }

    #[tokio::test]
    async fn concurrent_refreshes_have_one_winner() {
        let h = harness();
        register(&h, "alice@example.com").await;
        let login = h.service.login("alice@example.com", "Sup3rSecret!", None).await.unwrap();

        let (a, b) = tokio::join!(
            h.service.refresh(Some(&login.refresh_token)),
            h.service.refresh(Some(&login.refresh_token)),
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    }

    #[tokio::test]
    async fn login_failures_are_indistinguishable() {
        let h = harness();
        register(&h, "alice@example.com").await;

        let wrong_password = h.service.login("alice@example.com", "nope-nope", None).await;
        let unknown_user = h.service.login("mallory@example.com", "Sup3rSecret!", None).await;
        assert!(matches!(wrong_password, Err(AppError::InvalidCredentials)));
        assert!(matches!(unknown_user, Err(AppError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn login_normalizes_email() {
        let h = harness();
        register(&h, "  Alice@Example.COM ").await;
        assert!(h.service.login("alice@example.com", "Sup3rSecret!", None).await.is_ok());
    }

    #[tokio::test]
    async fn duplicate_registration_under_concurrency() {
        let h = harness();
        let attempt = || {
            h.service.register(Registration {
                email: "alice@example.com".to_string(),
                password: "Sup3rSecret!".to_string(),
                name: None,
            })
        };
        let (a, b) = tokio::join!(attempt(), attempt());
        let conflicts = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(AppError::DuplicateAccount)))
            .count();
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert_eq!(conflicts, 1);
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let h = harness();
        register(&h, "alice@example.com").await;
        let login = h.service.login("alice@example.com", "Sup3rSecret!", None).await.unwrap();

        h.service.logout(Some(&login.refresh_token)).await;
        h.service.logout(Some(&login.refresh_token)).await;
        h.service.logout(Some("garbage")).await;
        h.service.logout(None).await;

        assert!(h.service.refresh(Some(&login.refresh_token)).await.is_err());
    }

    #[tokio::test]
    async fn two_factor_gate() {
        let h = harness();
        let user = register(&h, "alice@example.com").await;

        let enrollment = h.service.setup_two_factor(user.id).await.unwrap();
        // Not enforced until confirmed.
        assert!(h.service.login("alice@example.com", "Sup3rSecret!", None).await.is_ok());

        let code = code_for(&enrollment.secret_base32);
        assert!(matches!(
            h.service.enable_two_factor(user.id, &wrong_code(&code)).await,
            Err(AppError::InvalidStepUpCode)
        ));
        h.service.enable_two_factor(user.id, &code).await.unwrap();

        assert!(matches!(
            h.service.login("alice@example.com", "Sup3rSecret!", None).await,
            Err(AppError::StepUpRequired)
        ));
        assert!(matches!(
            h.service
                .login("alice@example.com", "Sup3rSecret!", Some(&wrong_code(&code)))
                .await,
            Err(AppError::InvalidStepUpCode)
        ));
        let grant = h
            .service
            .login("alice@example.com", "Sup3rSecret!", Some(&code_for(&enrollment.secret_base32)))
            .await
            .unwrap();
        assert!(grant.user.two_factor_enabled);

        // Wrong password is reported before the second factor.
        assert!(matches!(
            h.service.login("alice@example.com", "wrong-password", None).await,
            Err(AppError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn abandoned_enrollment_is_replaced() {
        let h = harness();
        let user = register(&h, "alice@example.com").await;

        let abandoned = h.service.setup_two_factor(user.id).await.unwrap();
        let current = h.service.setup_two_factor(user.id).await.unwrap();
        assert_ne!(abandoned.secret_base32, current.secret_base32);

        let stale_code = code_for(&abandoned.secret_base32);
        if stale_code != code_for(&current.secret_base32) {
            assert!(h.service.enable_two_factor(user.id, &stale_code).await.is_err());
        }
        h.service
            .enable_two_factor(user.id, &code_for(&current.secret_base32))
            .await
            .unwrap();

        assert!(matches!(
            h.service.setup_two_factor(user.id).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn disabling_requires_a_valid_code() {
        let h = harness();
        let user = register(&h, "alice@example.com").await;
        let enrollment = h.service.setup_two_factor(user.id).await.unwrap();
        let code = code_for(&enrollment.secret_base32);
        h.service.enable_two_factor(user.id, &code).await.unwrap();

        assert!(matches!(
            h.service.disable_two_factor(user.id, &wrong_code(&code)).await,
            Err(AppError::InvalidStepUpCode)
        ));
        h.service
            .disable_two_factor(user.id, &code_for(&enrollment.secret_base32))
            .await
            .unwrap();

        let me = h.service.current_user(user.id).await.unwrap();
        assert!(!me.two_factor_enabled);
        assert!(h.service.login("alice@example.com", "Sup3rSecret!", None).await.is_ok());
    }

    #[tokio::test]
    async fn enabling_without_setup_is_a_bad_request() {
        let h = harness();
        let user = register(&h, "alice@example.com").await;
        assert!(matches!(
            h.service.enable_two_factor(user.id, "123456").await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            h.service.disable_two_factor(user.id, "123456").await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn password_change_ends_all_sessions() {
        let h = harness();
        let user = register(&h, "alice@example.com").await;
        let phone = h.service.login("alice@example.com", "Sup3rSecret!", None).await.unwrap();

        assert!(matches!(
            h.service.change_password(user.id, "wrong", "N3wSecret!!").await,
            Err(AppError::InvalidCredentials)
        ));
        h.service
            .change_password(user.id, "Sup3rSecret!", "N3wSecret!!")
            .await
            .unwrap();

        assert!(h.service.refresh(Some(&phone.refresh_token)).await.is_err());
        assert!(h.service.login("alice@example.com", "Sup3rSecret!", None).await.is_err());
        assert!(h.service.login("alice@example.com", "N3wSecret!!", None).await.is_ok());
    }

    /// Delegates to memory but fails every rotation write.
    struct FailingRotation(Arc<MemoryRefreshTokenStore>);

    #[async_trait]
    impl RefreshTokenStore for FailingRotation {
        async fn insert(&self, token_hash: &str, user_id: Uuid, expires_at: DateTime<Utc>) -> Result<bool> {
            self.0.insert(token_hash, user_id, expires_at).await
        }
        async fn find(&self, token: &str) -> Result<Option<RefreshToken>> {
            self.0.find(token).await
        }
        async fn revoke(&self, token: &str) -> Result<()> {
            self.0.revoke(token).await
        }
        async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64> {
            self.0.revoke_all_for_user(user_id).await
        }
        async fn rotate(&self, _: &str, _: Uuid, _: DateTime<Utc>) -> Result<Option<String>> {
            Err(AppError::StoreUnavailable("write failed".to_string()))
        }
        async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64> {
            self.0.purge_expired(before).await
        }
    }

    #[tokio::test]
    async fn failed_rotation_fails_closed() {
        let memory = Arc::new(MemoryRefreshTokenStore::new());
        let h = harness_with(Arc::new(FailingRotation(memory.clone())), memory, false, Some(LEGACY_SECRET));
        register(&h, "alice@example.com").await;
        let login = h.service.login("alice@example.com", "Sup3rSecret!", None).await.unwrap();

        assert!(matches!(
            h.service.refresh(Some(&login.refresh_token)).await,
            Err(AppError::StoreUnavailable(_))
        ));
        assert!(h.tokens.find(&login.refresh_token).await.unwrap().unwrap().revoked);
    }

    #[tokio::test]
    async fn purge_removes_expired_sessions() {
        let h = harness();
        let user = register(&h, "alice@example.com").await;
        h.tokens.create(user.id, Utc::now() - Duration::days(1)).await.unwrap();
        h.service.login("alice@example.com", "Sup3rSecret!", None).await.unwrap();
        assert_eq!(h.service.purge_expired().await.unwrap(), 1);
    }
}
