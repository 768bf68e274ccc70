//! In-memory stores for development without PostgreSQL, and for tests.

use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;
use crate::{
    crypto::token::hash_token,
    error::{AppError, Result},
    models::{
        refresh_token::RefreshToken,
        user::{NewUser, User},
    },
    repositories::{
        refresh_token::{RefreshTokenStore, issue_with_retry},
        user::UserStore,
    },
};

/// A `UserStore` backed by a map.
#[derive(Clone, Default)]
pub struct MemoryUserStore {
    users: Arc<RwLock<HashMap<Uuid, User>>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn create(&self, new_user: NewUser) -> Result<User> {
        let mut users = self.users.write().await;

        if users
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(&new_user.email))
        {
            return Err(AppError::DuplicateAccount);
        }

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email: new_user.email,
            name: new_user.name,
            password_hash: new_user.password_hash,
            role: new_user.role,
            two_factor_enabled: false,
            two_factor_secret: None,
            created_at: now,
            updated_at: now,
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        Ok(self.users.read().await.get(&user_id).cloned())
    }

    async fn set_pending_two_factor(&self, user_id: Uuid, sealed_secret: Vec<u8>) -> Result<()> {
        let mut users = self.users.write().await;
        match users.get_mut(&user_id) {
            Some(user) if !user.two_factor_enabled => {
                user.two_factor_secret = Some(sealed_secret);
                user.updated_at = Utc::now();
                Ok(())
            }
            Some(_) => Err(AppError::Validation("2FA is already enabled".to_string())),
            None => Err(AppError::TokenInvalidOrExpired),
        }
    }

    async fn enable_two_factor(&self, user_id: Uuid) -> Result<()> {
        let mut users = self.users.write().await;
        match users.get_mut(&user_id) {
            Some(user) if user.two_factor_secret.is_some() => {
                user.two_factor_enabled = true;
                user.updated_at = Utc::now();
                Ok(())
            }
            Some(_) => Err(AppError::Validation("2FA setup has not been started".to_string())),
            None => Err(AppError::TokenInvalidOrExpired),
        }
    }

    async fn disable_two_factor(&self, user_id: Uuid) -> Result<()> {
        if let Some(user) = self.users.write().await.get_mut(&user_id) {
            user.two_factor_enabled = false;
            user.two_factor_secret = None;
            user.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_password(&self, user_id: Uuid, password_hash: &str) -> Result<()> {
        if let Some(user) = self.users.write().await.get_mut(&user_id) {
            user.password_hash = password_hash.to_string();
            user.updated_at = Utc::now();
        }
        Ok(())
    }
}

/// A `RefreshTokenStore` backed by a map keyed by token digest.
#[derive(Clone, Default)]
pub struct MemoryRefreshTokenStore {
    tokens: Arc<Mutex<HashMap<String, RefreshToken>>>,
}

impl MemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_locked(
        tokens: &mut HashMap<String, RefreshToken>,
        token_hash: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> bool {
        if tokens.contains_key(token_hash) {
            return false;
        }
        tokens.insert(
            token_hash.to_string(),
            RefreshToken {
                token_hash: token_hash.to_string(),
                user_id,
                expires_at,
                revoked: false,
                created_at: Utc::now(),
            },
        );
        true
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryRefreshTokenStore {
    async fn insert(&self, token_hash: &str, user_id: Uuid, expires_at: DateTime<Utc>) -> Result<bool> {
        let mut tokens = self.tokens.lock().await;
        Ok(Self::insert_locked(&mut tokens, token_hash, user_id, expires_at))
    }

    async fn find(&self, token: &str) -> Result<Option<RefreshToken>> {
        Ok(self.tokens.lock().await.get(&hash_token(token)).cloned())
    }

    async fn revoke(&self, token: &str) -> Result<()> {
        if let Some(row) = self.tokens.lock().await.get_mut(&hash_token(token)) {
            row.revoked = true;
        }
        Ok(())
    }

    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64> {
        let mut tokens = self.tokens.lock().await;
        let mut revoked = 0;
        for row in tokens.values_mut() {
            if row.user_id == user_id && !row.revoked {
                row.revoked = true;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn rotate(
        &self,
        token: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let mut tokens = self.tokens.lock().await;

        match tokens.get_mut(&hash_token(token)) {
            Some(row) if row.user_id == user_id && row.is_live_at(Utc::now()) => {
                row.revoked = true;
            }
            _ => return Ok(None),
        }

        let tokens = &mut *tokens;
        let next = issue_with_retry(|token_hash| {
            let inserted = Self::insert_locked(tokens, &token_hash, user_id, expires_at);
            async move { Ok(inserted) }
        })
        .await?;

        Ok(Some(next))
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut tokens = self.tokens.lock().await;
        let len = tokens.len();
        tokens.retain(|_, row| row.expires_at >= before);
        Ok((len - tokens.len()) as u64)
    }
}
