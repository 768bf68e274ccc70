use std::future::Future;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::{GenericClient, Row};
use uuid::Uuid;
use crate::{
    crypto::token::{generate_opaque_token, hash_token},
    error::{AppError, Result},
    models::refresh_token::RefreshToken,
};

/// Attempts at generating a token value that is not already taken.
pub const MAX_TOKEN_ATTEMPTS: usize = 3;

/// Generates opaque tokens until `insert` accepts one, at most
/// [`MAX_TOKEN_ATTEMPTS`] times.
///
/// `insert` receives the digest and returns `false` on a uniqueness collision.
pub async fn issue_with_retry<F, Fut>(mut insert: F) -> Result<String>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    for attempt in 1..=MAX_TOKEN_ATTEMPTS {
        let token = generate_opaque_token();
        if insert(hash_token(&token)).await? {
            return Ok(token);
        }
        tracing::warn!(attempt, "Refresh token value collided, regenerating");
    }

    Err(AppError::Internal(format!(
        "No unique refresh token after {} attempts",
        MAX_TOKEN_ATTEMPTS
    )))
}

/// Server-side record of issued refresh tokens, keyed by token digest.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Inserts a row for `token_hash`. Returns `false` if the digest already exists.
    async fn insert(&self, token_hash: &str, user_id: Uuid, expires_at: DateTime<Utc>) -> Result<bool>;

    /// Returns the row for `token` whether or not it is revoked or expired.
    async fn find(&self, token: &str) -> Result<Option<RefreshToken>>;

    /// Marks `token` revoked. Idempotent; unknown tokens are ignored.
    async fn revoke(&self, token: &str) -> Result<()>;

    /// Revokes every unrevoked token of `user_id`, returning how many were live.
    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64>;

    /// Atomically revokes `token` and issues its successor.
    ///
    /// Returns `None` when `token` was no longer live at write time (another
    /// rotation won the race, or it expired).
    async fn rotate(
        &self,
        token: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<String>>;

    /// Physically deletes rows that expired before `before`.
    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Issues a new token for `user_id`.
    async fn create(&self, user_id: Uuid, expires_at: DateTime<Utc>) -> Result<String> {
        issue_with_retry(|token_hash| async move {
            self.insert(&token_hash, user_id, expires_at).await
        })
        .await
    }
}

fn row_to_refresh_token(row: &Row) -> Result<RefreshToken> {
    let missing = |e: tokio_postgres::Error| AppError::Internal(format!("Missing column: {}", e));
    Ok(RefreshToken {
        token_hash: row.try_get("token_hash").map_err(missing)?,
        user_id: row.try_get("user_id").map_err(missing)?,
        expires_at: row.try_get("expires_at").map_err(missing)?,
        revoked: row.try_get("revoked").map_err(missing)?,
        created_at: row.try_get("created_at").map_err(missing)?,
    })
}

async fn insert_row<C>(
    client: &C,
    token_hash: &str,
    user_id: Uuid,
    expires_at: DateTime<Utc>,
) -> Result<bool>
where
    C: GenericClient + Sync,
{
    let row = client
        .query_opt(
            r#"
            INSERT INTO refresh_tokens (token_hash, user_id, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (token_hash) DO NOTHING
            RETURNING token_hash
            "#,
            &[&token_hash, &user_id, &expires_at],
        )
        .await?;
    Ok(row.is_some())
}

/// PostgreSQL-backed `RefreshTokenStore`.
#[derive(Clone)]
pub struct PgRefreshTokenStore {
    pool: Pool,
}

impl PgRefreshTokenStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn insert(&self, token_hash: &str, user_id: Uuid, expires_at: DateTime<Utc>) -> Result<bool> {
        let client = self.pool.get().await?;
        let pg: &tokio_postgres::Client = &client;
        insert_row(pg, token_hash, user_id, expires_at).await
    }

    async fn find(&self, token: &str) -> Result<Option<RefreshToken>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                r#"
                SELECT token_hash, user_id, expires_at, revoked, created_at
                FROM refresh_tokens
                WHERE token_hash = $1
                "#,
                &[&hash_token(token)],
            )
            .await?;
        row.map(|r| row_to_refresh_token(&r)).transpose()
    }

    async fn revoke(&self, token: &str) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                UPDATE refresh_tokens
                SET revoked = true, revoked_at = COALESCE(revoked_at, NOW())
                WHERE token_hash = $1
                "#,
                &[&hash_token(token)],
            )
            .await?;
        Ok(())
    }

    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64> {
        let client = self.pool.get().await?;
        let revoked = client
            .execute(
                r#"
                UPDATE refresh_tokens
                SET revoked = true, revoked_at = NOW()
                WHERE user_id = $1 AND revoked = false
                "#,
                &[&user_id],
            )
            .await?;
        Ok(revoked)
    }

    async fn rotate(
        &self,
        token: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        // Revoke first: the row lock makes a concurrent rotation of the same
        // token wait here and then match zero rows.
        let revoked = tx
            .execute(
                r#"
                UPDATE refresh_tokens
                SET revoked = true, revoked_at = NOW()
                WHERE token_hash = $1 AND user_id = $2 AND revoked = false AND expires_at > NOW()
                "#,
                &[&hash_token(token), &user_id],
            )
            .await?;

        if revoked == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let pg_tx: &tokio_postgres::Transaction<'_> = &tx;
        let issued = issue_with_retry(|token_hash| async move {
            insert_row(pg_tx, &token_hash, user_id, expires_at).await
        })
        .await;

        match issued {
            Ok(next) => {
                tx.commit().await?;
                Ok(Some(next))
            }
            Err(e) => {
                // Keep the revocation even though no successor exists.
                if let Err(commit_err) = tx.commit().await {
                    tracing::error!("Failed to commit revocation after rotation failure: {}", commit_err);
                }
                Err(e)
            }
        }
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute(
                "DELETE FROM refresh_tokens WHERE expires_at < $1",
                &[&before],
            )
            .await?;
        Ok(deleted)
    }
}
