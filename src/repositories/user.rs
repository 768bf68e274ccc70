use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio_postgres::{Row, error::SqlState, types::FromSql};
use uuid::Uuid;
use crate::{
    error::{AppError, Result},
    models::user::{NewUser, User},
};

/// Persistence of user records.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Inserts a user, failing with `DuplicateAccount` if the email is taken.
    async fn create(&self, new_user: NewUser) -> Result<User>;

    /// Finds a user by (lowercased) email.
    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Finds a user by their ID.
    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>>;

    /// Replaces the pending second factor secret of a user without a second factor enrolled.
    async fn set_pending_two_factor(&self, user_id: Uuid, sealed_secret: Vec<u8>) -> Result<()>;

    /// Flips enrollment on. The pending secret becomes the active one.
    async fn enable_two_factor(&self, user_id: Uuid) -> Result<()>;

    /// Flips enrollment off and discards the secret.
    async fn disable_two_factor(&self, user_id: Uuid) -> Result<()>;

    /// Updates a user's password digest.
    async fn update_password(&self, user_id: Uuid, password_hash: &str) -> Result<()>;
}

fn column<'a, T: FromSql<'a>>(row: &'a Row, name: &str) -> Result<T> {
    row.try_get(name)
        .map_err(|e| AppError::Internal(format!("Missing column {}: {}", name, e)))
}

/// A helper function to map a `tokio_postgres::Row` to a `User`.
fn row_to_user(row: &Row) -> Result<User> {
    let role: String = column(row, "role")?;
    Ok(User {
        id: column(row, "id")?,
        email: column(row, "email")?,
        name: column(row, "name")?,
        password_hash: column(row, "password_hash")?,
        role: role.parse().map_err(AppError::Internal)?,
        two_factor_enabled: column(row, "two_factor_enabled")?,
        two_factor_secret: column(row, "two_factor_secret")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}

const USER_COLUMNS: &str = "id, email, name, password_hash, role, two_factor_enabled, \
                            two_factor_secret, created_at, updated_at";

/// PostgreSQL-backed `UserStore`.
#[derive(Clone)]
pub struct PgUserStore {
    pool: Pool,
}

impl PgUserStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn create(&self, new_user: NewUser) -> Result<User> {
        let client = self.pool.get().await?;
        let id = Uuid::new_v4();
        let role = new_user.role.as_str();
        let row = client
            .query_one(
                &format!(
                    r#"
                    INSERT INTO users (id, email, name, password_hash, role)
                    VALUES ($1, $2, $3, $4, $5)
                    RETURNING {USER_COLUMNS}
                    "#
                ),
                &[&id, &new_user.email, &new_user.name, &new_user.password_hash, &role],
            )
            .await
            .map_err(|e| {
                if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                    AppError::DuplicateAccount
                } else {
                    AppError::from(e)
                }
            })?;
        row_to_user(&row)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower($1)"),
                &[&email],
            )
            .await?;
        row.map(|r| row_to_user(&r)).transpose()
    }

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"),
                &[&user_id],
            )
            .await?;
        row.map(|r| row_to_user(&r)).transpose()
    }

    async fn set_pending_two_factor(&self, user_id: Uuid, sealed_secret: Vec<u8>) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                r#"
                UPDATE users
                SET two_factor_secret = $1, updated_at = NOW()
                WHERE id = $2 AND two_factor_enabled = false
                "#,
                &[&sealed_secret, &user_id],
            )
            .await?;
        if updated == 0 {
            return Err(AppError::Validation("2FA is already enabled".to_string()));
        }
        Ok(())
    }

    async fn enable_two_factor(&self, user_id: Uuid) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                r#"
                UPDATE users
                SET two_factor_enabled = true, updated_at = NOW()
                WHERE id = $1 AND two_factor_secret IS NOT NULL
                "#,
                &[&user_id],
            )
            .await?;
        if updated == 0 {
            return Err(AppError::Validation("2FA setup has not been started".to_string()));
        }
        Ok(())
    }

    async fn disable_two_factor(&self, user_id: Uuid) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                UPDATE users
                SET two_factor_enabled = false, two_factor_secret = NULL, updated_at = NOW()
                WHERE id = $1
                "#,
                &[&user_id],
            )
            .await?;
        Ok(())
    }

    async fn update_password(&self, user_id: Uuid, password_hash: &str) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                UPDATE users
                SET password_hash = $1, updated_at = NOW()
                WHERE id = $2
                "#,
                &[&password_hash, &user_id],
            )
            .await?;
        Ok(())
    }
}

