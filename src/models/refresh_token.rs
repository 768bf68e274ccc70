use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One issued refresh token. Only the digest of the token is stored.
#[derive(Clone, Debug)]
pub struct RefreshToken {
    /// SHA-256 hex digest of the opaque token.
    pub token_hash: String,
    /// The owning user.
    pub user_id: Uuid,
    /// Absolute expiry, fixed at issuance.
    pub expires_at: DateTime<Utc>,
    /// Monotonic: once true, never reset.
    pub revoked: bool,
    /// The timestamp when the token was issued.
    pub created_at: DateTime<Utc>,
}

impl RefreshToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Unrevoked and unexpired.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && !self.is_expired_at(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(expires_in: Duration, revoked: bool) -> RefreshToken {
        let now = Utc::now();
        RefreshToken {
            token_hash: "h".into(),
            user_id: Uuid::new_v4(),
            expires_at: now + expires_in,
            revoked,
            created_at: now,
        }
    }

    #[test]
    fn liveness() {
        let now = Utc::now();
        assert!(token(Duration::days(1), false).is_live_at(now));
        assert!(!token(Duration::days(1), true).is_live_at(now));
        assert!(!token(Duration::seconds(-1), false).is_live_at(now));
    }
}
