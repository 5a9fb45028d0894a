use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

/// Persisted refresh token. Only the SHA-256 of the token value is stored.
///
/// `token_hash`, `jti`, `principal_id` and the timestamps never change after
/// insert; only `used` and `invalidated` are flipped.
#[derive(Debug, Clone, FromRow)]
pub struct RefreshTokenRecord {
    pub token_hash: String,
    /// Access token this refresh token was issued alongside.
    pub jti: Uuid,
    pub principal_id: Uuid,
    #[sqlx(rename = "created_utc")]
    pub created_at: DateTime<Utc>,
    #[sqlx(rename = "expires_utc")]
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub invalidated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTokenState {
    Issued,
    Used,
    Invalidated,
    Expired,
}

impl RefreshTokenRecord {
    pub fn new(
        token: &str,
        jti: Uuid,
        principal_id: Uuid,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            token_hash: Self::hash_token(token),
            jti,
            principal_id,
            created_at,
            expires_at,
            used: false,
            invalidated: false,
        }
    }

    /// Hash a token using SHA-256
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Invalidation wins over use, use wins over expiry.
    pub fn state(&self, now: DateTime<Utc>) -> RefreshTokenState {
        if self.invalidated {
            RefreshTokenState::Invalidated
        } else if self.used {
            RefreshTokenState::Used
        } else if now >= self.expires_at {
            RefreshTokenState::Expired
        } else {
            RefreshTokenState::Issued
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(now: DateTime<Utc>) -> RefreshTokenRecord {
        RefreshTokenRecord::new(
            "token_abc",
            Uuid::new_v4(),
            Uuid::new_v4(),
            now,
            now + Duration::days(30),
        )
    }

    #[test]
    fn stores_hash_not_value() {
        let rec = record(Utc::now());
        assert_ne!(rec.token_hash, "token_abc");
        assert_eq!(rec.token_hash, RefreshTokenRecord::hash_token("token_abc"));
        assert_eq!(rec.token_hash.len(), 64);
    }

    #[test]
    fn state_transitions() {
        let now = Utc::now();
        let mut rec = record(now);
        assert_eq!(rec.state(now), RefreshTokenState::Issued);
        assert_eq!(rec.state(rec.expires_at), RefreshTokenState::Expired);

        rec.used = true;
        assert_eq!(rec.state(now), RefreshTokenState::Used);

        rec.invalidated = true;
        assert_eq!(rec.state(now), RefreshTokenState::Invalidated);
    }
}
