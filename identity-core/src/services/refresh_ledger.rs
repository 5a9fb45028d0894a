//! Single-use refresh tokens with family-wide revocation on reuse.
//!
//! ```text
//! Issued ──redeem──▶ Used ──▶ (rotated: a new Issued record)
//!   │                 │
//!   │                 └─presented again──▶ whole family Invalidated
//!   └──time──▶ Expired
//! ```

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::clock::Clock;
use super::jwt::{SignedToken, TokenIssuer};
use super::store::{CredentialStore, RefreshTokenStore, StoreError};
use crate::models::{RefreshTokenRecord, RefreshTokenState};

const TOKEN_BYTES: usize = 64;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invalid refresh token")]
    InvalidRefreshToken,

    #[error("Refresh token reuse detected")]
    TokenReuseDetected { principal_id: Uuid },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Token value handed to the client. Only its hash is persisted.
#[derive(Clone)]
pub struct IssuedRefreshToken {
    pub token: String,
    pub jti: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for IssuedRefreshToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedRefreshToken")
            .field("jti", &self.jti)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Result of a successful rotation.
#[derive(Debug, Clone)]
pub struct Redemption {
    pub principal_id: Uuid,
    pub access_token: SignedToken,
    pub refresh_token: IssuedRefreshToken,
}

pub struct RefreshTokenLedger {
    store: Arc<dyn RefreshTokenStore>,
    credentials: Arc<dyn CredentialStore>,
    issuer: Arc<TokenIssuer>,
    clock: Arc<dyn Clock>,
    lifetime: Duration,
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

impl RefreshTokenLedger {
    pub fn new(
        store: Arc<dyn RefreshTokenStore>,
        credentials: Arc<dyn CredentialStore>,
        issuer: Arc<TokenIssuer>,
        clock: Arc<dyn Clock>,
        expiry_days: i64,
    ) -> Self {
        Self {
            store,
            credentials,
            issuer,
            clock,
            lifetime: Duration::days(expiry_days),
        }
    }

    /// New live record linked to the access token `jti`.
    pub async fn issue(
        &self,
        principal_id: Uuid,
        jti: Uuid,
    ) -> Result<IssuedRefreshToken, LedgerError> {
        let token = generate_token();
        let now = self.clock.now();
        let expires_at = now + self.lifetime;

        let record = RefreshTokenRecord::new(&token, jti, principal_id, now, expires_at);
        self.store.insert(&record).await?;

        tracing::debug!(principal_id = %principal_id, jti = %jti, "Refresh token issued");
        Ok(IssuedRefreshToken {
            token,
            jti,
            expires_at,
        })
    }

    /// Exchanges a live token for a new access token and a new refresh token.
    ///
    /// Of several concurrent redemptions of one token at most one succeeds;
    /// every other presentation revokes the principal's whole family,
    /// including a replacement the winner is still writing.
    pub async fn redeem(&self, token: &str) -> Result<Redemption, LedgerError> {
        let token_hash = RefreshTokenRecord::hash_token(token);
        let now = self.clock.now();

        let record = self
            .store
            .find_by_hash(&token_hash)
            .await?
            .ok_or(LedgerError::InvalidRefreshToken)?;

        match record.state(now) {
            RefreshTokenState::Issued => {}
            RefreshTokenState::Used => return Err(self.reuse_detected(record.principal_id).await),
            RefreshTokenState::Expired | RefreshTokenState::Invalidated => {
                return Err(LedgerError::InvalidRefreshToken)
            }
        }

        if !self.store.claim(&token_hash).await? {
            // Lost the race; look again to tell a concurrent use from a revoke.
            let current = self.store.find_by_hash(&token_hash).await?;
            return Err(match current {
                Some(r) if r.used && !r.invalidated => self.reuse_detected(r.principal_id).await,
                _ => LedgerError::InvalidRefreshToken,
            });
        }

        let principal = match self.credentials.find_by_id(record.principal_id).await {
            Ok(p) => p,
            Err(StoreError::NotFound) => {
                tracing::warn!(principal_id = %record.principal_id, "Refresh for missing principal");
                return Err(LedgerError::InvalidRefreshToken);
            }
            Err(e) => return Err(e.into()),
        };

        let roles: Vec<String> = self
            .credentials
            .get_roles(principal.id)
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect();

        let access_token =
            self.issuer
                .issue(principal.id, &principal.username, &principal.email, &roles)?;
        let refresh_token = self.issue(principal.id, access_token.jti).await?;

        // A reuse detected while the replacement was being written revoked
        // the family before that record existed.
        let revoked_meanwhile = self
            .store
            .find_by_hash(&token_hash)
            .await?
            .map_or(false, |r| r.invalidated);
        if revoked_meanwhile {
            self.store
                .invalidate(&RefreshTokenRecord::hash_token(&refresh_token.token))
                .await?;
            tracing::warn!(
                principal_id = %principal.id,
                jti = %access_token.jti,
                "Family revoked during rotation; replacement token withdrawn"
            );
            return Err(LedgerError::TokenReuseDetected {
                principal_id: principal.id,
            });
        }

        tracing::info!(
            principal_id = %principal.id,
            previous_jti = %record.jti,
            jti = %access_token.jti,
            "Refresh token rotated"
        );

        Ok(Redemption {
            principal_id: principal.id,
            access_token,
            refresh_token,
        })
    }

    async fn reuse_detected(&self, principal_id: Uuid) -> LedgerError {
        match self.store.invalidate_family(principal_id).await {
            Ok(count) => tracing::warn!(
                principal_id = %principal_id,
                invalidated = count,
                "Refresh token reuse detected; token family revoked"
            ),
            // Still reported as reuse so the event is audited.
            Err(e) => tracing::error!(
                principal_id = %principal_id,
                error = %e,
                "Refresh token reuse detected but family revocation failed"
            ),
        }
        LedgerError::TokenReuseDetected { principal_id }
    }

    /// Invalidates one token. Returns the owner when a live record changed.
    pub async fn revoke(&self, token: &str) -> Result<Option<Uuid>, LedgerError> {
        let token_hash = RefreshTokenRecord::hash_token(token);
        let Some(record) = self.store.find_by_hash(&token_hash).await? else {
            return Ok(None);
        };

        if self.store.invalidate(&token_hash).await? {
            Ok(Some(record.principal_id))
        } else {
            Ok(None)
        }
    }

    pub async fn revoke_all(&self, principal_id: Uuid) -> Result<u64, LedgerError> {
        Ok(self.store.invalidate_family(principal_id).await?)
    }

    /// Deletes records whose expiry has passed.
    pub async fn purge_expired(&self) -> Result<u64, LedgerError> {
        Ok(self.store.purge_expired(self.clock.now()).await?)
    }
}
