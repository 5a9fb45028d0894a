//! Collaborator contracts for the backing record store.
//!
//! Both [`MemoryStore`](super::MemoryStore) and [`Database`](super::Database)
//! implement every trait here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{AuditEvent, Permission, Principal, RefreshTokenRecord, Role, TwoFactorChallenge};
use crate::utils::password;

/// Absent and transiently failing are different outcomes: callers fail
/// closed on the latter instead of treating it as "no such record".
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found")]
    NotFound,

    #[error("Store unavailable: {0}")]
    Unavailable(anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            other => StoreError::Unavailable(anyhow::anyhow!(other)),
        }
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_username(&self, username: &str) -> StoreResult<Principal>;

    async fn find_by_id(&self, principal_id: Uuid) -> StoreResult<Principal>;

    /// Argon2 verification runs on the blocking pool.
    async fn verify_password(&self, principal: &Principal, password: &str) -> StoreResult<bool> {
        let hash = principal.password_hash.clone();
        let candidate = password.to_string();

        tokio::task::spawn_blocking(move || password::verify_password(&candidate, &hash))
            .await
            .map_err(|e| StoreError::Unavailable(anyhow::anyhow!(e)))?
            .map_err(StoreError::Unavailable)
    }

    async fn get_roles(&self, principal_id: Uuid) -> StoreResult<Vec<Role>>;

    async fn update_last_login(&self, principal_id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;

    async fn set_challenge(
        &self,
        principal_id: Uuid,
        challenge: &TwoFactorChallenge,
    ) -> StoreResult<()>;

    /// Removes the challenge only while it still carries `code`. Returns
    /// whether this call consumed it.
    async fn clear_challenge(&self, principal_id: Uuid, code: &str) -> StoreResult<bool>;
}

#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn find_role(&self, role_id: Uuid) -> StoreResult<Role>;

    async fn find_role_by_name(&self, name: &str) -> StoreResult<Role>;

    async fn find_permission_by_name(&self, name: &str) -> StoreResult<Permission>;

    /// Names of the active permissions granted to the role.
    async fn role_permissions(&self, role_id: Uuid) -> StoreResult<Vec<String>>;

    /// Returns false when the grant already existed.
    async fn grant_permission(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
        granted_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Returns false when there was nothing to revoke.
    async fn revoke_permission(&self, role_id: Uuid, permission_id: Uuid) -> StoreResult<bool>;
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn insert(&self, record: &RefreshTokenRecord) -> StoreResult<()>;

    async fn find_by_hash(&self, token_hash: &str) -> StoreResult<Option<RefreshTokenRecord>>;

    /// Atomically flips `used` from false to true on a live record.
    ///
    /// Exactly one concurrent caller per token observes `true`.
    async fn claim(&self, token_hash: &str) -> StoreResult<bool>;

    async fn invalidate(&self, token_hash: &str) -> StoreResult<bool>;

    /// Invalidates every record owned by the principal; returns how many changed.
    async fn invalidate_family(&self, principal_id: Uuid) -> StoreResult<u64>;

    async fn purge_expired(&self, before: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert_audit_event(&self, event: &AuditEvent) -> StoreResult<()>;
}
