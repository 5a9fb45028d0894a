//! PostgreSQL record store.
//!
//! Uses sqlx runtime queries; schema lives in `migrations/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use uuid::Uuid;

use super::store::{
    AuditStore, CredentialStore, RefreshTokenStore, RoleStore, StoreError, StoreResult,
};
use crate::config::DatabaseConfig;
use crate::models::{AuditEvent, Permission, Principal, RefreshTokenRecord, Role, TwoFactorChallenge};

const FOREIGN_KEY_VIOLATION: &str = "23503";

/// PostgreSQL database wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct PrincipalRow {
    principal_id: Uuid,
    username: String,
    email: String,
    password_hash: String,
    two_factor_enabled: bool,
    deleted: bool,
    last_login_utc: Option<DateTime<Utc>>,
    challenge_code: Option<String>,
    challenge_generated_utc: Option<DateTime<Utc>>,
    challenge_expires_utc: Option<DateTime<Utc>>,
}

impl From<PrincipalRow> for Principal {
    fn from(row: PrincipalRow) -> Self {
        let challenge = match (
            row.challenge_code,
            row.challenge_generated_utc,
            row.challenge_expires_utc,
        ) {
            (Some(code), Some(generated_at), Some(expires_at)) => Some(TwoFactorChallenge {
                code,
                generated_at,
                expires_at,
            }),
            _ => None,
        };

        Principal {
            id: row.principal_id,
            username: row.username,
            email: row.email,
            password_hash: row.password_hash,
            two_factor_enabled: row.two_factor_enabled,
            deleted: row.deleted,
            last_login_at: row.last_login_utc,
            challenge,
        }
    }
}

const PRINCIPAL_COLUMNS: &str = "principal_id, username, email, password_hash, two_factor_enabled, \
     deleted, last_login_utc, challenge_code, challenge_generated_utc, challenge_expires_utc";

const REFRESH_COLUMNS: &str =
    "token_hash, jti, principal_id, created_utc, expires_utc, used, invalidated";

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.url)
            .await
            .map_err(|e| {
                tracing::error!("Failed to connect to PostgreSQL: {}", e);
                AppError::DatabaseError(anyhow::anyhow!("Failed to connect to PostgreSQL: {}", e))
            })?;

        tracing::info!(
            max_connections = config.max_connections,
            "Connected to PostgreSQL"
        );
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    /// Health check - ping the database.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Database health check failed: {}", e);
                AppError::DatabaseError(anyhow::anyhow!("Database health check failed: {}", e))
            })?;
        Ok(())
    }

    async fn role_exists(&self, role_id: Uuid) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM roles WHERE role_id = $1)")
            .bind(role_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }
}

fn missing_reference(err: sqlx::Error) -> StoreError {
    let is_fk = err
        .as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == FOREIGN_KEY_VIOLATION)
        .unwrap_or(false);

    if is_fk {
        StoreError::NotFound
    } else {
        err.into()
    }
}

#[async_trait]
impl CredentialStore for Database {
    async fn find_by_username(&self, username: &str) -> StoreResult<Principal> {
        let sql = format!(
            "SELECT {} FROM principals WHERE username = $1 AND deleted = FALSE",
            PRINCIPAL_COLUMNS
        );
        sqlx::query_as::<_, PrincipalRow>(&sql)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?
            .map(Principal::from)
            .ok_or(StoreError::NotFound)
    }

    async fn find_by_id(&self, principal_id: Uuid) -> StoreResult<Principal> {
        let sql = format!(
            "SELECT {} FROM principals WHERE principal_id = $1 AND deleted = FALSE",
            PRINCIPAL_COLUMNS
        );
        sqlx::query_as::<_, PrincipalRow>(&sql)
            .bind(principal_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Principal::from)
            .ok_or(StoreError::NotFound)
    }

    async fn get_roles(&self, principal_id: Uuid) -> StoreResult<Vec<Role>> {
        let roles = sqlx::query_as::<_, Role>(
            r#"
            SELECT r.role_id, r.role_name, r.description, r.created_utc, r.created_by
            FROM roles r
            JOIN principal_roles pr ON pr.role_id = r.role_id
            JOIN principals p ON p.principal_id = pr.principal_id
            WHERE pr.principal_id = $1 AND p.deleted = FALSE
            ORDER BY r.role_name
            "#,
        )
        .bind(principal_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(roles)
    }

    async fn update_last_login(&self, principal_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE principals SET last_login_utc = $2 WHERE principal_id = $1 AND deleted = FALSE",
        )
        .bind(principal_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn set_challenge(
        &self,
        principal_id: Uuid,
        challenge: &TwoFactorChallenge,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE principals
            SET challenge_code = $2, challenge_generated_utc = $3, challenge_expires_utc = $4
            WHERE principal_id = $1 AND deleted = FALSE
            "#,
        )
        .bind(principal_id)
        .bind(&challenge.code)
        .bind(challenge.generated_at)
        .bind(challenge.expires_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn clear_challenge(&self, principal_id: Uuid, code: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE principals
            SET challenge_code = NULL, challenge_generated_utc = NULL, challenge_expires_utc = NULL
            WHERE principal_id = $1 AND challenge_code = $2
            "#,
        )
        .bind(principal_id)
        .bind(code)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl RoleStore for Database {
    async fn find_role(&self, role_id: Uuid) -> StoreResult<Role> {
        sqlx::query_as::<_, Role>(
            "SELECT role_id, role_name, description, created_utc, created_by FROM roles WHERE role_id = $1",
        )
        .bind(role_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn find_role_by_name(&self, name: &str) -> StoreResult<Role> {
        sqlx::query_as::<_, Role>(
            "SELECT role_id, role_name, description, created_utc, created_by FROM roles WHERE role_name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn find_permission_by_name(&self, name: &str) -> StoreResult<Permission> {
        sqlx::query_as::<_, Permission>(
            "SELECT permission_id, permission_name, category, active FROM permissions WHERE permission_name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn role_permissions(&self, role_id: Uuid) -> StoreResult<Vec<String>> {
        if !self.role_exists(role_id).await? {
            return Err(StoreError::NotFound);
        }

        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT p.permission_name
            FROM role_permissions rp
            JOIN permissions p ON p.permission_id = rp.permission_id
            WHERE rp.role_id = $1 AND p.active = TRUE
            ORDER BY p.permission_name
            "#,
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn grant_permission(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
        granted_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO role_permissions (role_id, permission_id, granted_utc)
            VALUES ($1, $2, $3)
            ON CONFLICT (role_id, permission_id) DO NOTHING
            "#,
        )
        .bind(role_id)
        .bind(permission_id)
        .bind(granted_at)
        .execute(&self.pool)
        .await
        .map_err(missing_reference)?;

        Ok(result.rows_affected() == 1)
    }

    async fn revoke_permission(&self, role_id: Uuid, permission_id: Uuid) -> StoreResult<bool> {
        if !self.role_exists(role_id).await? {
            return Err(StoreError::NotFound);
        }

        let result =
            sqlx::query("DELETE FROM role_permissions WHERE role_id = $1 AND permission_id = $2")
                .bind(role_id)
                .bind(permission_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl RefreshTokenStore for Database {
    async fn insert(&self, record: &RefreshTokenRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (token_hash, jti, principal_id, created_utc, expires_utc, used, invalidated)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&record.token_hash)
        .bind(record.jti)
        .bind(record.principal_id)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(record.used)
        .bind(record.invalidated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> StoreResult<Option<RefreshTokenRecord>> {
        let sql = format!(
            "SELECT {} FROM refresh_tokens WHERE token_hash = $1",
            REFRESH_COLUMNS
        );
        let record = sqlx::query_as::<_, RefreshTokenRecord>(&sql)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn claim(&self, token_hash: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET used = TRUE
            WHERE token_hash = $1 AND used = FALSE AND invalidated = FALSE
            "#,
        )
        .bind(token_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn invalidate(&self, token_hash: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET invalidated = TRUE WHERE token_hash = $1 AND invalidated = FALSE",
        )
        .bind(token_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn invalidate_family(&self, principal_id: Uuid) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET invalidated = TRUE WHERE principal_id = $1 AND invalidated = FALSE",
        )
        .bind(principal_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_utc <= $1")
            .bind(before)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AuditStore for Database {
    async fn insert_audit_event(&self, event: &AuditEvent) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (event_id, principal_id, event_kind, description, metadata, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(event.principal_id)
        .bind(event.kind.as_str())
        .bind(&event.description)
        .bind(&event.metadata)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
