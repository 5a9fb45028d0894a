//! Audit event model - security-relevant outcomes of the session core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    LoginSuccess,
    LoginFailure,
    LoginThrottled,
    TwoFactorRequired,
    TwoFactorFailure,
    TokenRefreshed,
    TokenReuseDetected,
    Logout,
    PermissionGranted,
    PermissionRevoked,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventKind::LoginSuccess => "login_success",
            AuditEventKind::LoginFailure => "login_failure",
            AuditEventKind::LoginThrottled => "login_throttled",
            AuditEventKind::TwoFactorRequired => "two_factor_required",
            AuditEventKind::TwoFactorFailure => "two_factor_failure",
            AuditEventKind::TokenRefreshed => "token_refreshed",
            AuditEventKind::TokenReuseDetected => "token_reuse_detected",
            AuditEventKind::Logout => "logout",
            AuditEventKind::PermissionGranted => "permission_granted",
            AuditEventKind::PermissionRevoked => "permission_revoked",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub principal_id: Option<Uuid>,
    pub kind: AuditEventKind,
    pub description: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        principal_id: Option<Uuid>,
        kind: AuditEventKind,
        description: impl Into<String>,
        metadata: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal_id,
            kind,
            description: description.into(),
            metadata,
            created_at,
        }
    }
}
