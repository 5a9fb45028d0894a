use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, max = 256, message = "Username is required"))]
    pub username: String,

    #[validate(length(min = 1, max = 1024, message = "Password is required"))]
    pub password: String,

    #[serde(default)]
    pub remember_me: bool,
}

impl LoginRequest {
    pub fn new(username: &str, password: &str, remember_me: bool) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            remember_me,
        }
    }
}

// Keep passwords out of logs.
impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("remember_me", &self.remember_me)
            .finish()
    }
}

#[derive(Deserialize, Validate)]
pub struct VerifyTwoFactorRequest {
    pub principal_id: Uuid,

    #[validate(length(equal = 6, message = "Code must be 6 digits"))]
    pub code: String,

    #[serde(default)]
    pub remember_me: bool,
}

impl std::fmt::Debug for VerifyTwoFactorRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyTwoFactorRequest")
            .field("principal_id", &self.principal_id)
            .field("code", &"******")
            .field("remember_me", &self.remember_me)
            .finish()
    }
}

/// Token response returned to client
#[derive(Clone, Serialize)]
pub struct TokenBundle {
    pub principal_id: Uuid,
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub jti: Uuid,
    /// Present only for persistent ("remember me") sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    pub token_type: String,
    pub expires_in: i64,
}

impl std::fmt::Debug for TokenBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBundle")
            .field("principal_id", &self.principal_id)
            .field("jti", &self.jti)
            .field("access_token_expires_at", &self.access_token_expires_at)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginOutcome {
    SessionEstablished(TokenBundle),
    /// A code was sent; no tokens exist yet.
    TwoFactorPending {
        principal_id: Uuid,
        expires_at: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_request_debug_redacts_password() {
        let req = LoginRequest::new("admin", "hunter2", false);
        assert!(!format!("{:?}", req).contains("hunter2"));
    }

    #[test]
    fn empty_username_fails_validation() {
        assert!(LoginRequest::new("", "pw", false).validate().is_err());
        assert!(LoginRequest::new("admin", "", false).validate().is_err());
        assert!(LoginRequest::new("admin", "pw", false).validate().is_ok());
    }

    #[test]
    fn pending_outcome_serializes_with_status_tag() {
        let outcome = LoginOutcome::TwoFactorPending {
            principal_id: Uuid::nil(),
            expires_at: Utc::now(),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], "two_factor_pending");
        assert!(value.get("access_token").is_none());
    }
}
