//! Principal model - an authenticated identity and its pending second factor.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A user account as seen by the authorization core.
///
/// Soft-deleted principals are never returned by credential lookups.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    /// Argon2 PHC string.
    pub password_hash: String,
    pub two_factor_enabled: bool,
    pub deleted: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub challenge: Option<TwoFactorChallenge>,
}

impl Principal {
    pub fn new(username: &str, email: &str, password_hash: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
            two_factor_enabled: false,
            deleted: false,
            last_login_at: None,
            challenge: None,
        }
    }

    pub fn with_two_factor(mut self) -> Self {
        self.two_factor_enabled = true;
        self
    }
}

/// The single live second-factor challenge for a principal.
///
/// Writing a new challenge replaces the previous one.
#[derive(Clone, PartialEq, Eq)]
pub struct TwoFactorChallenge {
    pub code: String,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// Keep codes out of logs.
impl std::fmt::Debug for TwoFactorChallenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoFactorChallenge")
            .field("code", &"******")
            .field("generated_at", &self.generated_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn challenge_debug_hides_code() {
        let now = Utc::now();
        let challenge = TwoFactorChallenge {
            code: "123456".to_string(),
            generated_at: now,
            expires_at: now + Duration::minutes(5),
        };

        assert!(!format!("{:?}", challenge).contains("123456"));
    }

    #[test]
    fn new_principal_defaults() {
        let principal = Principal::new("admin", "admin@example.com", "hash".to_string());
        assert!(!principal.two_factor_enabled);
        assert!(!principal.deleted);
        assert!(principal.challenge.is_none());
        assert!(principal.with_two_factor().two_factor_enabled);
    }
}
