use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::clock::Clock;
use crate::config::JwtSettings;

/// The only validation failure callers ever see.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Invalid token")]
pub struct InvalidToken;

/// Claims for access tokens (short-lived)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject (principal ID)
    pub sub: String,
    pub username: String,
    pub email: String,
    /// One entry per role name
    pub roles: Vec<String>,
    /// Correlates refresh tokens issued alongside this token
    pub jti: Uuid,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

impl AccessClaims {
    pub fn principal_id(&self) -> Result<Uuid, InvalidToken> {
        Uuid::parse_str(&self.sub).map_err(|_| InvalidToken)
    }
}

#[derive(Debug, Clone)]
pub struct SignedToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
    pub jti: Uuid,
}

/// HS256 access-token minting and validation.
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    audience: String,
    lifetime: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenIssuer {
    pub fn new(settings: &JwtSettings, clock: Arc<dyn Clock>) -> Result<Self, anyhow::Error> {
        let secret = settings.secret.expose_secret();
        if secret.is_empty() {
            return Err(anyhow::anyhow!("JWT secret must not be empty"));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[settings.issuer.as_str()]);
        validation.set_audience(&[settings.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.leeway = 0;
        // Expiry is checked against the injected clock instead.
        validation.validate_exp = false;

        tracing::info!(issuer = %settings.issuer, "Token issuer initialized with HS256");

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            issuer: settings.issuer.clone(),
            audience: settings.audience.clone(),
            lifetime: Duration::minutes(settings.access_token_expiry_minutes),
            clock,
        })
    }

    pub fn issue(
        &self,
        principal_id: Uuid,
        username: &str,
        email: &str,
        roles: &[String],
    ) -> Result<SignedToken, anyhow::Error> {
        let now = self.clock.now();
        let expires_at = now + self.lifetime;
        let jti = Uuid::new_v4();

        let claims = AccessClaims {
            sub: principal_id.to_string(),
            username: username.to_string(),
            email: email.to_string(),
            roles: roles.to_vec(),
            jti,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };

        let value = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode access token: {}", e))?;

        Ok(SignedToken {
            value,
            // Second precision, matching the `exp` claim.
            expires_at: Utc
                .timestamp_opt(claims.exp, 0)
                .single()
                .unwrap_or(expires_at),
            jti,
        })
    }

    /// Checks signature, issuer, audience and expiry with zero skew; a token
    /// is dead from the second named in `exp`.
    pub fn validate(&self, token: &str) -> Result<AccessClaims, InvalidToken> {
        let data = decode::<AccessClaims>(token, &self.decoding_key, &self.validation).map_err(
            |e| {
                tracing::debug!(error = %e, "Access token rejected");
                InvalidToken
            },
        )?;

        if self.clock.now().timestamp() >= data.claims.exp {
            tracing::debug!(jti = %data.claims.jti, "Access token expired");
            return Err(InvalidToken);
        }

        Ok(data.claims)
    }

    /// Get access token expiry in seconds (for client info)
    pub fn lifetime_seconds(&self) -> i64 {
        self.lifetime.num_seconds()
    }
}
