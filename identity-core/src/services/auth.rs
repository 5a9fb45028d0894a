use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use super::audit::AuditSink;
use super::clock::Clock;
use super::delivery::ChallengeDelivery;
use super::error::ServiceError;
use super::jwt::{SignedToken, TokenIssuer};
use super::metrics;
use super::refresh_ledger::{IssuedRefreshToken, LedgerError, RefreshTokenLedger};
use super::store::{CredentialStore, StoreError};
use super::throttle::LoginThrottle;
use super::two_factor;
use crate::dtos::auth::{LoginOutcome, LoginRequest, TokenBundle, VerifyTwoFactorRequest};
use crate::models::{AuditEventKind, Principal};

/// Sequences credential check, optional second factor and token issuance.
///
/// Every public method converts unexpected failures into a detail-free
/// `ServiceError::Internal` after logging them.
pub struct LoginOrchestrator {
    credentials: Arc<dyn CredentialStore>,
    issuer: Arc<TokenIssuer>,
    ledger: Arc<RefreshTokenLedger>,
    delivery: Arc<dyn ChallengeDelivery>,
    audit: Arc<dyn AuditSink>,
    throttle: Arc<LoginThrottle>,
    clock: Arc<dyn Clock>,
}

fn store_failure(err: StoreError) -> ServiceError {
    ServiceError::Internal(anyhow::anyhow!(err))
}

impl LoginOrchestrator {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        issuer: Arc<TokenIssuer>,
        ledger: Arc<RefreshTokenLedger>,
        delivery: Arc<dyn ChallengeDelivery>,
        audit: Arc<dyn AuditSink>,
        throttle: Arc<LoginThrottle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            credentials,
            issuer,
            ledger,
            delivery,
            audit,
            throttle,
            clock,
        }
    }

    fn sanitize(&self, operation: &'static str, err: ServiceError) -> ServiceError {
        match err {
            ServiceError::Internal(e) => {
                tracing::error!(operation, error = ?e, "Unexpected failure");
                ServiceError::Internal(anyhow::anyhow!("unexpected failure"))
            }
            other => other,
        }
    }

    pub async fn login(&self, req: LoginRequest) -> Result<LoginOutcome, ServiceError> {
        self.try_login(req)
            .await
            .map_err(|e| self.sanitize("login", e))
    }

    async fn try_login(&self, req: LoginRequest) -> Result<LoginOutcome, ServiceError> {
        req.validate()?;

        if let Err(retry_after) = self.throttle.check(&req.username) {
            tracing::warn!(username = %req.username, retry_after, "Login throttled");
            self.audit.record(
                None,
                AuditEventKind::LoginThrottled,
                "Login throttled",
                json!({ "username": req.username, "retry_after": retry_after }),
            );
            metrics::record_login("throttled");
            return Err(ServiceError::TooManyAttempts { retry_after });
        }

        let principal = match self.credentials.find_by_username(&req.username).await {
            Ok(p) => p,
            Err(StoreError::NotFound) => {
                return Err(self.reject_credentials(None, &req.username, "unknown_user"))
            }
            Err(e) => return Err(store_failure(e)),
        };

        let password_ok = self
            .credentials
            .verify_password(&principal, &req.password)
            .await
            .map_err(store_failure)?;

        if !password_ok {
            return Err(self.reject_credentials(Some(principal.id), &req.username, "bad_password"));
        }

        if principal.two_factor_enabled {
            return self.start_challenge(&principal).await;
        }

        let bundle = self.establish_session(&principal, req.remember_me, false).await?;
        Ok(LoginOutcome::SessionEstablished(bundle))
    }

    /// Unknown user and wrong password share this path and its error.
    fn reject_credentials(
        &self,
        principal_id: Option<Uuid>,
        username: &str,
        reason: &str,
    ) -> ServiceError {
        tracing::info!(username = %username, reason, "Login rejected");
        self.audit.record(
            principal_id,
            AuditEventKind::LoginFailure,
            "Login failed",
            json!({ "username": username, "reason": reason }),
        );
        metrics::record_login("failure");
        ServiceError::InvalidCredentials
    }

    async fn start_challenge(&self, principal: &Principal) -> Result<LoginOutcome, ServiceError> {
        let challenge = two_factor::new_challenge(self.clock.now());
        self.credentials
            .set_challenge(principal.id, &challenge)
            .await
            .map_err(store_failure)?;

        if let Err(e) = self.delivery.send(&principal.email, &challenge.code).await {
            tracing::error!(principal_id = %principal.id, error = %e, "Challenge delivery failed");
            self.audit.record(
                Some(principal.id),
                AuditEventKind::LoginFailure,
                "Verification code could not be delivered",
                json!({ "reason": "challenge_delivery_failed" }),
            );
            metrics::record_login("delivery_failed");
            return Err(ServiceError::ChallengeDeliveryFailed);
        }

        self.audit.record(
            Some(principal.id),
            AuditEventKind::TwoFactorRequired,
            "Second factor required",
            json!({ "expires_at": challenge.expires_at }),
        );
        metrics::record_login("two_factor_pending");
        tracing::info!(principal_id = %principal.id, "Second factor challenge issued");

        Ok(LoginOutcome::TwoFactorPending {
            principal_id: principal.id,
            expires_at: challenge.expires_at,
        })
    }

    /// Completes a login left pending by [`login`](Self::login).
    pub async fn verify_two_factor(
        &self,
        req: VerifyTwoFactorRequest,
    ) -> Result<TokenBundle, ServiceError> {
        self.try_verify_two_factor(req)
            .await
            .map_err(|e| self.sanitize("verify_two_factor", e))
    }

    async fn try_verify_two_factor(
        &self,
        req: VerifyTwoFactorRequest,
    ) -> Result<TokenBundle, ServiceError> {
        req.validate()?;

        if let Err(retry_after) = self.throttle.check(&format!("2fa:{}", req.principal_id)) {
            self.audit.record(
                Some(req.principal_id),
                AuditEventKind::LoginThrottled,
                "Second factor throttled",
                json!({ "retry_after": retry_after }),
            );
            metrics::record_login("throttled");
            return Err(ServiceError::TooManyAttempts { retry_after });
        }

        let principal = match self.credentials.find_by_id(req.principal_id).await {
            Ok(p) => p,
            Err(StoreError::NotFound) => return Err(ServiceError::InvalidTwoFactorCode),
            Err(e) => return Err(store_failure(e)),
        };

        let now = self.clock.now();
        if !two_factor::validate_challenge(principal.challenge.as_ref(), &req.code, now) {
            return Err(self.reject_code(principal.id));
        }

        // A concurrent submission of the same code may have consumed it first.
        let consumed = self
            .credentials
            .clear_challenge(principal.id, &req.code)
            .await
            .map_err(store_failure)?;
        if !consumed {
            return Err(self.reject_code(principal.id));
        }

        self.establish_session(&principal, req.remember_me, true)
            .await
    }

    fn reject_code(&self, principal_id: Uuid) -> ServiceError {
        self.audit.record(
            Some(principal_id),
            AuditEventKind::TwoFactorFailure,
            "Invalid or expired verification code",
            json!({}),
        );
        metrics::record_login("two_factor_failure");
        ServiceError::InvalidTwoFactorCode
    }

    async fn establish_session(
        &self,
        principal: &Principal,
        remember_me: bool,
        two_factor: bool,
    ) -> Result<TokenBundle, ServiceError> {
        self.credentials
            .update_last_login(principal.id, self.clock.now())
            .await
            .map_err(store_failure)?;

        let roles: Vec<String> = self
            .credentials
            .get_roles(principal.id)
            .await
            .map_err(store_failure)?
            .into_iter()
            .map(|r| r.name)
            .collect();

        let access = self
            .issuer
            .issue(principal.id, &principal.username, &principal.email, &roles)?;

        let refresh = if remember_me {
            Some(self.ledger.issue(principal.id, access.jti).await?)
        } else {
            None
        };

        self.audit.record(
            Some(principal.id),
            AuditEventKind::LoginSuccess,
            "Login succeeded",
            json!({
                "jti": access.jti,
                "remember_me": remember_me,
                "two_factor": two_factor,
            }),
        );
        metrics::record_login("success");
        tracing::info!(principal_id = %principal.id, jti = %access.jti, "Session established");

        Ok(self.bundle(principal.id, access, refresh))
    }

    /// Rotates a refresh token. A second presentation of any token revokes
    /// the principal's whole family.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenBundle, ServiceError> {
        self.try_refresh(refresh_token)
            .await
            .map_err(|e| self.sanitize("refresh", e))
    }

    async fn try_refresh(&self, refresh_token: &str) -> Result<TokenBundle, ServiceError> {
        if refresh_token.is_empty() {
            return Err(ServiceError::InvalidRefreshToken);
        }

        match self.ledger.redeem(refresh_token).await {
            Ok(redemption) => {
                self.audit.record(
                    Some(redemption.principal_id),
                    AuditEventKind::TokenRefreshed,
                    "Refresh token rotated",
                    json!({ "jti": redemption.access_token.jti }),
                );
                metrics::record_refresh("rotated");
                Ok(self.bundle(
                    redemption.principal_id,
                    redemption.access_token,
                    Some(redemption.refresh_token),
                ))
            }
            Err(LedgerError::TokenReuseDetected { principal_id }) => {
                self.audit.record(
                    Some(principal_id),
                    AuditEventKind::TokenReuseDetected,
                    "Refresh token presented twice; all sessions revoked",
                    json!({}),
                );
                metrics::record_refresh("reuse_detected");
                Err(ServiceError::TokenReuseDetected)
            }
            Err(LedgerError::InvalidRefreshToken) => {
                metrics::record_refresh("invalid");
                Err(ServiceError::InvalidRefreshToken)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn logout(&self, refresh_token: &str) -> Result<(), ServiceError> {
        let result = async {
            match self.ledger.revoke(refresh_token).await? {
                Some(principal_id) => {
                    self.audit.record(
                        Some(principal_id),
                        AuditEventKind::Logout,
                        "Logged out",
                        json!({}),
                    );
                    tracing::info!(principal_id = %principal_id, "Logged out");
                    Ok::<(), ServiceError>(())
                }
                None => Err(ServiceError::InvalidRefreshToken),
            }
        }
        .await;

        result.map_err(|e| self.sanitize("logout", e))
    }

    /// Revokes every refresh token the principal holds.
    pub async fn logout_everywhere(&self, principal_id: Uuid) -> Result<u64, ServiceError> {
        let result = async {
            let count = self.ledger.revoke_all(principal_id).await?;
            self.audit.record(
                Some(principal_id),
                AuditEventKind::Logout,
                "Logged out of all sessions",
                json!({ "revoked": count }),
            );
            Ok::<u64, ServiceError>(count)
        }
        .await;

        result.map_err(|e| self.sanitize("logout_everywhere", e))
    }

    fn bundle(
        &self,
        principal_id: Uuid,
        access: SignedToken,
        refresh: Option<IssuedRefreshToken>,
    ) -> TokenBundle {
        let (refresh_token, refresh_token_expires_at) = match refresh {
            Some(r) => (Some(r.token), Some(r.expires_at)),
            None => (None, None),
        };

        TokenBundle {
            principal_id,
            access_token: access.value,
            access_token_expires_at: access.expires_at,
            jti: access.jti,
            refresh_token,
            refresh_token_expires_at,
            token_type: "Bearer".to_string(),
            expires_in: self.issuer.lifetime_seconds(),
        }
    }
}
