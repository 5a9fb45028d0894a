pub mod config;
pub mod dtos;
pub mod handlers;
pub mod models;
pub mod services;
pub mod utils;

use service_core::axum::{routing::get, Router};
use std::sync::Arc;

use crate::config::CoreSettings;
use crate::services::{
    AuditSink, AuthorizationResolver, ChallengeDelivery, Clock, CredentialStore, Database,
    InvalidationBus, LoginOrchestrator, LoginThrottle, PermissionCache, PolicyMap,
    RedisInvalidationBus, RefreshTokenLedger, RefreshTokenStore, RoleStore, TokenIssuer,
};
use service_core::error::AppError;

/// Everything the core needs from the outside world.
pub struct Collaborators {
    pub credentials: Arc<dyn CredentialStore>,
    pub roles: Arc<dyn RoleStore>,
    pub refresh_tokens: Arc<dyn RefreshTokenStore>,
    pub delivery: Arc<dyn ChallengeDelivery>,
    pub audit: Arc<dyn AuditSink>,
    pub invalidation: Arc<dyn InvalidationBus>,
    pub clock: Arc<dyn Clock>,
}

/// The assembled services, shared by every caller in the process.
#[derive(Clone)]
pub struct IdentityCore {
    pub orchestrator: Arc<LoginOrchestrator>,
    pub resolver: Arc<AuthorizationResolver>,
    pub cache: Arc<PermissionCache>,
    pub ledger: Arc<RefreshTokenLedger>,
    pub issuer: Arc<TokenIssuer>,
    pub throttle: Arc<LoginThrottle>,
}

impl IdentityCore {
    /// Validates `settings` and wires the services together.
    pub fn assemble(
        collaborators: Collaborators,
        settings: &CoreSettings,
        policies: PolicyMap,
    ) -> Result<Self, AppError> {
        settings.validate()?;

        let Collaborators {
            credentials,
            roles,
            refresh_tokens,
            delivery,
            audit,
            invalidation,
            clock,
        } = collaborators;

        let issuer = Arc::new(
            TokenIssuer::new(&settings.jwt, clock.clone()).map_err(AppError::ConfigError)?,
        );

        let cache = Arc::new(PermissionCache::new(
            roles,
            audit.clone(),
            invalidation,
            clock.clone(),
        ));

        let ledger = Arc::new(RefreshTokenLedger::new(
            refresh_tokens,
            credentials.clone(),
            issuer.clone(),
            clock.clone(),
            settings.refresh.expiry_days,
        ));

        let resolver = Arc::new(AuthorizationResolver::new(
            credentials.clone(),
            cache.clone(),
            policies,
            settings.authz.legacy_policy_names,
        ));

        let throttle = Arc::new(LoginThrottle::new(&settings.rate_limit));

        let orchestrator = Arc::new(LoginOrchestrator::new(
            credentials,
            issuer.clone(),
            ledger.clone(),
            delivery,
            audit,
            throttle.clone(),
            clock,
        ));

        Ok(Self {
            orchestrator,
            resolver,
            cache,
            ledger,
            issuer,
            throttle,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub service_name: String,
    pub db: Database,
    pub redis: Option<RedisInvalidationBus>,
    pub core: IdentityCore,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
}
