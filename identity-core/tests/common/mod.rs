//! Shared fixtures for identity-core integration tests.
//!
//! Everything runs in-process against `MemoryStore` and a `ManualClock`.

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use identity_core::{
    config::{AuthzSettings, CoreSettings, JwtSettings, RateLimitSettings, RefreshSettings},
    models::{Permission, Principal, Role},
    services::{
        CredentialStore, LocalInvalidationBus, ManualClock, MemoryStore, MockChallengeDelivery,
        PermissionOp, PolicyMap, RecordingAuditSink, RefreshTokenStore,
    },
    utils::password::hash_password,
    Collaborators, IdentityCore,
};
use secrecy::SecretString;
use std::sync::Arc;
use uuid::Uuid;

pub const ADMIN_PASSWORD: &str = "correct horse battery staple";
pub const ALICE_PASSWORD: &str = "alice-secret-passphrase";
pub const JWT_SECRET: &str = "integration-test-secret-at-least-32-bytes";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("identity_core=debug")
        .with_test_writer()
        .try_init();
}

pub fn settings() -> CoreSettings {
    CoreSettings {
        jwt: JwtSettings {
            secret: SecretString::new(JWT_SECRET.to_string()),
            issuer: "identity-core".to_string(),
            audience: "identity-clients".to_string(),
            access_token_expiry_minutes: 15,
        },
        refresh: RefreshSettings {
            expiry_days: 30,
            purge_interval_seconds: 3600,
        },
        rate_limit: RateLimitSettings {
            login_attempts: 5,
            login_window_seconds: 900,
        },
        authz: AuthzSettings::default(),
    }
}

pub fn policies() -> PolicyMap {
    PolicyMap::new()
        .with("DeleteUser", "Users.Delete")
        .with("ListUsers", "Users.View")
        .with("ExportReports", "Reports.Export")
}

/// Stand-ins placed in front of the shared `MemoryStore`.
#[derive(Default)]
pub struct StoreOverrides {
    pub credentials: Option<Arc<dyn CredentialStore>>,
    pub refresh_tokens: Option<Arc<dyn RefreshTokenStore>>,
}

/// Seeded world:
///
/// * `admin` holds `Administrator` = {Users.Delete, Users.View}
/// * `alice` has two-factor enabled and holds `Viewer` = {Users.View}
/// * `Reports.Export` exists but is granted to nobody
pub struct TestCore {
    pub store: Arc<MemoryStore>,
    pub delivery: Arc<MockChallengeDelivery>,
    pub audit: Arc<RecordingAuditSink>,
    pub clock: Arc<ManualClock>,
    pub core: IdentityCore,
    pub admin_id: Uuid,
    pub alice_id: Uuid,
    pub admin_role: Uuid,
    pub viewer_role: Uuid,
}

impl TestCore {
    pub async fn new() -> Self {
        Self::build(settings()).await
    }

    pub async fn build(settings: CoreSettings) -> Self {
        Self::build_with(settings, Arc::new(MemoryStore::new()), StoreOverrides::default()).await
    }

    /// Seeds `store`, then routes the overridden collaborators through
    /// the given wrappers instead of the store itself.
    pub async fn build_with(
        settings: CoreSettings,
        store: Arc<MemoryStore>,
        overrides: StoreOverrides,
    ) -> Self {
        init_tracing();

        let delivery = Arc::new(MockChallengeDelivery::new());
        let audit = Arc::new(RecordingAuditSink::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
        ));

        let admin_id = store.add_principal(Principal::new(
            "admin",
            "admin@example.com",
            hash_password(ADMIN_PASSWORD).unwrap(),
        ));
        let alice_id = store.add_principal(
            Principal::new(
                "alice",
                "alice@example.com",
                hash_password(ALICE_PASSWORD).unwrap(),
            )
            .with_two_factor(),
        );

        let admin_role = store.add_role(Role::new("Administrator", "Full access"));
        let viewer_role = store.add_role(Role::new("Viewer", "Read only"));
        store.add_permission(Permission::new("Users.Delete", "Users"));
        store.add_permission(Permission::new("Users.View", "Users"));
        store.add_permission(Permission::new("Reports.Export", "Reports"));
        store.assign_role(admin_id, admin_role);
        store.assign_role(alice_id, viewer_role);

        let core = IdentityCore::assemble(
            Collaborators {
                credentials: overrides
                    .credentials
                    .unwrap_or_else(|| store.clone() as Arc<dyn CredentialStore>),
                roles: store.clone(),
                refresh_tokens: overrides
                    .refresh_tokens
                    .unwrap_or_else(|| store.clone() as Arc<dyn RefreshTokenStore>),
                delivery: delivery.clone(),
                audit: audit.clone(),
                invalidation: Arc::new(LocalInvalidationBus),
                clock: clock.clone(),
            },
            &settings,
            policies(),
        )
        .expect("core assembles");

        for (role, permission) in [
            (admin_role, "Users.Delete"),
            (admin_role, "Users.View"),
            (viewer_role, "Users.View"),
        ] {
            core.cache
                .mutate(role, permission, PermissionOp::Grant)
                .await
                .expect("seed grant");
        }

        Self {
            store,
            delivery,
            audit,
            clock,
            core,
            admin_id,
            alice_id,
            admin_role,
            viewer_role,
        }
    }
}
