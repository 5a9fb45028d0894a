mod common;

use common::{settings, TestCore};
use identity_core::{
    models::Permission,
    services::{AccessClaims, Decision, PermissionOp, ProtectedOperation, ServiceError},
};
use uuid::Uuid;

struct DeleteUser;

impl ProtectedOperation for DeleteUser {
    const NAME: &'static str = "DeleteUser";
    const REQUIRED_PERMISSION: &'static str = "Users.Delete";
}

fn claims_for(t: &TestCore, principal_id: Uuid, username: &str, role: &str) -> AccessClaims {
    let token = t
        .core
        .issuer
        .issue(
            principal_id,
            username,
            &format!("{}@example.com", username),
            &[role.to_string()],
        )
        .unwrap();
    t.core.issuer.validate(&token.value).unwrap()
}

#[tokio::test]
async fn test_decisions_follow_role_permissions() {
    let t = TestCore::new().await;
    let admin = claims_for(&t, t.admin_id, "admin", "Administrator");
    let alice = claims_for(&t, t.alice_id, "alice", "Viewer");
    let resolver = &t.core.resolver;

    assert_eq!(resolver.authorize(Some(&admin), "Users.Delete").await, Decision::Allow);
    assert_eq!(resolver.authorize(Some(&alice), "Users.Delete").await, Decision::Deny);
    assert_eq!(resolver.authorize(Some(&alice), "Users.View").await, Decision::Allow);
    assert_eq!(resolver.authorize(Some(&admin), "Reports.Export").await, Decision::Deny);
}

#[tokio::test]
async fn test_missing_claims_deny() {
    let t = TestCore::new().await;

    assert_eq!(t.core.resolver.authorize(None, "Users.View").await, Decision::Deny);
    let err = t.core.resolver.require(None, "Users.View").await.unwrap_err();
    assert!(matches!(err, ServiceError::PermissionDenied));
}

#[tokio::test]
async fn test_operations_resolve_through_policy_map() {
    let t = TestCore::new().await;
    let admin = claims_for(&t, t.admin_id, "admin", "Administrator");
    let alice = claims_for(&t, t.alice_id, "alice", "Viewer");
    let resolver = &t.core.resolver;

    assert!(resolver.authorize_operation(Some(&admin), "DeleteUser").await.is_allowed());
    assert!(!resolver.authorize_operation(Some(&alice), "DeleteUser").await.is_allowed());
    assert!(resolver.authorize_operation(Some(&alice), "ListUsers").await.is_allowed());
    assert!(resolver.authorize_protected::<DeleteUser>(Some(&admin)).await.is_allowed());

    // Unknown operations are denied even for administrators.
    assert_eq!(
        resolver.authorize_operation(Some(&admin), "DropDatabase").await,
        Decision::Deny
    );
}

#[tokio::test]
async fn test_legacy_names_apply_only_when_enabled() {
    let strict = TestCore::new().await;

    let mut lenient_settings = settings();
    lenient_settings.authz.legacy_policy_names = true;
    let lenient = TestCore::build(lenient_settings).await;

    for t in [&strict, &lenient] {
        t.store
            .add_permission(Permission::new("Users.Manage", "Users"));
        t.core
            .cache
            .mutate(t.admin_role, "Users.Manage", PermissionOp::Grant)
            .await
            .unwrap();
    }

    let strict_admin = claims_for(&strict, strict.admin_id, "admin", "Administrator");
    let lenient_admin = claims_for(&lenient, lenient.admin_id, "admin", "Administrator");

    assert_eq!(
        strict
            .core
            .resolver
            .authorize_operation(Some(&strict_admin), "UsersManage")
            .await,
        Decision::Deny
    );
    assert_eq!(
        lenient
            .core
            .resolver
            .authorize_operation(Some(&lenient_admin), "UsersManage")
            .await,
        Decision::Allow
    );
}

#[tokio::test]
async fn test_store_outage_fails_closed() {
    let t = TestCore::new().await;
    let admin = claims_for(&t, t.admin_id, "admin", "Administrator");

    t.store.set_unavailable(true);
    assert_eq!(
        t.core.resolver.authorize(Some(&admin), "Users.Delete").await,
        Decision::Deny
    );
    assert!(!t.core.resolver.user_has_permission_by_username("admin", "Users.Delete").await);

    t.store.set_unavailable(false);
    assert_eq!(
        t.core.resolver.authorize(Some(&admin), "Users.Delete").await,
        Decision::Allow
    );
}

#[tokio::test]
async fn test_unknown_or_deleted_principals_hold_nothing() {
    let t = TestCore::new().await;
    let resolver = &t.core.resolver;

    assert!(!resolver.user_has_permission(Uuid::new_v4(), "Users.View").await);
    assert!(!resolver.user_has_permission_by_username("mallory", "Users.View").await);
    assert!(resolver.user_has_permission_by_username("admin", "Users.View").await);

    let admin = claims_for(&t, t.admin_id, "admin", "Administrator");
    t.store.soft_delete_principal(t.admin_id);
    assert_eq!(resolver.authorize(Some(&admin), "Users.View").await, Decision::Deny);
}

#[tokio::test]
async fn test_forged_subject_is_denied() {
    let t = TestCore::new().await;
    let mut claims = claims_for(&t, t.admin_id, "admin", "Administrator");
    claims.sub = "not-a-uuid".to_string();

    assert_eq!(
        t.core.resolver.authorize(Some(&claims), "Users.View").await,
        Decision::Deny
    );
}
