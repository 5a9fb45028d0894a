mod common;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{settings, StoreOverrides, TestCore, ADMIN_PASSWORD};
use identity_core::{
    dtos::{LoginOutcome, LoginRequest},
    models::{AuditEventKind, RefreshTokenRecord},
    services::{MemoryStore, RefreshTokenStore, ServiceError, StoreResult},
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

async fn remembered_login(t: &TestCore) -> String {
    match t
        .core
        .orchestrator
        .login(LoginRequest::new("admin", ADMIN_PASSWORD, true))
        .await
        .unwrap()
    {
        LoginOutcome::SessionEstablished(bundle) => bundle.refresh_token.unwrap(),
        other => panic!("expected a session, got {:?}", other),
    }
}

#[tokio::test]
async fn test_refresh_rotates_both_tokens() {
    let t = TestCore::new().await;
    let original = remembered_login(&t).await;

    t.clock.advance(Duration::minutes(20));
    let rotated = t.core.orchestrator.refresh(&original).await.unwrap();

    let next = rotated.refresh_token.clone().unwrap();
    assert_ne!(next, original);
    assert_eq!(rotated.principal_id, t.admin_id);

    // Issued after the clock moved, so the old access token's expiry no longer matters.
    let claims = t.core.issuer.validate(&rotated.access_token).unwrap();
    assert_eq!(claims.jti, rotated.jti);
    assert_eq!(claims.roles, vec!["Administrator"]);

    assert!(t.core.orchestrator.refresh(&next).await.is_ok());
    assert_eq!(t.audit.count(AuditEventKind::TokenRefreshed), 2);
}

#[tokio::test]
async fn test_reuse_revokes_the_whole_family() {
    let t = TestCore::new().await;
    let original = remembered_login(&t).await;
    let second_session = remembered_login(&t).await;

    let rotated = t.core.orchestrator.refresh(&original).await.unwrap();
    let next = rotated.refresh_token.unwrap();

    let err = t.core.orchestrator.refresh(&original).await.unwrap_err();
    assert!(matches!(err, ServiceError::TokenReuseDetected));
    assert_eq!(t.audit.count(AuditEventKind::TokenReuseDetected), 1);

    // Every live token of the principal died with it.
    for token in [&next, &second_session] {
        let err = t.core.orchestrator.refresh(token).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRefreshToken));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_redemption_has_at_most_one_winner() {
    let t = TestCore::new().await;
    let token = remembered_login(&t).await;

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let core = t.core.clone();
            let token = token.clone();
            tokio::spawn(async move { core.orchestrator.refresh(&token).await })
        })
        .collect();

    let mut rotated = Vec::new();
    let mut reuse = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(bundle) => rotated.push(bundle.refresh_token.unwrap()),
            Err(ServiceError::TokenReuseDetected) => reuse += 1,
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }

    assert!(rotated.len() <= 1);
    assert_eq!(rotated.len() + reuse, 2);

    // Whoever won, the family was revoked, including the winner's replacement.
    for next in &rotated {
        let err = t.core.orchestrator.refresh(next).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRefreshToken));
    }
}

/// Parks the first armed `insert` until released, so a second redemption
/// can run between the winner's claim and its replacement write.
struct ParkedInsertStore {
    inner: Arc<MemoryStore>,
    armed: AtomicBool,
    parked: Notify,
    release: Notify,
}

#[async_trait]
impl RefreshTokenStore for ParkedInsertStore {
    async fn insert(&self, record: &RefreshTokenRecord) -> StoreResult<()> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.parked.notify_one();
            self.release.notified().await;
        }
        self.inner.insert(record).await
    }

    async fn find_by_hash(&self, token_hash: &str) -> StoreResult<Option<RefreshTokenRecord>> {
        self.inner.find_by_hash(token_hash).await
    }

    async fn claim(&self, token_hash: &str) -> StoreResult<bool> {
        self.inner.claim(token_hash).await
    }

    async fn invalidate(&self, token_hash: &str) -> StoreResult<bool> {
        self.inner.invalidate(token_hash).await
    }

    async fn invalidate_family(&self, principal_id: Uuid) -> StoreResult<u64> {
        self.inner.invalidate_family(principal_id).await
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        self.inner.purge_expired(before).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reuse_during_rotation_withdraws_the_replacement() {
    let store = Arc::new(MemoryStore::new());
    let parked = Arc::new(ParkedInsertStore {
        inner: store.clone(),
        armed: AtomicBool::new(false),
        parked: Notify::new(),
        release: Notify::new(),
    });
    let t = TestCore::build_with(
        settings(),
        store,
        StoreOverrides {
            refresh_tokens: Some(parked.clone()),
            ..Default::default()
        },
    )
    .await;
    let token = remembered_login(&t).await;

    parked.armed.store(true, Ordering::SeqCst);
    let winner = {
        let core = t.core.clone();
        let token = token.clone();
        tokio::spawn(async move { core.orchestrator.refresh(&token).await })
    };

    // The winner has claimed the token and is writing its replacement.
    parked.parked.notified().await;
    let err = t.core.orchestrator.refresh(&token).await.unwrap_err();
    assert!(matches!(err, ServiceError::TokenReuseDetected));

    parked.release.notify_one();
    let err = winner.await.unwrap().unwrap_err();
    assert!(matches!(err, ServiceError::TokenReuseDetected));
    assert_eq!(t.audit.count(AuditEventKind::TokenRefreshed), 0);

    // Nothing survives the revocation.
    let revoked = t
        .core
        .orchestrator
        .logout_everywhere(t.admin_id)
        .await
        .unwrap();
    assert_eq!(revoked, 0);
}

#[tokio::test]
async fn test_unknown_or_empty_token_is_invalid() {
    let t = TestCore::new().await;

    for token in ["", "definitely-not-issued"] {
        let err = t.core.orchestrator.refresh(token).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRefreshToken));
    }
    assert_eq!(t.audit.count(AuditEventKind::TokenReuseDetected), 0);
}

#[tokio::test]
async fn test_refresh_token_dead_at_expiry_instant() {
    let t = TestCore::new().await;
    let token = remembered_login(&t).await;
    let late = remembered_login(&t).await;

    t.clock.advance(Duration::days(30) - Duration::seconds(1));
    assert!(t.core.orchestrator.refresh(&token).await.is_ok());

    t.clock.advance(Duration::seconds(1));
    let err = t.core.orchestrator.refresh(&late).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidRefreshToken));
}

#[tokio::test]
async fn test_logout_invalidates_token() {
    let t = TestCore::new().await;
    let token = remembered_login(&t).await;

    t.core.orchestrator.logout(&token).await.unwrap();
    assert_eq!(t.audit.count(AuditEventKind::Logout), 1);

    // Revoked, not reused: no family-wide revocation.
    let err = t.core.orchestrator.refresh(&token).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidRefreshToken));
    assert_eq!(t.audit.count(AuditEventKind::TokenReuseDetected), 0);

    let err = t.core.orchestrator.logout(&token).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidRefreshToken));
}

#[tokio::test]
async fn test_logout_everywhere_revokes_every_session() {
    let t = TestCore::new().await;
    let first = remembered_login(&t).await;
    let second = remembered_login(&t).await;

    let revoked = t
        .core
        .orchestrator
        .logout_everywhere(t.admin_id)
        .await
        .unwrap();
    assert_eq!(revoked, 2);

    for token in [&first, &second] {
        assert!(t.core.orchestrator.refresh(token).await.is_err());
    }
}

#[tokio::test]
async fn test_refresh_for_deleted_principal_fails() {
    let t = TestCore::new().await;
    let token = remembered_login(&t).await;
    t.store.soft_delete_principal(t.admin_id);

    let err = t.core.orchestrator.refresh(&token).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidRefreshToken));
}

#[tokio::test]
async fn test_purge_removes_only_expired_records() {
    let t = TestCore::new().await;
    remembered_login(&t).await;

    t.clock.advance(Duration::days(10));
    let fresh = remembered_login(&t).await;

    t.clock.advance(Duration::days(21));
    assert_eq!(t.core.ledger.purge_expired().await.unwrap(), 1);
    assert_eq!(t.core.ledger.purge_expired().await.unwrap(), 0);

    assert!(t.core.orchestrator.refresh(&fresh).await.is_ok());
}
