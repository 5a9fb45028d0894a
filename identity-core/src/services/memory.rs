//! In-process record store used by tests and embedded deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::store::{
    AuditStore, CredentialStore, RefreshTokenStore, RoleStore, StoreError, StoreResult,
};
use crate::models::{AuditEvent, Permission, Principal, RefreshTokenRecord, Role, TwoFactorChallenge};

#[derive(Default)]
struct MemoryState {
    principals: HashMap<Uuid, Principal>,
    roles: HashMap<Uuid, Role>,
    permissions: HashMap<Uuid, Permission>,
    grants: HashMap<(Uuid, Uuid), DateTime<Utc>>,
    memberships: HashMap<Uuid, HashSet<Uuid>>,
    refresh_tokens: HashMap<String, RefreshTokenRecord>,
    audit_events: Vec<AuditEvent>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every trait call fails with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(anyhow::anyhow!(
                "memory store marked unavailable"
            )));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable(anyhow::anyhow!("memory store lock poisoned")))
    }

    fn seed(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_principal(&self, principal: Principal) -> Uuid {
        let id = principal.id;
        self.seed().principals.insert(id, principal);
        id
    }

    pub fn add_role(&self, role: Role) -> Uuid {
        let id = role.id;
        self.seed().roles.insert(id, role);
        id
    }

    pub fn add_permission(&self, permission: Permission) -> Uuid {
        let id = permission.id;
        self.seed().permissions.insert(id, permission);
        id
    }

    pub fn assign_role(&self, principal_id: Uuid, role_id: Uuid) {
        self.seed()
            .memberships
            .entry(principal_id)
            .or_default()
            .insert(role_id);
    }

    pub fn set_permission_active(&self, permission_id: Uuid, active: bool) {
        if let Some(permission) = self.seed().permissions.get_mut(&permission_id) {
            permission.active = active;
        }
    }

    pub fn soft_delete_principal(&self, principal_id: Uuid) {
        if let Some(principal) = self.seed().principals.get_mut(&principal_id) {
            principal.deleted = true;
        }
    }

    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.seed().audit_events.clone()
    }

    /// Raw lookup that ignores the soft-delete flag.
    pub fn principal(&self, principal_id: Uuid) -> Option<Principal> {
        self.seed().principals.get(&principal_id).cloned()
    }
}

fn live_principal(state: &MemoryState, principal_id: Uuid) -> StoreResult<&Principal> {
    state
        .principals
        .get(&principal_id)
        .filter(|p| !p.deleted)
        .ok_or(StoreError::NotFound)
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn find_by_username(&self, username: &str) -> StoreResult<Principal> {
        self.lock()?
            .principals
            .values()
            .find(|p| !p.deleted && p.username == username)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn find_by_id(&self, principal_id: Uuid) -> StoreResult<Principal> {
        let state = self.lock()?;
        live_principal(&state, principal_id).cloned()
    }

    async fn get_roles(&self, principal_id: Uuid) -> StoreResult<Vec<Role>> {
        let state = self.lock()?;
        live_principal(&state, principal_id)?;

        let mut roles: Vec<Role> = state
            .memberships
            .get(&principal_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.roles.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    async fn update_last_login(&self, principal_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.lock()?;
        let principal = state
            .principals
            .get_mut(&principal_id)
            .filter(|p| !p.deleted)
            .ok_or(StoreError::NotFound)?;
        principal.last_login_at = Some(at);
        Ok(())
    }

    async fn set_challenge(
        &self,
        principal_id: Uuid,
        challenge: &TwoFactorChallenge,
    ) -> StoreResult<()> {
        let mut state = self.lock()?;
        let principal = state
            .principals
            .get_mut(&principal_id)
            .filter(|p| !p.deleted)
            .ok_or(StoreError::NotFound)?;
        principal.challenge = Some(challenge.clone());
        Ok(())
    }

    async fn clear_challenge(&self, principal_id: Uuid, code: &str) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let principal = state
            .principals
            .get_mut(&principal_id)
            .ok_or(StoreError::NotFound)?;
        match &principal.challenge {
            Some(challenge) if challenge.code == code => {
                principal.challenge = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl RoleStore for MemoryStore {
    async fn find_role(&self, role_id: Uuid) -> StoreResult<Role> {
        self.lock()?
            .roles
            .get(&role_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn find_role_by_name(&self, name: &str) -> StoreResult<Role> {
        self.lock()?
            .roles
            .values()
            .find(|r| r.name == name)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn find_permission_by_name(&self, name: &str) -> StoreResult<Permission> {
        self.lock()?
            .permissions
            .values()
            .find(|p| p.name == name)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn role_permissions(&self, role_id: Uuid) -> StoreResult<Vec<String>> {
        let state = self.lock()?;
        if !state.roles.contains_key(&role_id) {
            return Err(StoreError::NotFound);
        }

        let mut names: Vec<String> = state
            .grants
            .keys()
            .filter(|(r, _)| *r == role_id)
            .filter_map(|(_, p)| state.permissions.get(p))
            .filter(|p| p.active)
            .map(|p| p.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn grant_permission(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
        granted_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.lock()?;
        if !state.roles.contains_key(&role_id) || !state.permissions.contains_key(&permission_id)
        {
            return Err(StoreError::NotFound);
        }

        if state.grants.contains_key(&(role_id, permission_id)) {
            return Ok(false);
        }
        state.grants.insert((role_id, permission_id), granted_at);
        Ok(true)
    }

    async fn revoke_permission(&self, role_id: Uuid, permission_id: Uuid) -> StoreResult<bool> {
        let mut state = self.lock()?;
        if !state.roles.contains_key(&role_id) {
            return Err(StoreError::NotFound);
        }
        Ok(state.grants.remove(&(role_id, permission_id)).is_some())
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryStore {
    async fn insert(&self, record: &RefreshTokenRecord) -> StoreResult<()> {
        let mut state = self.lock()?;
        if state.refresh_tokens.contains_key(&record.token_hash) {
            return Err(StoreError::Unavailable(anyhow::anyhow!(
                "duplicate refresh token"
            )));
        }
        state
            .refresh_tokens
            .insert(record.token_hash.clone(), record.clone());
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> StoreResult<Option<RefreshTokenRecord>> {
        Ok(self.lock()?.refresh_tokens.get(token_hash).cloned())
    }

    async fn claim(&self, token_hash: &str) -> StoreResult<bool> {
        let mut state = self.lock()?;
        match state.refresh_tokens.get_mut(token_hash) {
            Some(record) if !record.used && !record.invalidated => {
                record.used = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn invalidate(&self, token_hash: &str) -> StoreResult<bool> {
        let mut state = self.lock()?;
        match state.refresh_tokens.get_mut(token_hash) {
            Some(record) if !record.invalidated => {
                record.invalidated = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn invalidate_family(&self, principal_id: Uuid) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let mut count = 0;
        for record in state
            .refresh_tokens
            .values_mut()
            .filter(|r| r.principal_id == principal_id && !r.invalidated)
        {
            record.invalidated = true;
            count += 1;
        }
        Ok(count)
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let len = state.refresh_tokens.len();
        state.refresh_tokens.retain(|_, r| r.expires_at > before);
        Ok((len - state.refresh_tokens.len()) as u64)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn insert_audit_event(&self, event: &AuditEvent) -> StoreResult<()> {
        self.lock()?.audit_events.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn soft_deleted_principals_are_invisible() {
        let store = MemoryStore::new();
        let id = store.add_principal(Principal::new("bob", "bob@example.com", "h".into()));

        assert!(store.find_by_username("bob").await.is_ok());
        store.soft_delete_principal(id);

        assert!(matches!(
            store.find_by_username("bob").await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(store.find_by_id(id).await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn grants_are_unique_and_inactive_permissions_hidden() {
        let store = MemoryStore::new();
        let role = store.add_role(Role::new("Auditor", "read-only"));
        let perm = store.add_permission(Permission::new("Reports.View", "Reports"));

        assert!(store.grant_permission(role, perm, Utc::now()).await.unwrap());
        assert!(!store.grant_permission(role, perm, Utc::now()).await.unwrap());
        assert_eq!(store.role_permissions(role).await.unwrap(), vec!["Reports.View"]);

        store.set_permission_active(perm, false);
        assert!(store.role_permissions(role).await.unwrap().is_empty());

        assert!(store.revoke_permission(role, perm).await.unwrap());
        assert!(!store.revoke_permission(role, perm).await.unwrap());
    }

    #[tokio::test]
    async fn claim_succeeds_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let record = RefreshTokenRecord::new(
            "tok",
            Uuid::new_v4(),
            Uuid::new_v4(),
            now,
            now + Duration::days(1),
        );
        store.insert(&record).await.unwrap();

        assert!(store.claim(&record.token_hash).await.unwrap());
        assert!(!store.claim(&record.token_hash).await.unwrap());
        assert!(!store.claim("unknown").await.unwrap());
    }

    #[tokio::test]
    async fn unavailable_switch_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        assert!(matches!(
            store.find_by_username("anyone").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            store.role_permissions(Uuid::new_v4()).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn clear_challenge_only_matches_current_code() {
        let store = MemoryStore::new();
        let id = store.add_principal(Principal::new("bob", "bob@example.com", "h".into()));
        let now = Utc::now();
        let challenge = TwoFactorChallenge {
            code: "123456".to_string(),
            generated_at: now,
            expires_at: now + Duration::minutes(5),
        };
        store.set_challenge(id, &challenge).await.unwrap();

        assert!(!store.clear_challenge(id, "654321").await.unwrap());
        assert!(store.clear_challenge(id, "123456").await.unwrap());
        assert!(!store.clear_challenge(id, "123456").await.unwrap());
        assert!(store.principal(id).unwrap().challenge.is_none());
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let principal = Uuid::new_v4();
        let old = RefreshTokenRecord::new("old", Uuid::new_v4(), principal, now, now);
        let fresh =
            RefreshTokenRecord::new("new", Uuid::new_v4(), principal, now, now + Duration::days(1));
        store.insert(&old).await.unwrap();
        store.insert(&fresh).await.unwrap();

        assert_eq!(store.purge_expired(now).await.unwrap(), 1);
        assert!(store.find_by_hash(&fresh.token_hash).await.unwrap().is_some());
    }
}
