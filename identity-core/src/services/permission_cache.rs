//! Role → permission-set cache with generation-checked reloads.
//!
//! Each role has one line. A line is only ever installed by a reload whose
//! observed generation is still current, so a reload racing an invalidation
//! cannot put revoked permissions back.

use dashmap::DashMap;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::audit::AuditSink;
use super::clock::Clock;
use super::error::ServiceError;
use super::invalidation::InvalidationBus;
use super::metrics;
use super::store::{RoleStore, StoreError, StoreResult};
use crate::models::{AuditEventKind, Permission, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOp {
    Grant,
    Revoke,
}

impl PermissionOp {
    fn as_str(&self) -> &'static str {
        match self {
            PermissionOp::Grant => "grant",
            PermissionOp::Revoke => "revoke",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Succeeded,
    /// Already in the requested state; nothing was written or invalidated.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionChange {
    pub role_id: Uuid,
    pub permission: String,
    pub op: PermissionOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkItemStatus {
    Succeeded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct BulkItemResult {
    pub change: PermissionChange,
    pub status: BulkItemStatus,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct BulkMutationReport {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub items: Vec<BulkItemResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub lines: usize,
    /// Roles with a slot, cached or not.
    pub tracked_roles: usize,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    permissions: Option<Arc<HashSet<String>>>,
}

pub struct PermissionCache {
    store: Arc<dyn RoleStore>,
    audit: Arc<dyn AuditSink>,
    bus: Arc<dyn InvalidationBus>,
    clock: Arc<dyn Clock>,
    slots: DashMap<Uuid, Slot>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PermissionCache {
    pub fn new(
        store: Arc<dyn RoleStore>,
        audit: Arc<dyn AuditSink>,
        bus: Arc<dyn InvalidationBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            audit,
            bus,
            clock,
            slots: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Union of the permission sets of `role_ids`.
    ///
    /// Any store failure is returned; callers must treat it as "absent".
    pub async fn resolve(&self, role_ids: &[Uuid]) -> StoreResult<HashSet<String>> {
        let mut permissions = HashSet::new();
        for role_id in role_ids {
            let line = self.line(*role_id).await?;
            permissions.extend(line.iter().cloned());
        }
        Ok(permissions)
    }

    async fn line(&self, role_id: Uuid) -> StoreResult<Arc<HashSet<String>>> {
        if let Some(cached) = self
            .slots
            .get(&role_id)
            .and_then(|slot| slot.permissions.clone())
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_lookup(true);
            return Ok(cached);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_lookup(false);

        // Shard guards must not live across the store call.
        let observed = self.slots.entry(role_id).or_default().generation;

        let names = match self.store.role_permissions(role_id).await {
            Ok(names) => names,
            Err(StoreError::NotFound) => {
                // Unknown roles leave no slot behind.
                self.slots.remove_if(&role_id, |_, slot| {
                    slot.generation == observed && slot.permissions.is_none()
                });
                return Err(StoreError::NotFound);
            }
            Err(e) => return Err(e),
        };
        let loaded: Arc<HashSet<String>> = Arc::new(names.into_iter().collect());

        if let Some(mut slot) = self.slots.get_mut(&role_id) {
            if slot.generation == observed {
                slot.permissions = Some(loaded.clone());
            } else {
                tracing::debug!(
                    role_id = %role_id,
                    observed,
                    current = slot.generation,
                    "Discarding permission reload superseded by invalidation"
                );
            }
        }

        Ok(loaded)
    }

    /// Drops the role's line. Later lookups reload from the store.
    pub fn invalidate(&self, role_id: Uuid) {
        self.clear_slot(role_id);
        metrics::record_invalidation("local");
    }

    /// A role without a slot has neither a cached line nor a reload in
    /// flight, so there is nothing to drop.
    fn clear_slot(&self, role_id: Uuid) {
        if let Some(mut slot) = self.slots.get_mut(&role_id) {
            slot.generation += 1;
            slot.permissions = None;
        }
    }

    pub fn invalidate_all(&self) {
        for mut slot in self.slots.iter_mut() {
            slot.generation += 1;
            slot.permissions = None;
        }
        tracing::info!("Permission cache cleared");
    }

    /// Invalidation announced by another instance; not re-published.
    pub fn apply_remote_invalidation(&self, role_id: Uuid) {
        self.clear_slot(role_id);

        metrics::record_invalidation("remote");
        tracing::debug!(role_id = %role_id, "Applied remote permission invalidation");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            lines: self
                .slots
                .iter()
                .filter(|slot| slot.permissions.is_some())
                .count(),
            tracked_roles: self.slots.len(),
        }
    }

    /// Grants or revokes a permission and invalidates the role's line before
    /// returning.
    pub async fn mutate(
        &self,
        role_id: Uuid,
        permission_name: &str,
        op: PermissionOp,
    ) -> Result<MutationStatus, ServiceError> {
        let role = self.store.find_role(role_id).await.map_err(|e| match e {
            StoreError::NotFound => ServiceError::NotFound(format!("Role {} not found", role_id)),
            other => other.into(),
        })?;

        let permission = self
            .store
            .find_permission_by_name(permission_name)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => {
                    ServiceError::NotFound(format!("Permission '{}' not found", permission_name))
                }
                other => other.into(),
            })?;

        self.apply(&role, &permission, op).await
    }

    pub async fn mutate_by_name(
        &self,
        role_name: &str,
        permission_name: &str,
        op: PermissionOp,
    ) -> Result<MutationStatus, ServiceError> {
        let role = self
            .store
            .find_role_by_name(role_name)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => {
                    ServiceError::NotFound(format!("Role '{}' not found", role_name))
                }
                other => other.into(),
            })?;

        self.mutate(role.id, permission_name, op).await
    }

    async fn apply(
        &self,
        role: &Role,
        permission: &Permission,
        op: PermissionOp,
    ) -> Result<MutationStatus, ServiceError> {
        if op == PermissionOp::Grant && !permission.active {
            return Err(ServiceError::ValidationError(format!(
                "Permission '{}' is inactive",
                permission.name
            )));
        }

        let written = match op {
            PermissionOp::Grant => {
                self.store
                    .grant_permission(role.id, permission.id, self.clock.now())
                    .await
            }
            PermissionOp::Revoke => self.store.revoke_permission(role.id, permission.id).await,
        };

        let changed = match written {
            Ok(changed) => changed,
            Err(e) => {
                // The write may have committed before the error surfaced.
                self.invalidate(role.id);
                return Err(e.into());
            }
        };

        if !changed {
            tracing::debug!(
                role_id = %role.id,
                permission = %permission.name,
                op = op.as_str(),
                "Permission already in requested state"
            );
            return Ok(MutationStatus::Skipped);
        }

        self.invalidate(role.id);
        if let Err(e) = self.bus.publish(role.id).await {
            tracing::warn!(
                role_id = %role.id,
                error = %e,
                "Failed to broadcast permission invalidation"
            );
        }

        let kind = match op {
            PermissionOp::Grant => AuditEventKind::PermissionGranted,
            PermissionOp::Revoke => AuditEventKind::PermissionRevoked,
        };
        self.audit.record(
            None,
            kind,
            &format!("{} {} on role {}", op.as_str(), permission.name, role.name),
            json!({
                "role_id": role.id,
                "role": role.name,
                "permission": permission.name,
            }),
        );

        tracing::info!(
            role_id = %role.id,
            permission = %permission.name,
            op = op.as_str(),
            "Role permissions changed"
        );
        Ok(MutationStatus::Succeeded)
    }

    /// Applies every change independently; one failure never stops the rest.
    pub async fn bulk_mutate(&self, changes: &[PermissionChange]) -> BulkMutationReport {
        let mut report = BulkMutationReport::default();

        for change in changes {
            let (status, message) = match self
                .mutate(change.role_id, &change.permission, change.op)
                .await
            {
                Ok(MutationStatus::Succeeded) => {
                    report.succeeded += 1;
                    (
                        BulkItemStatus::Succeeded,
                        format!("{} '{}' applied", change.op.as_str(), change.permission),
                    )
                }
                Ok(MutationStatus::Skipped) => {
                    report.skipped += 1;
                    (
                        BulkItemStatus::Skipped,
                        format!(
                            "{} '{}' skipped: already in requested state",
                            change.op.as_str(),
                            change.permission
                        ),
                    )
                }
                Err(ServiceError::Internal(e)) => {
                    tracing::error!(
                        role_id = %change.role_id,
                        permission = %change.permission,
                        error = ?e,
                        "Bulk permission change failed"
                    );
                    report.failed += 1;
                    (BulkItemStatus::Failed, "Store unavailable".to_string())
                }
                Err(e) => {
                    report.failed += 1;
                    (BulkItemStatus::Failed, e.to_string())
                }
            };

            report.items.push(BulkItemResult {
                change: change.clone(),
                status,
                message,
            });
        }

        tracing::info!(
            succeeded = report.succeeded,
            skipped = report.skipped,
            failed = report.failed,
            "Bulk permission change finished"
        );
        report
    }
}
