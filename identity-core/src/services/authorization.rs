//! Fail-closed permission checks at the request boundary.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use super::error::ServiceError;
use super::jwt::AccessClaims;
use super::metrics;
use super::permission_cache::PermissionCache;
use super::store::{CredentialStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Declares the permission an operation requires.
///
/// ```
/// use identity_core::services::ProtectedOperation;
///
/// struct DeleteUser;
///
/// impl ProtectedOperation for DeleteUser {
///     const NAME: &'static str = "DeleteUser";
///     const REQUIRED_PERMISSION: &'static str = "Users.Delete";
/// }
/// ```
pub trait ProtectedOperation {
    const NAME: &'static str;
    const REQUIRED_PERMISSION: &'static str;
}

/// Static operation → permission table.
#[derive(Debug, Clone, Default)]
pub struct PolicyMap {
    entries: HashMap<String, String>,
}

impl PolicyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, operation: &str, permission: &str) -> Self {
        self.insert(operation, permission);
        self
    }

    pub fn with_operation<O: ProtectedOperation>(self) -> Self {
        self.with(O::NAME, O::REQUIRED_PERMISSION)
    }

    pub fn insert(&mut self, operation: &str, permission: &str) {
        self.entries
            .insert(operation.to_string(), permission.to_string());
    }

    pub fn required_permission(&self, operation: &str) -> Option<&str> {
        self.entries.get(operation).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for PolicyMap {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut map = PolicyMap::new();
        for (operation, permission) in iter {
            map.insert(operation, permission);
        }
        map
    }
}

/// Advisory mapping of names like `UsersManage` to `Users.Manage`.
///
/// Only consulted for operations missing from the [`PolicyMap`], and only
/// when enabled.
pub struct LegacyPolicyConvention;

impl LegacyPolicyConvention {
    const SUFFIXES: [&'static str; 2] = ["Manage", "View"];

    pub fn candidate(operation: &str) -> Option<String> {
        Self::SUFFIXES.iter().find_map(|suffix| {
            operation
                .strip_suffix(suffix)
                .filter(|prefix| !prefix.is_empty() && !prefix.ends_with('.'))
                .map(|prefix| format!("{}.{}", prefix, suffix))
        })
    }
}

pub struct AuthorizationResolver {
    credentials: Arc<dyn CredentialStore>,
    cache: Arc<PermissionCache>,
    policies: PolicyMap,
    legacy_policy_names: bool,
}

impl AuthorizationResolver {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        cache: Arc<PermissionCache>,
        policies: PolicyMap,
        legacy_policy_names: bool,
    ) -> Self {
        Self {
            credentials,
            cache,
            policies,
            legacy_policy_names,
        }
    }

    pub fn policies(&self) -> &PolicyMap {
        &self.policies
    }

    async fn permissions_for(&self, principal_id: Uuid) -> Result<HashSet<String>, StoreError> {
        let role_ids: Vec<Uuid> = self
            .credentials
            .get_roles(principal_id)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();

        self.cache.resolve(&role_ids).await
    }

    async fn check(&self, principal_id: Uuid, permission: &str) -> Decision {
        let decision = match self.permissions_for(principal_id).await {
            Ok(held) if held.contains(permission) => Decision::Allow,
            Ok(_) => Decision::Deny,
            Err(StoreError::NotFound) => {
                tracing::debug!(principal_id = %principal_id, "Authorization for unknown principal");
                Decision::Deny
            }
            Err(e) => {
                tracing::error!(
                    principal_id = %principal_id,
                    permission = %permission,
                    error = %e,
                    "Permission resolution failed; denying"
                );
                Decision::Deny
            }
        };

        metrics::record_authz(decision.is_allowed());
        tracing::debug!(
            principal_id = %principal_id,
            permission = %permission,
            decision = ?decision,
            "Authorization decision"
        );
        decision
    }

    /// Claims must come from an already-validated access token. `None`
    /// always denies.
    pub async fn authorize(&self, claims: Option<&AccessClaims>, permission: &str) -> Decision {
        let Some(claims) = claims else {
            metrics::record_authz(false);
            return Decision::Deny;
        };

        match claims.principal_id() {
            Ok(principal_id) => self.check(principal_id, permission).await,
            Err(_) => {
                tracing::warn!(sub = %claims.sub, "Access token subject is not a principal id");
                metrics::record_authz(false);
                Decision::Deny
            }
        }
    }

    pub async fn user_has_permission(&self, principal_id: Uuid, permission: &str) -> bool {
        self.check(principal_id, permission).await.is_allowed()
    }

    pub async fn user_has_permission_by_username(&self, username: &str, permission: &str) -> bool {
        match self.credentials.find_by_username(username).await {
            Ok(principal) => self.user_has_permission(principal.id, permission).await,
            Err(StoreError::NotFound) => false,
            Err(e) => {
                tracing::error!(error = %e, "Principal lookup failed; denying");
                false
            }
        }
    }

    /// Looks the operation up in the policy map. Unknown operations are denied.
    pub async fn authorize_operation(
        &self,
        claims: Option<&AccessClaims>,
        operation: &str,
    ) -> Decision {
        if let Some(permission) = self.policies.required_permission(operation) {
            return self.authorize(claims, permission).await;
        }

        if self.legacy_policy_names {
            if let Some(permission) = LegacyPolicyConvention::candidate(operation) {
                tracing::warn!(
                    operation = %operation,
                    permission = %permission,
                    "Operation authorized through legacy naming convention"
                );
                return self.authorize(claims, &permission).await;
            }
        }

        tracing::warn!(operation = %operation, "No policy for operation; denying");
        metrics::record_authz(false);
        Decision::Deny
    }

    pub async fn authorize_protected<O: ProtectedOperation>(
        &self,
        claims: Option<&AccessClaims>,
    ) -> Decision {
        self.authorize(claims, O::REQUIRED_PERMISSION).await
    }

    pub async fn require(
        &self,
        claims: Option<&AccessClaims>,
        permission: &str,
    ) -> Result<(), ServiceError> {
        match self.authorize(claims, permission).await {
            Decision::Allow => Ok(()),
            Decision::Deny => Err(ServiceError::PermissionDenied),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ViewReports;

    impl ProtectedOperation for ViewReports {
        const NAME: &'static str = "ViewReports";
        const REQUIRED_PERMISSION: &'static str = "Reports.View";
    }

    #[test]
    fn policy_map_lookups() {
        let map: PolicyMap = [("DeleteUser", "Users.Delete")].into_iter().collect();
        let map = map.with_operation::<ViewReports>();

        assert_eq!(map.required_permission("DeleteUser"), Some("Users.Delete"));
        assert_eq!(map.required_permission("ViewReports"), Some("Reports.View"));
        assert_eq!(map.required_permission("Unknown"), None);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn legacy_convention_candidates() {
        assert_eq!(
            LegacyPolicyConvention::candidate("UsersManage").as_deref(),
            Some("Users.Manage")
        );
        assert_eq!(
            LegacyPolicyConvention::candidate("ReportsView").as_deref(),
            Some("Reports.View")
        );
        assert_eq!(LegacyPolicyConvention::candidate("Manage"), None);
        assert_eq!(LegacyPolicyConvention::candidate("DeleteUser"), None);
    }
}
