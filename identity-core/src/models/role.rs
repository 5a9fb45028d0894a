//! Role model - named bundles of permissions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Role entity. Names are unique.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Role {
    #[sqlx(rename = "role_id")]
    pub id: Uuid,
    #[sqlx(rename = "role_name")]
    pub name: String,
    pub description: String,
    #[sqlx(rename = "created_utc")]
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
}

impl Role {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
            created_by: None,
        }
    }
}

/// Grant of a permission to a role; at most one per pair.
#[derive(Debug, Clone, FromRow)]
pub struct RolePermission {
    pub role_id: Uuid,
    pub permission_id: Uuid,
    #[sqlx(rename = "granted_utc")]
    pub granted_at: DateTime<Utc>,
}
