use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Atomic named capability. `name` is the authorization key.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Permission {
    #[sqlx(rename = "permission_id")]
    pub id: Uuid,
    #[sqlx(rename = "permission_name")]
    pub name: String,
    pub category: String,
    pub active: bool,
}

impl Permission {
    pub fn new(name: &str, category: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            category: category.to_string(),
            active: true,
        }
    }
}
