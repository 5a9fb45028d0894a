pub mod audit_event;
pub mod permission;
pub mod principal;
pub mod refresh_token;
pub mod role;

pub use audit_event::{AuditEvent, AuditEventKind};
pub use permission::Permission;
pub use principal::{Principal, TwoFactorChallenge};
pub use refresh_token::{RefreshTokenRecord, RefreshTokenState};
pub use role::{Role, RolePermission};
