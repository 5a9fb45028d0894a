//! Authorization and session services.
//!
//! Storage, delivery and broadcast sit behind traits so the same services
//! run against Postgres in production and in-memory doubles in tests.

pub mod audit;
mod auth;
mod authorization;
pub mod clock;
mod database;
pub mod delivery;
pub mod error;
pub mod invalidation;
mod jwt;
mod memory;
pub mod metrics;
mod permission_cache;
mod refresh_ledger;
pub mod store;
mod throttle;
pub mod two_factor;

pub use audit::{AuditSink, RecordingAuditSink, StoreAuditSink};
pub use auth::LoginOrchestrator;
pub use authorization::{
    AuthorizationResolver, Decision, LegacyPolicyConvention, PolicyMap, ProtectedOperation,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use database::Database;
pub use delivery::{ChallengeDelivery, EmailChallengeDelivery, MockChallengeDelivery};
pub use error::ServiceError;
pub use invalidation::{InvalidationBus, LocalInvalidationBus, RedisInvalidationBus};
pub use jwt::{AccessClaims, InvalidToken, SignedToken, TokenIssuer};
pub use memory::MemoryStore;
pub use permission_cache::{
    BulkItemResult, BulkItemStatus, BulkMutationReport, CacheStats, MutationStatus,
    PermissionCache, PermissionChange, PermissionOp,
};
pub use refresh_ledger::{IssuedRefreshToken, LedgerError, Redemption, RefreshTokenLedger};
pub use store::{AuditStore, CredentialStore, RefreshTokenStore, RoleStore, StoreError, StoreResult};
pub use throttle::LoginThrottle;
