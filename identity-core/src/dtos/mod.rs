pub mod auth;

pub use auth::{LoginOutcome, LoginRequest, TokenBundle, VerifyTwoFactorRequest};
