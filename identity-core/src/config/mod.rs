use secrecy::{ExposeSecret, SecretString};
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug)]
pub struct IdentityConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    pub smtp: SmtpConfig,
    pub core: CoreSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub channel: String,
}

#[derive(Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub user: String,
    pub password: SecretString,
    pub from: String,
}

/// Everything the in-process core needs, independent of where it is hosted.
#[derive(Debug)]
pub struct CoreSettings {
    pub jwt: JwtSettings,
    pub refresh: RefreshSettings,
    pub rate_limit: RateLimitSettings,
    pub authz: AuthzSettings,
}

#[derive(Debug)]
pub struct JwtSettings {
    pub secret: SecretString,
    pub issuer: String,
    pub audience: String,
    pub access_token_expiry_minutes: i64,
}

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub expiry_days: i64,
    pub purge_interval_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub login_attempts: u32,
    pub login_window_seconds: u64,
}

#[derive(Debug, Clone, Default)]
pub struct AuthzSettings {
    /// Enables the advisory `...Manage` / `...View` name mapping for
    /// operations missing from the policy map.
    pub legacy_policy_names: bool,
}

pub const MIN_JWT_SECRET_BYTES: usize = 32;

impl IdentityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let redis = match env::var("REDIS_URL") {
            Ok(url) if !url.trim().is_empty() => Some(RedisConfig {
                url,
                channel: get_env(
                    "REDIS_INVALIDATION_CHANNEL",
                    Some("identity:role-invalidations"),
                    is_prod,
                )?,
            }),
            _ => None,
        };

        let config = IdentityConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("identity-core"), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", Some("10"), is_prod)?,
            },
            redis,
            smtp: SmtpConfig {
                host: get_env("SMTP_HOST", Some("localhost"), is_prod)?,
                user: get_env("SMTP_USER", Some(""), is_prod)?,
                password: SecretString::new(get_env("SMTP_PASSWORD", Some(""), is_prod)?),
                from: get_env("SMTP_FROM", Some("no-reply@localhost"), is_prod)?,
            },
            core: CoreSettings {
                jwt: JwtSettings {
                    secret: SecretString::new(get_env("JWT_SECRET", None, is_prod)?),
                    issuer: get_env("JWT_ISSUER", Some("identity-core"), is_prod)?,
                    audience: get_env("JWT_AUDIENCE", Some("identity-clients"), is_prod)?,
                    access_token_expiry_minutes: parse_env(
                        "JWT_ACCESS_TOKEN_EXPIRY_MINUTES",
                        Some("15"),
                        is_prod,
                    )?,
                },
                refresh: RefreshSettings {
                    expiry_days: parse_env("REFRESH_TOKEN_EXPIRY_DAYS", Some("30"), is_prod)?,
                    purge_interval_seconds: parse_env(
                        "REFRESH_PURGE_INTERVAL_SECONDS",
                        Some("3600"),
                        is_prod,
                    )?,
                },
                rate_limit: RateLimitSettings {
                    login_attempts: parse_env("LOGIN_ATTEMPTS", Some("5"), is_prod)?,
                    login_window_seconds: parse_env("LOGIN_WINDOW_SECONDS", Some("900"), is_prod)?,
                },
                authz: AuthzSettings {
                    legacy_policy_names: parse_env(
                        "AUTHZ_LEGACY_POLICY_NAMES",
                        Some("false"),
                        is_prod,
                    )?,
                },
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.database.max_connections == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_MAX_CONNECTIONS must be greater than 0"
            )));
        }

        self.core.validate()
    }
}

impl CoreSettings {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.jwt.secret.expose_secret().len() < MIN_JWT_SECRET_BYTES {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_SECRET must be at least {} bytes",
                MIN_JWT_SECRET_BYTES
            )));
        }

        if !(5..=60).contains(&self.jwt.access_token_expiry_minutes) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_TOKEN_EXPIRY_MINUTES must be between 5 and 60"
            )));
        }

        if self.refresh.expiry_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "REFRESH_TOKEN_EXPIRY_DAYS must be positive"
            )));
        }

        if self.refresh.purge_interval_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "REFRESH_PURGE_INTERVAL_SECONDS must be greater than 0"
            )));
        }

        if self.rate_limit.login_attempts == 0 || self.rate_limit.login_window_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "LOGIN_ATTEMPTS and LOGIN_WINDOW_SECONDS must be greater than 0"
            )));
        }

        if self.authz.legacy_policy_names {
            tracing::warn!("Legacy policy-name mapping is enabled; prefer explicit policy entries");
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: Option<&str>, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = get_env(key, default, is_prod)?;
    raw.trim()
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("Invalid {}: {}", key, e)))
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
