//! Configuration management for the identity core
//!
//! Loads settings from:
//! 1. `.env` file (debug builds only)
//! 2. Environment variables, with defaults for everything but the
//!    connection URLs and signing secrets
//!
//! # Example
//!
//! ```no_run
//! use identity_service::config::Settings;
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     println!("JWT issuer: {}", settings.jwt.issuer);
//!     Ok(())
//! }
//! ```

use crate::security::password::{Argon2Settings, HashAlgorithm, DEFAULT_BCRYPT_COST};
use crate::security::totp::{DEFAULT_BACKUP_CODE_COUNT, DEFAULT_MFA_ISSUER};
use crate::services::audit::Backpressure;
use anyhow::{bail, ensure, Context, Result};
use crypto_core::jwt::{JwtConfig, DEFAULT_ISSUER, MIN_SECRET_LENGTH};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Upper bound for every configured TTL (one year)
pub const MAX_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Read `key`, falling back to `default` when unset
fn env_or<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse::<T>()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("Invalid {key}"))
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub jwt: JwtSettings,
    pub session: SessionSettings,
    pub password: PasswordSettings,
    pub mfa: MfaSettings,
    pub audit: AuditSettings,
    pub bootstrap: BootstrapSettings,
}

impl Settings {
    /// Load and validate settings from the environment
    pub fn load() -> Result<Self> {
        if cfg!(debug_assertions) && dotenvy::dotenv().is_ok() {
            info!("Loaded .env file for development");
        }

        let settings = Settings {
            database: DatabaseSettings::from_env()?,
            redis: RedisSettings::from_env()?,
            jwt: JwtSettings::from_env()?,
            session: SessionSettings::from_env()?,
            password: PasswordSettings::from_env()?,
            mfa: MfaSettings::from_env()?,
            audit: AuditSettings::from_env()?,
            bootstrap: BootstrapSettings::from_env(),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Cross-section checks
    ///
    /// A revocation marker must outlive every token it can revoke.
    pub fn validate(&self) -> Result<()> {
        self.jwt.validate()?;
        ensure!(
            self.session.session_ttl_secs > 0,
            "SESSION_TTL_SECS must be positive"
        );
        ensure!(
            self.session.session_ttl_secs <= MAX_TTL_SECS
                && self.session.blacklist_ttl_secs <= MAX_TTL_SECS,
            "SESSION_TTL_SECS and SESSION_BLACKLIST_TTL_SECS must not exceed {MAX_TTL_SECS}"
        );
        ensure!(
            self.session.blacklist_ttl_secs >= self.jwt.refresh_ttl_secs
                && self.session.blacklist_ttl_secs >= self.jwt.access_ttl_secs,
            "SESSION_BLACKLIST_TTL_SECS ({}) must be at least the longest token TTL ({})",
            self.session.blacklist_ttl_secs,
            self.jwt.refresh_ttl_secs.max(self.jwt.access_ttl_secs)
        );
        ensure!(
            self.mfa.backup_code_count > 0,
            "MFA_BACKUP_CODE_COUNT must be positive"
        );
        ensure!(self.audit.capacity > 0, "AUDIT_CHANNEL_CAPACITY must be positive");
        self.password.hash_algorithm()?;
        Ok(())
    }
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: u64,
}

impl DatabaseSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            max_connections: env_or("DATABASE_MAX_CONNECTIONS", "20")?,
            min_connections: env_or("DATABASE_MIN_CONNECTIONS", "2")?,
            acquire_timeout: env_or("DATABASE_ACQUIRE_TIMEOUT", "10")?,
        })
    }
}

/// Redis settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    pub url: String,
    /// Per-command deadline in milliseconds
    pub command_timeout_ms: u64,
}

impl RedisSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("REDIS_URL").context("REDIS_URL must be set")?,
            command_timeout_ms: env_or("REDIS_COMMAND_TIMEOUT_MS", "500")?,
        })
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Token signing settings
#[derive(Clone, Serialize, Deserialize)]
pub struct JwtSettings {
    #[serde(skip_serializing)]
    pub access_secret: String,
    #[serde(skip_serializing)]
    pub refresh_secret: String,
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
    pub issuer: String,
    pub leeway_secs: u64,
}

impl fmt::Debug for JwtSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtSettings")
            .field("access_secret", &"<redacted>")
            .field("refresh_secret", &"<redacted>")
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .field("issuer", &self.issuer)
            .field("leeway_secs", &self.leeway_secs)
            .finish()
    }
}

impl JwtSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            access_secret: env::var("JWT_ACCESS_SECRET")
                .context("JWT_ACCESS_SECRET must be set")?,
            refresh_secret: env::var("JWT_REFRESH_SECRET")
                .context("JWT_REFRESH_SECRET must be set")?,
            access_ttl_secs: env_or("JWT_ACCESS_TTL_SECS", "900")?,
            refresh_ttl_secs: env_or("JWT_REFRESH_TTL_SECS", "86400")?,
            issuer: env::var("JWT_ISSUER").unwrap_or_else(|_| DEFAULT_ISSUER.to_string()),
            leeway_secs: env_or("JWT_LEEWAY_SECS", "5")?,
        })
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.access_secret.len() >= MIN_SECRET_LENGTH,
            "JWT_ACCESS_SECRET must be at least {MIN_SECRET_LENGTH} bytes"
        );
        ensure!(
            self.refresh_secret.len() >= MIN_SECRET_LENGTH,
            "JWT_REFRESH_SECRET must be at least {MIN_SECRET_LENGTH} bytes"
        );
        ensure!(
            self.access_secret != self.refresh_secret,
            "JWT_ACCESS_SECRET and JWT_REFRESH_SECRET must differ"
        );
        ensure!(
            self.access_ttl_secs > 0 && self.refresh_ttl_secs > 0,
            "token TTLs must be positive"
        );
        ensure!(
            self.access_ttl_secs <= MAX_TTL_SECS && self.refresh_ttl_secs <= MAX_TTL_SECS,
            "token TTLs must not exceed {MAX_TTL_SECS}"
        );
        Ok(())
    }

    pub fn jwt_config(&self) -> JwtConfig {
        JwtConfig {
            access_secret: self.access_secret.clone(),
            refresh_secret: self.refresh_secret.clone(),
            access_ttl: chrono::Duration::seconds(self.access_ttl_secs as i64),
            refresh_ttl: chrono::Duration::seconds(self.refresh_ttl_secs as i64),
            issuer: self.issuer.clone(),
            leeway_secs: self.leeway_secs,
        }
    }
}

/// Session and revocation marker lifetimes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub session_ttl_secs: u64,
    pub blacklist_ttl_secs: u64,
}

impl SessionSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            session_ttl_secs: env_or("SESSION_TTL_SECS", "1800")?,
            blacklist_ttl_secs: env_or("SESSION_BLACKLIST_TTL_SECS", "86400")?,
        })
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn blacklist_ttl(&self) -> Duration {
        Duration::from_secs(self.blacklist_ttl_secs)
    }
}

/// Password hashing strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordSettings {
    /// `argon2id` or `bcrypt`
    pub algorithm: String,
    pub argon2: Argon2Settings,
    pub bcrypt_cost: u32,
}

impl PasswordSettings {
    fn from_env() -> Result<Self> {
        let defaults = Argon2Settings::default();
        Ok(Self {
            algorithm: env::var("PASSWORD_HASH_ALGORITHM")
                .unwrap_or_else(|_| "argon2id".to_string())
                .to_lowercase(),
            argon2: Argon2Settings {
                time_cost: env_or("ARGON2_TIME_COST", &defaults.time_cost.to_string())?,
                memory_kib: env_or("ARGON2_MEMORY_KIB", &defaults.memory_kib.to_string())?,
                parallelism: env_or("ARGON2_PARALLELISM", &defaults.parallelism.to_string())?,
                output_len: env_or("ARGON2_OUTPUT_LEN", &defaults.output_len.to_string())?,
                salt_len: env_or("ARGON2_SALT_LEN", &defaults.salt_len.to_string())?,
            },
            bcrypt_cost: env_or("BCRYPT_COST", &DEFAULT_BCRYPT_COST.to_string())?,
        })
    }

    pub fn hash_algorithm(&self) -> Result<HashAlgorithm> {
        match self.algorithm.as_str() {
            "argon2id" | "argon2" => Ok(HashAlgorithm::Argon2id(self.argon2)),
            "bcrypt" => Ok(HashAlgorithm::Bcrypt {
                cost: self.bcrypt_cost,
            }),
            other => bail!("Invalid PASSWORD_HASH_ALGORITHM '{other}'"),
        }
    }
}

/// Second factor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaSettings {
    /// Issuer shown in authenticator apps
    pub issuer: String,
    pub backup_code_count: usize,
}

impl MfaSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            issuer: env::var("MFA_ISSUER").unwrap_or_else(|_| DEFAULT_MFA_ISSUER.to_string()),
            backup_code_count: env_or(
                "MFA_BACKUP_CODE_COUNT",
                &DEFAULT_BACKUP_CODE_COUNT.to_string(),
            )?,
        })
    }
}

/// Authentication event channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSettings {
    pub capacity: usize,
    pub backpressure: Backpressure,
}

impl AuditSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            capacity: env_or("AUDIT_CHANNEL_CAPACITY", "1024")?,
            backpressure: env_or("AUDIT_BACKPRESSURE", "drop_oldest")?,
        })
    }
}

/// First-run administrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapSettings {
    pub admin_email: Option<String>,
    pub admin_name: String,
    pub admin_department: String,
}

impl BootstrapSettings {
    fn from_env() -> Self {
        Self {
            admin_email: env::var("BOOTSTRAP_ADMIN_EMAIL")
                .ok()
                .filter(|email| !email.trim().is_empty()),
            admin_name: env::var("BOOTSTRAP_ADMIN_NAME")
                .unwrap_or_else(|_| "System Administrator".to_string()),
            admin_department: env::var("BOOTSTRAP_ADMIN_DEPARTMENT")
                .unwrap_or_else(|_| "security".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ACCESS: &str = "access-secret-for-config-tests-000001";
    const REFRESH: &str = "refresh-secret-for-config-tests-00002";

    fn set_required() {
        env::set_var("DATABASE_URL", "postgres://localhost/identity_test");
        env::set_var("REDIS_URL", "redis://localhost:6379");
        env::set_var("JWT_ACCESS_SECRET", ACCESS);
        env::set_var("JWT_REFRESH_SECRET", REFRESH);
    }

    fn clear(keys: &[&str]) {
        for key in keys {
            env::remove_var(key);
        }
    }

    const ALL_KEYS: &[&str] = &[
        "DATABASE_URL",
        "REDIS_URL",
        "JWT_ACCESS_SECRET",
        "JWT_REFRESH_SECRET",
        "JWT_REFRESH_TTL_SECS",
        "SESSION_TTL_SECS",
        "SESSION_BLACKLIST_TTL_SECS",
        "PASSWORD_HASH_ALGORITHM",
        "BCRYPT_COST",
        "AUDIT_BACKPRESSURE",
        "BOOTSTRAP_ADMIN_EMAIL",
        "REDIS_COMMAND_TIMEOUT_MS",
    ];

    #[test]
    #[serial]
    fn test_load_with_defaults() {
        set_required();

        let settings = Settings::load().unwrap();
        assert_eq!(settings.database.max_connections, 20);
        assert_eq!(settings.redis.command_timeout(), Duration::from_millis(500));
        assert_eq!(settings.jwt.access_ttl_secs, 900);
        assert_eq!(settings.session.session_ttl(), Duration::from_secs(1800));
        assert_eq!(settings.audit.backpressure, Backpressure::DropOldest);
        assert!(matches!(
            settings.password.hash_algorithm().unwrap(),
            HashAlgorithm::Argon2id(_)
        ));
        assert!(settings.bootstrap.admin_email.is_none());

        clear(ALL_KEYS);
    }

    #[test]
    #[serial]
    fn test_blacklist_must_outlive_refresh_tokens() {
        set_required();
        env::set_var("JWT_REFRESH_TTL_SECS", "7200");
        env::set_var("SESSION_BLACKLIST_TTL_SECS", "3600");

        let err = Settings::load().unwrap_err();
        assert!(err.to_string().contains("SESSION_BLACKLIST_TTL_SECS"));

        clear(ALL_KEYS);
    }

    #[test]
    #[serial]
    fn test_ttls_are_bounded() {
        set_required();
        env::set_var("SESSION_TTL_SECS", u64::MAX.to_string());
        let err = Settings::load().unwrap_err();
        assert!(err.to_string().contains("SESSION_TTL_SECS"));

        env::remove_var("SESSION_TTL_SECS");
        env::set_var("JWT_REFRESH_TTL_SECS", (MAX_TTL_SECS + 1).to_string());
        env::set_var("SESSION_BLACKLIST_TTL_SECS", (MAX_TTL_SECS + 1).to_string());
        assert!(Settings::load().is_err());

        clear(ALL_KEYS);
    }

    #[test]
    #[serial]
    fn test_identical_secrets_rejected() {
        set_required();
        env::set_var("JWT_REFRESH_SECRET", ACCESS);

        assert!(Settings::load().is_err());

        clear(ALL_KEYS);
    }

    #[test]
    #[serial]
    fn test_bcrypt_strategy_and_bootstrap_email() {
        set_required();
        env::set_var("PASSWORD_HASH_ALGORITHM", "BCRYPT");
        env::set_var("BCRYPT_COST", "10");
        env::set_var("AUDIT_BACKPRESSURE", "block");
        env::set_var("BOOTSTRAP_ADMIN_EMAIL", "root@example.com");

        let settings = Settings::load().unwrap();
        assert_eq!(
            settings.password.hash_algorithm().unwrap(),
            HashAlgorithm::Bcrypt { cost: 10 }
        );
        assert_eq!(settings.audit.backpressure, Backpressure::Block);
        assert_eq!(
            settings.bootstrap.admin_email.as_deref(),
            Some("root@example.com")
        );

        clear(ALL_KEYS);
    }

    #[test]
    #[serial]
    fn test_invalid_number_reports_key() {
        set_required();
        env::set_var("REDIS_COMMAND_TIMEOUT_MS", "soon");

        let err = Settings::load().unwrap_err();
        assert!(format!("{err:#}").contains("REDIS_COMMAND_TIMEOUT_MS"));

        clear(ALL_KEYS);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let jwt = JwtSettings {
            access_secret: ACCESS.to_string(),
            refresh_secret: REFRESH.to_string(),
            access_ttl_secs: 900,
            refresh_ttl_secs: 86400,
            issuer: DEFAULT_ISSUER.to_string(),
            leeway_secs: 5,
        };
        let rendered = format!("{jwt:?}");
        assert!(!rendered.contains(ACCESS));
        assert!(jwt.validate().is_ok());
    }
}
