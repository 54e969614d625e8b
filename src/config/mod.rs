//! Resolved runtime configuration.
//!
//! `Settings` (TOML, defaults everywhere) is the base layer; environment
//! variables override individual fields. Every section validates itself in
//! `resolve` so the server never starts with a half-usable config.

pub(crate) mod helpers;
mod practice;

use std::net::SocketAddr;
use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;
use crate::settings::Settings;
use helpers::{optional_env, parse_csv, parse_env, parse_string_env};

pub use practice::{AuditConfig, BillingConfig, EmailConfig, ReminderConfig, UploadConfig};

/// Minimum accepted length for the token signing secret.
const MIN_JWT_SECRET_LEN: usize = 32;

/// Upper bound for hour-valued settings (one year).
pub const MAX_HOURS: u64 = 24 * 365;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub uploads: UploadConfig,
    pub email: EmailConfig,
    pub reminders: ReminderConfig,
    pub billing: BillingConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
                key: "LEXDESK_HOST".to_string(),
                message: e.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    LibSql,
    Postgres,
}

impl DatabaseBackend {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "libsql" | "sqlite" => Ok(Self::LibSql),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(ConfigError::InvalidValue {
                key: "DATABASE_BACKEND".to_string(),
                message: format!("unsupported backend '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub libsql_path: PathBuf,
    pub url: Option<SecretString>,
    pub pool_size: usize,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: SecretString,
    pub token_ttl_hours: u64,
    pub login_max_attempts: u64,
    pub login_window_secs: u64,
    pub api_max_requests: u64,
    pub api_window_secs: u64,
}

fn resolve_data_dir(settings: &Settings) -> Result<PathBuf, ConfigError> {
    if let Some(raw) = optional_env("LEXDESK_DATA_DIR")? {
        return Ok(PathBuf::from(raw.trim()));
    }
    if let Some(dir) = settings.data_dir.clone() {
        return Ok(dir);
    }
    Ok(dirs::data_local_dir()
        .map(|dir| dir.join("lexdesk"))
        .unwrap_or_else(|| PathBuf::from("data")))
}

impl ServerConfig {
    fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let cors_origins = match optional_env("LEXDESK_CORS_ORIGINS")? {
            Some(raw) => parse_csv(&raw),
            None => settings.server.cors_origins.clone(),
        };
        for origin in &cors_origins {
            url::Url::parse(origin).map_err(|e| ConfigError::InvalidValue {
                key: "LEXDESK_CORS_ORIGINS".to_string(),
                message: format!("'{}' is not a valid origin: {}", origin, e),
            })?;
        }
        Ok(Self {
            host: parse_string_env("LEXDESK_HOST", settings.server.host.clone())?,
            port: parse_env("LEXDESK_PORT", settings.server.port)?,
            cors_origins,
        })
    }
}

impl DatabaseConfig {
    fn resolve(settings: &Settings, data_dir: &std::path::Path) -> Result<Self, ConfigError> {
        let backend_raw = parse_string_env("DATABASE_BACKEND", settings.database.backend.clone())?;
        let backend = DatabaseBackend::from_str(&backend_raw)?;
        let url = optional_env("DATABASE_URL")?
            .or_else(|| settings.database.url.clone())
            .map(SecretString::from);
        if backend == DatabaseBackend::Postgres && url.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "DATABASE_URL".to_string(),
            });
        }
        let libsql_path = optional_env("LIBSQL_PATH")?
            .map(PathBuf::from)
            .or_else(|| settings.database.libsql_path.clone())
            .unwrap_or_else(|| data_dir.join("lexdesk.db"));
        let pool_size = parse_env("DATABASE_POOL_SIZE", settings.database.pool_size)?;
        if pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DATABASE_POOL_SIZE".to_string(),
                message: "pool size must be at least 1".to_string(),
            });
        }
        Ok(Self {
            backend,
            libsql_path,
            url,
            pool_size,
        })
    }
}

impl AuthConfig {
    fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let secret = optional_env("JWT_SECRET")?
            .or_else(|| settings.auth.jwt_secret.clone())
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "JWT_SECRET".to_string(),
            })?;
        let jwt_secret = SecretString::from(secret);
        if jwt_secret.expose_secret().len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::InvalidValue {
                key: "JWT_SECRET".to_string(),
                message: format!("secret must be at least {MIN_JWT_SECRET_LEN} bytes"),
            });
        }

        let token_ttl_hours = parse_env("TOKEN_TTL_HOURS", settings.auth.token_ttl_hours)?;
        if !(1..=MAX_HOURS).contains(&token_ttl_hours) {
            return Err(ConfigError::InvalidValue {
                key: "TOKEN_TTL_HOURS".to_string(),
                message: format!("token lifetime must be between 1 and {MAX_HOURS} hours"),
            });
        }

        Ok(Self {
            jwt_secret,
            token_ttl_hours,
            login_max_attempts: parse_env(
                "LOGIN_MAX_ATTEMPTS",
                settings.auth.login_max_attempts,
            )?
            .max(1),
            login_window_secs: parse_env("LOGIN_WINDOW_SECS", settings.auth.login_window_secs)?
                .max(1),
            api_max_requests: parse_env("API_MAX_REQUESTS", settings.auth.api_max_requests)?
                .max(1),
            api_window_secs: parse_env("API_WINDOW_SECS", settings.auth.api_window_secs)?.max(1),
        })
    }
}

impl Config {
    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let data_dir = resolve_data_dir(settings)?;
        Ok(Self {
            server: ServerConfig::resolve(settings)?,
            database: DatabaseConfig::resolve(settings, &data_dir)?,
            auth: AuthConfig::resolve(settings)?,
            uploads: UploadConfig::resolve(settings, &data_dir)?,
            email: EmailConfig::resolve(settings)?,
            reminders: ReminderConfig::resolve(settings)?,
            billing: BillingConfig::resolve(settings)?,
            audit: AuditConfig::resolve(settings, &data_dir)?,
            data_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{Config, DatabaseBackend};
    use crate::error::ConfigError;
    use crate::settings::Settings;

    fn settings_with_secret() -> Settings {
        let mut settings = Settings::default();
        settings.auth.jwt_secret = Some("0123456789abcdef0123456789abcdef".to_string());
        settings.data_dir = Some(PathBuf::from("/var/lib/lexdesk-test"));
        settings
    }

    #[test]
    fn resolve_uses_settings_defaults() {
        let config = Config::resolve(&settings_with_secret()).expect("config");
        assert_eq!(config.database.backend, DatabaseBackend::LibSql);
        assert_eq!(config.auth.token_ttl_hours, 12);
        assert_eq!(config.billing.due_soon_days, 7);
        assert!(config.reminders.enabled);
    }

    #[test]
    fn resolve_places_database_under_data_dir() {
        let settings = settings_with_secret();
        let config = Config::resolve(&settings).expect("config");
        if std::env::var("LIBSQL_PATH").is_err() && std::env::var("LEXDESK_DATA_DIR").is_err() {
            assert_eq!(
                config.database.libsql_path,
                PathBuf::from("/var/lib/lexdesk-test/lexdesk.db")
            );
        }
    }

    #[test]
    fn resolve_rejects_token_lifetime_beyond_a_year() {
        if std::env::var("TOKEN_TTL_HOURS").is_ok() {
            return;
        }
        let mut settings = settings_with_secret();
        settings.auth.token_ttl_hours = 10_000_000_000_000;
        let err = Config::resolve(&settings).expect_err("huge ttl");
        let ConfigError::InvalidValue { key, .. } = err else {
            panic!("expected InvalidValue");
        };
        assert_eq!(key, "TOKEN_TTL_HOURS");

        settings.auth.token_ttl_hours = super::MAX_HOURS;
        assert!(Config::resolve(&settings).is_ok());
    }

    #[test]
    fn resolve_rejects_short_secret() {
        if std::env::var("JWT_SECRET").is_ok() {
            return;
        }
        let mut settings = Settings::default();
        settings.auth.jwt_secret = Some("short".to_string());
        let err = Config::resolve(&settings).expect_err("short secret");
        let ConfigError::InvalidValue { key, .. } = err else {
            panic!("expected InvalidValue");
        };
        assert_eq!(key, "JWT_SECRET");
    }

    #[test]
    fn resolve_requires_url_for_postgres() {
        if std::env::var("DATABASE_URL").is_ok() || std::env::var("DATABASE_BACKEND").is_ok() {
            return;
        }
        let mut settings = settings_with_secret();
        settings.database.backend = "postgres".to_string();
        let err = Config::resolve(&settings).expect_err("missing url");
        assert!(matches!(err, ConfigError::MissingRequired { ref key } if key == "DATABASE_URL"));
    }

    #[test]
    fn resolve_rejects_invalid_cors_origin() {
        if std::env::var("LEXDESK_CORS_ORIGINS").is_ok() {
            return;
        }
        let mut settings = settings_with_secret();
        settings.server.cors_origins = vec!["not a url".to_string()];
        assert!(Config::resolve(&settings).is_err());
    }
}
