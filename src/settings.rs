//! File-backed settings.
//!
//! Settings are the lowest layer of configuration: a TOML file where every
//! field has a default. `Config::resolve` layers environment variables on top
//! and validates the result.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root for the embedded database, uploads and audit log.
    pub data_dir: Option<PathBuf>,
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub auth: AuthSettings,
    pub uploads: UploadSettings,
    pub email: EmailSettings,
    pub reminders: ReminderSettings,
    pub billing: BillingSettings,
    pub audit: AuditSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
            cors_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub backend: String,
    pub libsql_path: Option<PathBuf>,
    pub url: Option<String>,
    pub pool_size: usize,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            backend: "libsql".to_string(),
            libsql_path: None,
            url: None,
            pool_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub jwt_secret: Option<String>,
    pub token_ttl_hours: u64,
    pub login_max_attempts: u64,
    pub login_window_secs: u64,
    pub api_max_requests: u64,
    pub api_window_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            token_ttl_hours: 12,
            login_max_attempts: 10,
            login_window_secs: 300,
            api_max_requests: 600,
            api_window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    pub dir: Option<PathBuf>,
    pub max_document_bytes: u64,
    pub max_photo_bytes: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            dir: None,
            max_document_bytes: 25 * 1024 * 1024,
            max_photo_bytes: 5 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailSettings {
    pub enabled: bool,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub from: String,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: None,
            api_key: None,
            from: "no-reply@lexdesk.local".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReminderSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub lead_hours: u64,
}

impl Default for ReminderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 900,
            lead_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingSettings {
    pub due_soon_days: u64,
    pub default_tax_rate: String,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            due_soon_days: 7,
            default_tax_rate: "0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub enabled: bool,
    pub path: String,
    pub hash_chain: bool,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "logs/security_audit.jsonl".to_string(),
            hash_chain: true,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Settings file {:?} not found, using defaults", path);
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                });
            }
        };
        Self::from_toml(&raw).map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::Settings;

    #[test]
    fn empty_toml_yields_defaults() {
        let settings = Settings::from_toml("").expect("parse");
        assert_eq!(settings.server.port, 4000);
        assert_eq!(settings.database.backend, "libsql");
        assert_eq!(settings.auth.token_ttl_hours, 12);
        assert_eq!(settings.billing.due_soon_days, 7);
        assert!(!settings.email.enabled);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let settings = Settings::from_toml(
            "[server]\nport = 8080\n\n[reminders]\nlead_hours = 48\n",
        )
        .expect("parse");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.reminders.lead_hours, 48);
        assert_eq!(settings.reminders.interval_secs, 900);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings =
            Settings::load(Some(&dir.path().join("absent.toml"))).expect("defaults");
        assert_eq!(settings.server.port, 4000);
    }

    #[test]
    fn malformed_file_reports_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lexdesk.toml");
        std::fs::write(&path, "[server\nport = 1").expect("write");
        let err = Settings::load(Some(&path)).expect_err("must fail");
        assert!(matches!(err, crate::error::ConfigError::Parse { .. }));
    }
}
