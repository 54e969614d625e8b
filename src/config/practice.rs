use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use rust_decimal::Decimal;
use secrecy::SecretString;

use crate::config::MAX_HOURS;
use crate::config::helpers::{optional_env, parse_bool_env, parse_env, parse_string_env};
use crate::error::ConfigError;
use crate::settings::Settings;

/// Where uploaded documents and profile photos live, and how big they may be.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub dir: PathBuf,
    pub max_document_bytes: usize,
    pub max_photo_bytes: usize,
}

/// Outbound email delivery through an HTTP mail API.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub enabled: bool,
    pub api_url: Option<url::Url>,
    pub api_key: Option<SecretString>,
    pub from: String,
}

/// Background task-reminder sweep.
#[derive(Debug, Clone)]
pub struct ReminderConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub lead_hours: u64,
}

/// Invoice status inference and defaults.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub due_soon_days: i64,
    pub default_tax_rate: Decimal,
}

/// Security audit log controls.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub hash_chain: bool,
}

fn validate_audit_path(raw: &str) -> Result<PathBuf, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: "AUDIT_PATH".to_string(),
            message: "audit log path must not be empty".to_string(),
        });
    }

    let raw_path = PathBuf::from(trimmed);
    if raw_path.is_absolute() {
        return Err(ConfigError::InvalidValue {
            key: "AUDIT_PATH".to_string(),
            message: "audit log path must be relative to the data directory".to_string(),
        });
    }

    let mut normalized = PathBuf::new();
    for component in raw_path.components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(ConfigError::InvalidValue {
                    key: "AUDIT_PATH".to_string(),
                    message: "audit log path must not contain '..' components".to_string(),
                });
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ConfigError::InvalidValue {
                    key: "AUDIT_PATH".to_string(),
                    message: "audit log path must be relative to the data directory".to_string(),
                });
            }
        }
    }

    if normalized.components().count() < 2 || !normalized.starts_with("logs") {
        return Err(ConfigError::InvalidValue {
            key: "AUDIT_PATH".to_string(),
            message: "audit log path must be under 'logs/' and include a filename".to_string(),
        });
    }

    Ok(normalized)
}

fn parse_tax_rate(raw: &str) -> Result<Decimal, ConfigError> {
    let rate = Decimal::from_str(raw.trim()).map_err(|e| ConfigError::InvalidValue {
        key: "BILLING_DEFAULT_TAX_RATE".to_string(),
        message: e.to_string(),
    })?;
    if rate < Decimal::ZERO || rate > Decimal::ONE_HUNDRED {
        return Err(ConfigError::InvalidValue {
            key: "BILLING_DEFAULT_TAX_RATE".to_string(),
            message: "tax rate must be between 0 and 100".to_string(),
        });
    }
    Ok(rate)
}

fn byte_limit(key: &str, value: u64) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "limit must be greater than 0".to_string(),
        });
    }
    usize::try_from(value).map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: "limit does not fit in memory on this platform".to_string(),
    })
}

impl UploadConfig {
    pub(crate) fn resolve(settings: &Settings, data_dir: &Path) -> Result<Self, ConfigError> {
        let dir = optional_env("UPLOAD_DIR")?
            .map(PathBuf::from)
            .or_else(|| settings.uploads.dir.clone())
            .unwrap_or_else(|| data_dir.join("uploads"));
        Ok(Self {
            dir,
            max_document_bytes: byte_limit(
                "UPLOAD_MAX_DOCUMENT_BYTES",
                parse_env(
                    "UPLOAD_MAX_DOCUMENT_BYTES",
                    settings.uploads.max_document_bytes,
                )?,
            )?,
            max_photo_bytes: byte_limit(
                "UPLOAD_MAX_PHOTO_BYTES",
                parse_env("UPLOAD_MAX_PHOTO_BYTES", settings.uploads.max_photo_bytes)?,
            )?,
        })
    }
}

impl EmailConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let enabled = parse_bool_env("EMAIL_ENABLED", settings.email.enabled)?;
        let api_url = optional_env("EMAIL_API_URL")?
            .or_else(|| settings.email.api_url.clone())
            .map(|raw| {
                url::Url::parse(raw.trim()).map_err(|e| ConfigError::InvalidValue {
                    key: "EMAIL_API_URL".to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()?;
        if enabled && api_url.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "EMAIL_API_URL".to_string(),
            });
        }
        let from = parse_string_env("EMAIL_FROM", settings.email.from.clone())?;
        if !crate::legal::normalize::is_valid_email(&from.trim().to_ascii_lowercase()) {
            return Err(ConfigError::InvalidValue {
                key: "EMAIL_FROM".to_string(),
                message: format!("'{}' is not a valid sender address", from),
            });
        }
        Ok(Self {
            enabled,
            api_url,
            api_key: optional_env("EMAIL_API_KEY")?
                .or_else(|| settings.email.api_key.clone())
                .map(SecretString::from),
            from: from.trim().to_string(),
        })
    }
}

impl ReminderConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let interval_secs =
            parse_env("REMINDER_INTERVAL_SECS", settings.reminders.interval_secs)?;
        if interval_secs < 10 {
            return Err(ConfigError::InvalidValue {
                key: "REMINDER_INTERVAL_SECS".to_string(),
                message: "interval must be at least 10 seconds".to_string(),
            });
        }
        let lead_hours = parse_env("REMINDER_LEAD_HOURS", settings.reminders.lead_hours)?;
        if lead_hours > MAX_HOURS {
            return Err(ConfigError::InvalidValue {
                key: "REMINDER_LEAD_HOURS".to_string(),
                message: format!("lead time must be at most {MAX_HOURS} hours"),
            });
        }
        Ok(Self {
            enabled: parse_bool_env("REMINDERS_ENABLED", settings.reminders.enabled)?,
            interval_secs,
            lead_hours: lead_hours.max(1),
        })
    }
}

impl BillingConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let due_soon_days: u64 =
            parse_env("BILLING_DUE_SOON_DAYS", settings.billing.due_soon_days)?;
        let due_soon_days = i64::try_from(due_soon_days.min(365)).unwrap_or(365);
        let raw_rate = parse_string_env(
            "BILLING_DEFAULT_TAX_RATE",
            settings.billing.default_tax_rate.clone(),
        )?;
        Ok(Self {
            due_soon_days,
            default_tax_rate: parse_tax_rate(&raw_rate)?,
        })
    }
}

impl AuditConfig {
    pub(crate) fn resolve(settings: &Settings, data_dir: &Path) -> Result<Self, ConfigError> {
        let raw = parse_string_env("AUDIT_PATH", settings.audit.path.clone())?;
        Ok(Self {
            enabled: parse_bool_env("AUDIT_ENABLED", settings.audit.enabled)?,
            path: data_dir.join(validate_audit_path(&raw)?),
            hash_chain: parse_bool_env("AUDIT_HASH_CHAIN", settings.audit.hash_chain)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use rust_decimal_macros::dec;

    use crate::error::ConfigError;

    #[test]
    fn validate_audit_path_accepts_normalized_logs_subpaths() {
        let path = super::validate_audit_path("./logs//security/./audit.jsonl/")
            .expect("path should be accepted");
        assert_eq!(path, PathBuf::from("logs/security/audit.jsonl"));
    }

    #[test]
    fn validate_audit_path_rejects_parent_dir_traversal() {
        let err = super::validate_audit_path("logs/../audit.jsonl").expect_err("must reject '..'");
        let ConfigError::InvalidValue { key, message } = err else {
            panic!("expected InvalidValue");
        };
        assert_eq!(key, "AUDIT_PATH");
        assert!(message.contains(".."), "unexpected message: {message}");
    }

    #[test]
    fn validate_audit_path_rejects_absolute_paths() {
        let absolute = if cfg!(windows) {
            r"C:\tmp\audit.jsonl"
        } else {
            "/tmp/audit.jsonl"
        };
        let err =
            super::validate_audit_path(absolute).expect_err("absolute paths must be rejected");
        let ConfigError::InvalidValue { message, .. } = err else {
            panic!("expected InvalidValue");
        };
        assert!(message.contains("relative"), "unexpected message: {message}");
    }

    #[test]
    fn validate_audit_path_rejects_paths_outside_logs() {
        let err = super::validate_audit_path("tmp/audit.jsonl").expect_err("must stay in logs/");
        let ConfigError::InvalidValue { message, .. } = err else {
            panic!("expected InvalidValue");
        };
        assert!(message.contains("under 'logs/'"), "unexpected message: {message}");
    }

    #[test]
    fn tax_rate_must_be_a_percentage() {
        assert_eq!(super::parse_tax_rate("7.5").expect("valid"), dec!(7.5));
        assert!(super::parse_tax_rate("-1").is_err());
        assert!(super::parse_tax_rate("101").is_err());
        assert!(super::parse_tax_rate("abc").is_err());
    }

    #[test]
    fn reminder_lead_time_is_bounded() {
        if std::env::var("REMINDER_LEAD_HOURS").is_ok() {
            return;
        }
        let mut settings = crate::settings::Settings::default();
        settings.reminders.lead_hours = 9_000_000_000_000_000;
        let err = super::ReminderConfig::resolve(&settings).expect_err("huge lead time");
        let ConfigError::InvalidValue { key, .. } = err else {
            panic!("expected InvalidValue");
        };
        assert_eq!(key, "REMINDER_LEAD_HOURS");

        settings.reminders.lead_hours = 0;
        let config = super::ReminderConfig::resolve(&settings).expect("clamped up");
        assert_eq!(config.lead_hours, 1);
    }

    #[test]
    fn byte_limit_rejects_zero() {
        assert!(super::byte_limit("UPLOAD_MAX_PHOTO_BYTES", 0).is_err());
        assert_eq!(super::byte_limit("UPLOAD_MAX_PHOTO_BYTES", 10).expect("ok"), 10);
    }
}
