//! Security audit trail.
//!
//! Authentication, role changes and access denials are appended to a JSONL
//! file. Each line optionally carries the SHA-256 of the previous line so
//! tampering breaks the chain. Counters ride along on every line.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::AuditConfig;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SecurityCounters {
    pub failed_logins: u64,
    pub rate_limited: u64,
    pub permission_denied: u64,
}

/// Kinds of security-relevant events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    LoginSucceeded,
    LoginFailed,
    LoginRateLimited,
    PasswordChanged,
    RoleChanged,
    UserDeactivated,
    PermissionDenied,
    RateLimited,
}

impl AuditKind {
    fn counter(self) -> Option<fn(&mut SecurityCounters)> {
        match self {
            Self::LoginFailed => Some(|c| c.failed_logins += 1),
            Self::LoginRateLimited | Self::RateLimited => Some(|c| c.rate_limited += 1),
            Self::PermissionDenied => Some(|c| c.permission_denied += 1),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct AuditLine<'a> {
    ts: String,
    kind: AuditKind,
    details: &'a serde_json::Value,
    counters: SecurityCounters,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev_hash: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
}

struct ChainState {
    last_hash: Option<String>,
    counters: SecurityCounters,
}

struct Sink {
    path: PathBuf,
    hash_chain: bool,
    state: Mutex<ChainState>,
}

/// Append-only audit log. A disabled log still counts events in memory.
pub struct AuditLog {
    sink: Option<Sink>,
    counters: Mutex<SecurityCounters>,
}

impl AuditLog {
    pub fn from_config(config: &AuditConfig) -> Self {
        if config.enabled {
            Self::to_file(config.path.clone(), config.hash_chain)
        } else {
            Self::disabled()
        }
    }

    pub fn disabled() -> Self {
        Self {
            sink: None,
            counters: Mutex::new(SecurityCounters::default()),
        }
    }

    pub fn to_file(path: PathBuf, hash_chain: bool) -> Self {
        Self {
            sink: Some(Sink {
                path,
                hash_chain,
                state: Mutex::new(ChainState {
                    last_hash: None,
                    counters: SecurityCounters::default(),
                }),
            }),
            counters: Mutex::new(SecurityCounters::default()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn counters(&self) -> SecurityCounters {
        self.counters.lock().map(|c| *c).unwrap_or_default()
    }

    /// Record an event. Write failures are logged and swallowed.
    pub fn record(&self, kind: AuditKind, details: serde_json::Value) {
        let counters = match self.counters.lock() {
            Ok(mut counters) => {
                if let Some(bump) = kind.counter() {
                    bump(&mut counters);
                }
                *counters
            }
            Err(e) => {
                tracing::warn!("audit counter lock poisoned: {}", e);
                return;
            }
        };
        tracing::info!(target: "lexdesk::audit", kind = ?kind, %details, "security event");

        if let Some(sink) = &self.sink {
            sink.append(kind, &details, counters);
        }
    }
}

impl Sink {
    fn append(&self, kind: AuditKind, details: &serde_json::Value, counters: SecurityCounters) {
        // Hold the chain lock through the write so lines and hashes stay ordered.
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("audit chain lock poisoned: {}", e);
                return;
            }
        };
        state.counters = counters;

        let mut line = AuditLine {
            ts: Utc::now().to_rfc3339(),
            kind,
            details,
            counters: state.counters,
            prev_hash: state.last_hash.as_deref(),
            hash: None,
        };

        let mut next_hash = None;
        if self.hash_chain {
            match serde_json::to_vec(&line) {
                Ok(bytes) => {
                    let digest = format!("{:x}", Sha256::digest(&bytes));
                    line.hash = Some(digest.clone());
                    next_hash = Some(digest);
                }
                Err(e) => {
                    tracing::warn!("failed to serialize audit line for hashing: {}", e);
                    return;
                }
            }
        }

        let encoded = match serde_json::to_string(&line) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!("failed to serialize audit line: {}", e);
                return;
            }
        };

        let Some(mut file) = self.open() else {
            return;
        };
        if let Err(e) = writeln!(file, "{encoded}") {
            tracing::warn!("failed to append audit line: {}", e);
            return;
        }
        if next_hash.is_some() {
            state.last_hash = next_hash;
        }
    }

    /// Open for append, creating the file 0600. Existing files with broader
    /// permissions are refused.
    fn open(&self) -> Option<File> {
        if let Some(parent) = self.path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            tracing::warn!("failed to create audit directory {:?}: {}", parent, e);
            return None;
        }

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);

        let file = match options.open(&self.path) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("failed to open audit log {:?}: {}", self.path, e);
                return None;
            }
        };

        #[cfg(unix)]
        {
            let mode = match file.metadata() {
                Ok(meta) => meta.permissions().mode() & 0o777,
                Err(e) => {
                    tracing::warn!("failed to stat audit log {:?}: {}", self.path, e);
                    return None;
                }
            };
            if mode != 0o600 {
                tracing::warn!(
                    "refusing to write audit log {:?} with mode {:o} (expected 600)",
                    self.path,
                    mode
                );
                return None;
            }
        }

        Some(file)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::{Value, json};

    use super::{AuditKind, AuditLog};

    fn lines(path: &std::path::Path) -> Vec<Value> {
        fs::read_to_string(path)
            .expect("read audit log")
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect()
    }

    #[test]
    fn consecutive_lines_are_hash_linked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs/audit.jsonl");
        let log = AuditLog::to_file(path.clone(), true);

        log.record(AuditKind::LoginSucceeded, json!({"email": "a@firm.test"}));
        log.record(AuditKind::RoleChanged, json!({"from": "member", "to": "admin"}));

        let lines = lines(&path);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].get("prev_hash").is_none());
        let first_hash = lines[0]["hash"].as_str().expect("first hash");
        assert_eq!(lines[1]["prev_hash"].as_str(), Some(first_hash));
        assert_eq!(lines[1]["kind"], "role_changed");
    }

    #[test]
    fn counters_track_failures_even_when_disabled() {
        let log = AuditLog::disabled();
        log.record(AuditKind::LoginFailed, json!({}));
        log.record(AuditKind::LoginFailed, json!({}));
        log.record(AuditKind::RateLimited, json!({}));
        log.record(AuditKind::LoginSucceeded, json!({}));

        let counters = log.counters();
        assert_eq!(counters.failed_logins, 2);
        assert_eq!(counters.rate_limited, 1);
        assert_eq!(counters.permission_denied, 0);
        assert!(!log.enabled());
    }

    #[test]
    fn lines_carry_counter_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::to_file(path.clone(), false);

        log.record(AuditKind::PermissionDenied, json!({"route": "/api/users"}));

        let lines = lines(&path);
        assert_eq!(lines[0]["counters"]["permission_denied"], 1);
        assert!(lines[0].get("hash").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn refuses_existing_file_with_broad_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        fs::write(&path, "existing\n").expect("seed");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).expect("chmod");

        AuditLog::to_file(path.clone(), false).record(AuditKind::LoginFailed, json!({}));

        assert_eq!(fs::read_to_string(&path).expect("read"), "existing\n");
    }

    #[cfg(unix)]
    #[test]
    fn new_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        AuditLog::to_file(path.clone(), false).record(AuditKind::PasswordChanged, json!({}));

        let mode = fs::metadata(&path).expect("metadata").permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
