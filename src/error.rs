//! Error types shared across the crate.

use std::path::PathBuf;

/// Persistence failures surfaced by every `Database` backend.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: String, id: String },

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("migration failed: {0}")]
    Migration(String),
}

impl DatabaseError {
    /// True when the error came from a unique or foreign-key constraint.
    pub fn is_constraint(&self) -> bool {
        matches!(self, Self::Constraint(_))
    }
}

#[cfg(feature = "libsql")]
impl From<libsql::Error> for DatabaseError {
    fn from(err: libsql::Error) -> Self {
        let message = err.to_string();
        if message.contains("UNIQUE constraint failed")
            || message.contains("FOREIGN KEY constraint failed")
        {
            Self::Constraint(message)
        } else {
            Self::Query(message)
        }
    }
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for DatabaseError {
    fn from(err: tokio_postgres::Error) -> Self {
        use tokio_postgres::error::SqlState;

        match err.code() {
            Some(code)
                if *code == SqlState::UNIQUE_VIOLATION
                    || *code == SqlState::FOREIGN_KEY_VIOLATION =>
            {
                Self::Constraint(err.to_string())
            }
            _ => Self::Query(err.to_string()),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}

/// Configuration loading and validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("failed to read config file {path:?}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("failed to parse config file {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Authentication and token failures.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("account is deactivated")]
    Inactive,

    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    Expired,

    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("password must be at least {min} characters")]
    WeakPassword { min: usize },
}

/// Outbound email delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("email template error: {0}")]
    Template(String),

    #[error("email transport error: {0}")]
    Transport(String),

    #[error("email API rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// File upload storage failures.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("uploaded file is empty")]
    Empty,

    #[error("uploaded file exceeds the {limit} byte limit")]
    TooLarge { limit: usize },

    #[error("unsupported content type '{0}'")]
    UnsupportedType(String),

    #[error("upload storage error: {0}")]
    Io(String),
}

/// HTTP server startup failures.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server failed to start: {reason}")]
    StartupFailed { reason: String },
}
