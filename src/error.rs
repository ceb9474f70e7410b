//! Error types shared by the gateway, the worker and the stores.

use serde_json::{json, Value};
use thiserror::Error;

/// Failure raised by a persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique constraint rejected the write (for example a lead email that
    /// already belongs to another session).
    #[error("unique constraint violated: {constraint}")]
    Conflict { constraint: String },

    #[error("database error: {0}")]
    Database(sqlx::Error),

    /// Backend-agnostic failure, used by non-SQL stores.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            if db_err.is_unique_violation() {
                return StoreError::Conflict {
                    constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                };
            }
        }
        StoreError::Database(err)
    }
}

/// The primary error type used across the crate.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// LLM provider errors (transport failure, non-2xx status, empty content).
    #[error("provider error: {message}")]
    Provider {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("notification error: {0}")]
    Notify(String),

    #[error("invalid job payload: {0}")]
    JobPayload(#[from] serde_json::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

impl AppError {
    pub fn provider(message: impl Into<String>) -> Self {
        AppError::Provider {
            message: message.into(),
            source: None,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Store(err.into())
    }
}

/// A failure that is reported back on the connection that caused it.
///
/// `restart` asks the widget to offer a fresh session; `disconnect` makes the
/// gateway close the connection once the error frame is sent.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SocketError {
    pub message: String,
    pub data: Value,
    pub restart: bool,
    pub disconnect: bool,
}

impl SocketError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: json!({}),
            restart: false,
            disconnect: false,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_restart(mut self) -> Self {
        self.restart = true;
        self
    }
}

/// What a connection event handler can fail with.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Internal(#[from] AppError),
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        GatewayError::Internal(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_error_builders_set_flags() {
        let err = SocketError {
            disconnect: true,
            ..SocketError::new("boom").with_restart()
        };
        assert_eq!(err.to_string(), "boom");
        assert!(err.restart);
        assert!(err.disconnect);
        assert_eq!(err.data, json!({}));
    }

    #[test]
    fn store_error_wraps_into_app_error() {
        let err: AppError = StoreError::Conflict {
            constraint: "leads_email_key".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "unique constraint violated: leads_email_key"
        );
    }

    #[test]
    fn non_database_sqlx_errors_are_not_conflicts() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StoreError::Database(_)));
    }
}
