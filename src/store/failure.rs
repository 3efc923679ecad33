//! Store-level failure signal
//!
//! Backends report every failure as a [`StoreFailure`]. Nothing above the
//! store layer matches on it directly; [`crate::error::translate`] turns it
//! into a [`crate::error::CatalogError`].

use std::error::Error as StdError;

use strum::Display;
use thiserror::Error;

/// Classification of a store failure, independent of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum FailureCode {
    UniqueViolation,
    ForeignKeyViolation,
    RecordNotFound,
    /// Serialization conflicts, deadlocks, pool timeouts, dropped connections.
    Transient,
    Other,
}

/// A failure reported by a store backend.
#[derive(Debug, Error)]
#[error("store failure ({code}): {detail}")]
pub struct StoreFailure {
    pub code: FailureCode,
    /// Name of the violated constraint, when the backend reports one.
    pub constraint: Option<String>,
    pub detail: String,
    #[source]
    pub cause: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

pub type StoreResult<T> = std::result::Result<T, StoreFailure>;

impl StoreFailure {
    pub fn new(code: FailureCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            constraint: None,
            detail: detail.into(),
            cause: None,
        }
    }

    pub fn unique(constraint: &str, detail: impl Into<String>) -> Self {
        Self::new(FailureCode::UniqueViolation, detail).with_constraint(constraint)
    }

    pub fn foreign_key(constraint: &str, detail: impl Into<String>) -> Self {
        Self::new(FailureCode::ForeignKeyViolation, detail).with_constraint(constraint)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(FailureCode::RecordNotFound, detail)
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self::new(FailureCode::Transient, detail)
    }

    pub fn other(detail: impl Into<String>) -> Self {
        Self::new(FailureCode::Other, detail)
    }

    pub fn with_constraint(mut self, constraint: &str) -> Self {
        self.constraint = Some(constraint.to_string());
        self
    }

    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for StoreFailure {
    fn from(error: sqlx::Error) -> Self {
        let (code, constraint, detail) = match &error {
            sqlx::Error::RowNotFound => (FailureCode::RecordNotFound, None, error.to_string()),
            sqlx::Error::Database(db) => {
                let code = match db.code().as_deref() {
                    Some("23505") => FailureCode::UniqueViolation,
                    Some("23503") => FailureCode::ForeignKeyViolation,
                    Some("40001") | Some("40P01") => FailureCode::Transient,
                    _ => FailureCode::Other,
                };
                (
                    code,
                    db.constraint().map(str::to_string),
                    db.message().to_string(),
                )
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                (FailureCode::Transient, None, error.to_string())
            }
            _ => (FailureCode::Other, None, error.to_string()),
        };

        Self {
            code,
            constraint,
            detail,
            cause: Some(Box::new(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code_and_detail() {
        let failure = StoreFailure::unique("entities_name_type_key", "duplicate key");
        assert_eq!(
            failure.to_string(),
            "store failure (unique_violation): duplicate key"
        );
        assert_eq!(
            failure.constraint.as_deref(),
            Some("entities_name_type_key")
        );
    }

    #[test]
    fn test_cause_is_exposed_as_source() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "socket closed");
        let failure = StoreFailure::transient("connection dropped").with_cause(io);
        let source = failure.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("socket closed"));
    }
}
