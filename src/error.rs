//! Error taxonomy and store-failure translation
//!
//! Every store failure observed by callers has gone through [`translate`]
//! exactly once. Translation is a pure function of the failure code, the
//! violated constraint and the [`ErrorContext`] of the call, so the same
//! signal always yields the same [`CatalogError`].

use strum::Display;
use thiserror::Error;
use uuid::Uuid;

use crate::models::EntityType;
use crate::store::{constraints, FailureCode, StoreFailure};

/// Pre-write contract violations. Raised before any store call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{record} is missing required field(s): {}", .fields.join(", "))]
    MissingFields {
        record: &'static str,
        fields: Vec<&'static str>,
    },

    #[error("field(s) {} do not belong to {record}", .fields.join(", "))]
    ForbiddenFields {
        record: &'static str,
        fields: Vec<&'static str>,
    },

    #[error("entity {entity_id} is a {actual}, expected {expected}")]
    KindMismatch {
        entity_id: Uuid,
        expected: EntityType,
        actual: EntityType,
    },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// The closed error taxonomy consumed by the orchestrator and callers.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{record} not found: {key}")]
    EntityNotFound { record: &'static str, key: String },

    #[error("{record} already exists: {key}")]
    EntityAlreadyExists { record: &'static str, key: String },

    #[error("unique constraint violated on {record} ({})", .fields.join(", "))]
    UniqueConstraintViolation {
        record: &'static str,
        fields: Vec<String>,
    },

    #[error("foreign key violation on {field}: referenced {references} does not exist")]
    ForeignKeyViolation { field: String, references: String },

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("database operation {operation} failed: {source}")]
    DatabaseOperation {
        operation: String,
        #[source]
        source: StoreFailure,
    },
}

/// Result type for catalog operations
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

impl CatalogError {
    /// Only unrecognised store failures classified as transient are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseOperation { source, .. } if source.code == FailureCode::Transient
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Natural-key or other unique collisions.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::EntityAlreadyExists { .. } | Self::UniqueConstraintViolation { .. }
        )
    }
}

/// The kind of store call a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    Create,
    CreateMany,
    Upsert,
    Read,
    Update,
    Delete,
    Count,
    Begin,
    Commit,
}

/// Where a store failure happened.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub record: &'static str,
    pub operation: Operation,
    /// Natural key or primary key of the row involved, when known.
    pub key: Option<String>,
}

impl ErrorContext {
    pub fn new(record: &'static str, operation: Operation) -> Self {
        Self {
            record,
            operation,
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.record, self.operation)
    }
}

struct ConstraintInfo {
    name: &'static str,
    fields: &'static [&'static str],
    /// Entity kind a foreign key points at.
    references: Option<&'static str>,
    natural_key: bool,
}

const CONSTRAINTS: &[ConstraintInfo] = &[
    ConstraintInfo {
        name: constraints::ENTITY_NAME_TYPE,
        fields: &["name", "type"],
        references: None,
        natural_key: true,
    },
    ConstraintInfo {
        name: constraints::ENTITY_ATTRIBUTE_NAME_CI,
        fields: &["type", "lower(name)"],
        references: None,
        natural_key: true,
    },
    ConstraintInfo {
        name: constraints::ENTITY_GOOGLE_PLACE_ID,
        fields: &["google_place_id"],
        references: None,
        natural_key: false,
    },
    ConstraintInfo {
        name: constraints::CONNECTION_PAIR,
        fields: &["restaurant_id", "dish_or_category_id"],
        references: None,
        natural_key: true,
    },
    ConstraintInfo {
        name: constraints::CONNECTION_RESTAURANT_FK,
        fields: &["restaurant_id"],
        references: Some("restaurant"),
        natural_key: false,
    },
    ConstraintInfo {
        name: constraints::CONNECTION_DISH_FK,
        fields: &["dish_or_category_id"],
        references: Some("dish_or_category"),
        natural_key: false,
    },
    ConstraintInfo {
        name: constraints::CONNECTION_CATEGORIES_FK,
        fields: &["categories"],
        references: Some("dish_or_category"),
        natural_key: false,
    },
    ConstraintInfo {
        name: constraints::CONNECTION_DISH_ATTRIBUTES_FK,
        fields: &["dish_attributes"],
        references: Some("dish_attribute"),
        natural_key: false,
    },
    ConstraintInfo {
        name: constraints::MENTION_SOURCE,
        fields: &["connection_id", "source_type", "source_id"],
        references: None,
        natural_key: true,
    },
    ConstraintInfo {
        name: constraints::MENTION_CONNECTION_FK,
        fields: &["connection_id"],
        references: Some("connection"),
        natural_key: false,
    },
];

fn constraint_info(name: Option<&str>) -> Option<&'static ConstraintInfo> {
    let name = name?;
    CONSTRAINTS.iter().find(|c| c.name == name)
}

/// Translate a store failure into the catalog taxonomy.
pub fn translate(failure: StoreFailure, ctx: &ErrorContext) -> CatalogError {
    let key = || ctx.key.clone().unwrap_or_else(|| failure.detail.clone());

    match failure.code {
        FailureCode::RecordNotFound => CatalogError::EntityNotFound {
            record: ctx.record,
            key: key(),
        },
        FailureCode::UniqueViolation => {
            let info = constraint_info(failure.constraint.as_deref());
            let creating = matches!(ctx.operation, Operation::Create | Operation::CreateMany);
            match info {
                Some(info) if info.natural_key && creating => CatalogError::EntityAlreadyExists {
                    record: ctx.record,
                    key: key(),
                },
                Some(info) => CatalogError::UniqueConstraintViolation {
                    record: ctx.record,
                    fields: info.fields.iter().map(|f| f.to_string()).collect(),
                },
                None => CatalogError::UniqueConstraintViolation {
                    record: ctx.record,
                    fields: failure.constraint.clone().into_iter().collect(),
                },
            }
        }
        FailureCode::ForeignKeyViolation => {
            match constraint_info(failure.constraint.as_deref()) {
                Some(info) => CatalogError::ForeignKeyViolation {
                    field: info.fields.join(", "),
                    references: info.references.unwrap_or("unknown").to_string(),
                },
                None => CatalogError::ForeignKeyViolation {
                    field: failure
                        .constraint
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                    references: "unknown".to_string(),
                },
            }
        }
        FailureCode::Transient | FailureCode::Other => CatalogError::DatabaseOperation {
            operation: ctx.to_string(),
            source: failure,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_ctx() -> ErrorContext {
        ErrorContext::new("entity", Operation::Create).with_key("Spicy (dish_attribute)")
    }

    #[test]
    fn test_natural_key_collision_on_create_is_already_exists() {
        let failure = StoreFailure::unique(constraints::ENTITY_NAME_TYPE, "duplicate");
        let err = translate(failure, &create_ctx());
        assert!(matches!(
            err,
            CatalogError::EntityAlreadyExists { record: "entity", ref key } if key == "Spicy (dish_attribute)"
        ));
        assert!(err.is_conflict());
    }

    #[test]
    fn test_natural_key_collision_on_update_is_unique_violation() {
        let failure = StoreFailure::unique(constraints::ENTITY_NAME_TYPE, "duplicate");
        let ctx = ErrorContext::new("entity", Operation::Update);
        match translate(failure, &ctx) {
            CatalogError::UniqueConstraintViolation { fields, .. } => {
                assert_eq!(fields, vec!["name".to_string(), "type".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_secondary_unique_collision_carries_fields() {
        let failure = StoreFailure::unique(constraints::ENTITY_GOOGLE_PLACE_ID, "duplicate");
        match translate(failure, &create_ctx()) {
            CatalogError::UniqueConstraintViolation { fields, .. } => {
                assert_eq!(fields, vec!["google_place_id".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_foreign_key_carries_field_and_referenced_kind() {
        let failure = StoreFailure::foreign_key(constraints::CONNECTION_RESTAURANT_FK, "missing");
        let ctx = ErrorContext::new("connection", Operation::CreateMany);
        match translate(failure, &ctx) {
            CatalogError::ForeignKeyViolation { field, references } => {
                assert_eq!(field, "restaurant_id");
                assert_eq!(references, "restaurant");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_not_found_uses_context_key() {
        let ctx = ErrorContext::new("entity", Operation::Update).with_key("abc");
        let err = translate(StoreFailure::not_found("no row"), &ctx);
        assert_eq!(err.to_string(), "entity not found: abc");
    }

    #[test]
    fn test_unrecognised_failure_wraps_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let failure = StoreFailure::other("write failed").with_cause(io);
        let err = translate(failure, &ErrorContext::new("mention", Operation::CreateMany));
        assert!(!err.is_retryable());
        match &err {
            CatalogError::DatabaseOperation { operation, source } => {
                assert_eq!(operation, "mention.create_many");
                assert!(source.cause.is_some());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_transient_failure_is_retryable() {
        let err = translate(
            StoreFailure::transient("deadlock detected"),
            &ErrorContext::new("entity", Operation::Upsert),
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_translation_is_deterministic() {
        let ctx = ErrorContext::new("connection", Operation::Create);
        let a = translate(
            StoreFailure::foreign_key(constraints::CONNECTION_DISH_FK, "x"),
            &ctx,
        );
        let b = translate(
            StoreFailure::foreign_key(constraints::CONNECTION_DISH_FK, "y"),
            &ctx,
        );
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_validation_message_lists_fields() {
        let err = ValidationError::MissingFields {
            record: "restaurant",
            fields: vec!["address", "latitude", "longitude"],
        };
        assert_eq!(
            err.to_string(),
            "restaurant is missing required field(s): address, latitude, longitude"
        );
    }
}
