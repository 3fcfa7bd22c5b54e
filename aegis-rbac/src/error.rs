use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

/// Closed error taxonomy surfaced by the managers.
///
/// Every manager operation returns one of these as a tagged value;
/// unrecoverable storage faults ride in [`SecurityError::Database`].
#[derive(Debug, Error)]
pub enum SecurityError {
    /// The element already exists in the database.
    #[error("resource already exists")]
    AlreadyExist,
    /// The element is invalid: bad format or missing property.
    #[error("invalid resource")]
    Invalid,
    #[error("role does not exist")]
    RoleNotExist,
    #[error("policy does not exist")]
    PolicyNotExist,
    #[error("user does not exist")]
    UserNotExist,
    #[error("rule does not exist")]
    RuleNotExist,
    #[error("token rule does not exist")]
    TokenRuleNotExist,
    /// Administrative resources of the system cannot be modified.
    #[error("administrative resources cannot be modified")]
    AdminResources,
    /// Cloud-managed resources cannot be modified.
    #[error("protected resources cannot be modified")]
    ProtectedResources,
    /// The relationship does not exist or could not be updated.
    #[error("relationship could not be updated")]
    RelationshipError,
    #[error("database constraint violated")]
    ConstraintError,
    #[error("database error: {0}")]
    Database(#[from] DieselError),
}

// Not derived: `diesel::result::Error` carries boxed trait-object payloads
// without `PartialEq`. Database faults compare by their rendered message.
impl PartialEq for SecurityError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SecurityError::Database(a), SecurityError::Database(b)) => {
                a.to_string() == b.to_string()
            }
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl SecurityError {
    /// Maps an integrity fault from the storage engine onto the closed
    /// taxonomy. Anything that is not a recognizable constraint violation
    /// stays a raw database error.
    pub(crate) fn from_integrity(err: DieselError) -> Self {
        match err {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                SecurityError::AlreadyExist
            }
            DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _)
            | DieselError::DatabaseError(DatabaseErrorKind::CheckViolation, _)
            | DieselError::DatabaseError(DatabaseErrorKind::NotNullViolation, _) => {
                SecurityError::ConstraintError
            }
            other => SecurityError::Database(other),
        }
    }
}

/// Failures of the startup integrity check and schema migration.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection error: {0}")]
    Connection(#[from] diesel::ConnectionError),
    #[error("database error: {0}")]
    Database(#[from] DieselError),
    #[error("schema migration failed: {0}")]
    Schema(String),
    #[error(transparent)]
    Security(#[from] SecurityError),
}
