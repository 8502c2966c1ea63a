//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Provide a generic SQLite repository over any [`Entity`].
//! - Express the worked `Team`/`Member` repository surface on top of it.
//! - Map SQLite failures into the semantic [`RepoError`] taxonomy.
//!
//! # Invariants
//! - Repository writes run `Entity::validate()` before any SQL mutation.
//! - No operation retries; every failure surfaces to the caller.
//!
//! [`Entity`]: crate::model::entity::Entity

pub mod crud;
pub mod member_repo;
pub mod member_spec;
pub mod team_repo;

use crate::db::DbError;
use crate::model::entity::{EntityId, ValidationError};
use crate::query::page::PageRequestError;
use crate::query::resolver::QueryDefinitionError;
use rusqlite::ErrorCode;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub use crud::SqliteRepository;
pub use member_repo::MemberRepository;
pub use team_repo::TeamRepository;

/// Result type used by repository operations.
pub type RepoResult<T> = Result<T, RepoError>;

/// Errors from repository operations.
#[derive(Debug)]
pub enum RepoError {
    /// Entity failed its pre-save checks; nothing was written.
    Validation(ValidationError),
    /// Storage refused the write (constraint or foreign key violation).
    Persistence { message: String },
    /// Target row no longer exists, or the entity was never saved.
    StaleEntity {
        entity: &'static str,
        id: Option<EntityId>,
    },
    /// Query descriptor rejected at registration.
    QueryDefinition(QueryDefinitionError),
    /// Lock wait exceeded the connection busy timeout.
    LockTimeout { entity: Option<&'static str> },
    /// Arguments do not satisfy a registered query or page request.
    QueryArgument(String),
    /// No query is registered under the requested name.
    UnknownQuery(String),
    /// Single-result finder matched more than one row.
    NonUniqueResult { entity: &'static str, count: usize },
    /// Locking read issued outside an explicit transaction.
    NoActiveTransaction,
    /// Connection schema is not at the expected migrated version.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    /// Required table is missing.
    MissingRequiredTable(&'static str),
    /// Required column is missing from expected table.
    MissingRequiredColumn {
        table: &'static str,
        column: &'static str,
    },
    /// Persisted data cannot be converted to a valid read model.
    InvalidData(String),
    /// Underlying SQLite/bootstrap error.
    Db(DbError),
}

impl RepoError {
    /// Attributes an unattributed lock timeout to `entity`.
    pub(crate) fn for_entity(self, entity: &'static str) -> Self {
        match self {
            Self::LockTimeout { entity: None } => Self::LockTimeout {
                entity: Some(entity),
            },
            other => other,
        }
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Persistence { message } => write!(f, "persistence failure: {message}"),
            Self::StaleEntity {
                entity,
                id: Some(id),
            } => write!(f, "{entity} {id} no longer exists"),
            Self::StaleEntity { entity, id: None } => {
                write!(f, "{entity} has not been saved")
            }
            Self::QueryDefinition(err) => write!(f, "{err}"),
            Self::LockTimeout {
                entity: Some(entity),
            } => write!(f, "lock wait timed out for {entity}"),
            Self::LockTimeout { entity: None } => write!(f, "lock wait timed out"),
            Self::QueryArgument(message) => write!(f, "invalid query arguments: {message}"),
            Self::UnknownQuery(name) => write!(f, "no query registered as `{name}`"),
            Self::NonUniqueResult { entity, count } => {
                write!(f, "expected at most one {entity}, found {count}")
            }
            Self::NoActiveTransaction => {
                write!(f, "locking reads require an active transaction")
            }
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "repository requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => {
                write!(f, "repository requires table `{table}`")
            }
            Self::MissingRequiredColumn { table, column } => write!(
                f,
                "repository requires column `{column}` in table `{table}`"
            ),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::QueryDefinition(err) => Some(err),
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ValidationError> for RepoError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<QueryDefinitionError> for RepoError {
    fn from(value: QueryDefinitionError) -> Self {
        Self::QueryDefinition(value)
    }
}

impl From<PageRequestError> for RepoError {
    fn from(value: PageRequestError) -> Self {
        Self::QueryArgument(value.to_string())
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        match value.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => Self::Persistence {
                message: value.to_string(),
            },
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                Self::LockTimeout { entity: None }
            }
            _ => Self::Db(DbError::Sqlite(value)),
        }
    }
}
