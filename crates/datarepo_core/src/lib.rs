//! Typed entity repositories over SQLite.
//!
//! Generic CRUD, paging and sorting, derived and declarative named queries,
//! predicate filtering, projections, bulk updates, auditing and pessimistic
//! locking, shown on the `Team`/`Member` model.

pub mod db;
pub mod logging;
pub mod model;
pub mod query;
pub mod repo;

pub use db::{open_db, open_db_in_memory, open_db_with, DbError, DbOptions};
pub use logging::{
    default_log_level, init_logging, init_logging_with, logging_status, LoggingConfig,
    LoggingError,
};
pub use model::audit::{AuditContext, AuditMetadata, AuditorAware, Clock, FixedAuditor, FixedClock};
pub use model::entity::{Attr, Entity, EntityId, EntityMeta, JoinAttr, ValidationError};
pub use model::lazy::{Lazy, Loader};
pub use model::member::Member;
pub use model::team::Team;
pub use query::descriptor::{LockMode, QueryDescriptor};
pub use query::page::{Direction, Order, Page, PageRequest, PageRequestError, Slice, Sort};
pub use query::predicate::Predicate;
pub use query::projection::{ProjectedColumn, Projection};
pub use query::resolver::{QueryArgs, QueryDefinitionError, QueryKind, QueryPlan, QueryRegistry};
pub use query::update::FieldUpdate;
pub use query::Comparator;
pub use repo::{MemberRepository, RepoError, RepoResult, SqliteRepository, TeamRepository};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::{core_version, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
