//! Team repository.

use crate::model::audit::AuditContext;
use crate::model::team::Team;
use crate::query::descriptor::QueryDescriptor;
use crate::query::resolver::QueryArgs;
use crate::repo::crud::SqliteRepository;
use crate::repo::RepoResult;
use rusqlite::Connection;
use std::ops::Deref;

/// Named queries registered by [`TeamRepository`].
pub fn team_queries() -> Vec<QueryDescriptor<Team>> {
    vec![
        QueryDescriptor::derived("find_by_name"),
        QueryDescriptor::derived("exists_by_name"),
    ]
}

/// Team repository session; generic operations come from
/// [`SqliteRepository`] through `Deref`.
#[derive(Debug)]
pub struct TeamRepository<'conn> {
    inner: SqliteRepository<'conn, Team>,
}

impl<'conn> TeamRepository<'conn> {
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        Self::with_audit(conn, AuditContext::system())
    }

    pub fn with_audit(conn: &'conn Connection, audit: AuditContext) -> RepoResult<Self> {
        let inner = SqliteRepository::with_audit(conn, audit)?.with_queries(team_queries())?;
        Ok(Self { inner })
    }

    pub fn find_by_name(&self, name: &str) -> RepoResult<Vec<Team>> {
        self.inner.execute("find_by_name", &QueryArgs::new().arg(name))
    }

    pub fn exists_by_name(&self, name: &str) -> RepoResult<bool> {
        self.inner
            .execute_exists("exists_by_name", &QueryArgs::new().arg(name))
    }
}

impl<'conn> Deref for TeamRepository<'conn> {
    type Target = SqliteRepository<'conn, Team>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
