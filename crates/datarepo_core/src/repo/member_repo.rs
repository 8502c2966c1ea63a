//! Member repository: the named member queries and their read models.
//!
//! # Responsibility
//! - Declare every member query once, resolved when the repository is
//!   constructed.
//! - Expose typed finders over those queries and over predicates.
//!
//! # Invariants
//! - Query names are unique; a name shared by two finders is a definition
//!   error at construction.
//! - `bulk_age_plus` leaves the session identity map empty.

use crate::model::audit::AuditContext;
use crate::model::member::Member;
use crate::query::descriptor::{LockMode, QueryDescriptor};
use crate::query::page::{Page, PageRequest, Slice};
use crate::query::predicate::Predicate;
use crate::query::projection::{JoinType, ProjectedColumn, Projection};
use crate::query::resolver::QueryArgs;
use crate::query::update::FieldUpdate;
use crate::repo::crud::SqliteRepository;
use crate::repo::RepoResult;
use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};
use std::ops::Deref;

const FIND_BY_USERNAME_AND_AGE_GREATER_THAN: &str = "find_by_username_and_age_greater_than";
const FIND_BY_USERNAME: &str = "find_by_username";
const FIND_USER: &str = "find_user";
const FIND_BY_NAMES: &str = "find_by_names";
const FIND_LIST_BY_USERNAME: &str = "find_list_by_username";
const FIND_MEMBER_BY_USERNAME: &str = "find_member_by_username";
const FIND_OPTIONAL_BY_USERNAME: &str = "find_optional_by_username";
const FIND_BY_AGE: &str = "find_by_age";
const FIND_SLICE_BY_AGE: &str = "find_slice_by_age";
const COUNT_BY_AGE_GREATER_THAN_EQUAL: &str = "count_by_age_greater_than_equal";
const BULK_AGE_PLUS: &str = "bulk_age_plus";
const FIND_ENTITY_GRAPH_BY_USERNAME: &str = "find_entity_graph_by_username";
const FIND_READ_ONLY_BY_USERNAME: &str = "find_read_only_by_username";
const FIND_LOCK_BY_USERNAME: &str = "find_lock_by_username";
const FIND_PROJECTIONS_BY_USERNAME: &str = "find_projections_by_username";
const FIND_BY_NATIVE_QUERY: &str = "find_by_native_query";
const FIND_BY_NATIVE_PROJECTION: &str = "find_by_native_projection";

/// Named queries registered by [`MemberRepository`].
pub fn member_queries() -> Vec<QueryDescriptor<Member>> {
    vec![
        QueryDescriptor::derived(FIND_BY_USERNAME_AND_AGE_GREATER_THAN),
        QueryDescriptor::declarative(FIND_BY_USERNAME, "username = :username"),
        QueryDescriptor::declarative(FIND_USER, "username = :username and age = :age"),
        QueryDescriptor::declarative(FIND_BY_NAMES, "username in :names"),
        QueryDescriptor::derived(FIND_LIST_BY_USERNAME),
        QueryDescriptor::derived(FIND_MEMBER_BY_USERNAME),
        QueryDescriptor::derived(FIND_OPTIONAL_BY_USERNAME),
        QueryDescriptor::derived(FIND_BY_AGE),
        QueryDescriptor::derived(FIND_SLICE_BY_AGE),
        QueryDescriptor::derived(COUNT_BY_AGE_GREATER_THAN_EQUAL),
        QueryDescriptor::declarative(BULK_AGE_PLUS, "age >= :age")
            .modifying(vec![FieldUpdate::increment(Member::AGE, 1)]),
        QueryDescriptor::derived(FIND_ENTITY_GRAPH_BY_USERNAME).fetch("team"),
        QueryDescriptor::derived(FIND_READ_ONLY_BY_USERNAME).read_only(),
        QueryDescriptor::derived(FIND_LOCK_BY_USERNAME).lock(LockMode::PessimisticWrite),
        QueryDescriptor::derived(FIND_PROJECTIONS_BY_USERNAME),
        QueryDescriptor::native(
            FIND_BY_NATIVE_QUERY,
            "SELECT * FROM member WHERE username = ?",
        ),
        QueryDescriptor::native(
            FIND_BY_NATIVE_PROJECTION,
            "SELECT m.member_id AS id, m.username AS username, t.name AS team_name
             FROM member m
             LEFT JOIN team t ON t.team_id = m.team_id",
        )
        .with_count_query("SELECT COUNT(*) FROM member"),
    ]
}

/// Member username only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameOnly {
    pub username: String,
}

impl Projection<Member> for UsernameOnly {
    fn columns() -> Vec<ProjectedColumn<Member>> {
        vec![ProjectedColumn::root(Member::USERNAME)]
    }

    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            username: row.get("username")?,
        })
    }
}

/// Member with its team name; members without a team are left out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDto {
    pub id: i64,
    pub username: String,
    pub team_name: String,
}

impl Projection<Member> for MemberDto {
    fn columns() -> Vec<ProjectedColumn<Member>> {
        vec![
            ProjectedColumn::root(Member::ID),
            ProjectedColumn::root(Member::USERNAME),
            ProjectedColumn::joined(Member::TEAM_NAME),
        ]
    }

    fn join_type() -> JoinType {
        JoinType::Inner
    }

    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            username: row.get("username")?,
            team_name: row.get("team_name")?,
        })
    }
}

/// Member with an optional team name; every member is listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSummary {
    pub id: i64,
    pub username: String,
    pub team_name: Option<String>,
}

impl Projection<Member> for MemberSummary {
    fn columns() -> Vec<ProjectedColumn<Member>> {
        vec![
            ProjectedColumn::root(Member::ID),
            ProjectedColumn::root(Member::USERNAME),
            ProjectedColumn::joined(Member::TEAM_NAME),
        ]
    }

    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            username: row.get("username")?,
            team_name: row.get("team_name")?,
        })
    }
}

/// Member repository session; generic operations come from
/// [`SqliteRepository`] through `Deref`.
#[derive(Debug)]
pub struct MemberRepository<'conn> {
    inner: SqliteRepository<'conn, Member>,
}

impl<'conn> MemberRepository<'conn> {
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        Self::with_audit(conn, AuditContext::system())
    }

    pub fn with_audit(conn: &'conn Connection, audit: AuditContext) -> RepoResult<Self> {
        let inner = SqliteRepository::with_audit(conn, audit)?.with_queries(member_queries())?;
        Ok(Self { inner })
    }

    pub fn find_by_username_and_age_greater_than(
        &self,
        username: &str,
        age: i64,
    ) -> RepoResult<Vec<Member>> {
        self.inner.execute(
            FIND_BY_USERNAME_AND_AGE_GREATER_THAN,
            &QueryArgs::new().arg(username).arg(age),
        )
    }

    pub fn find_by_username(&self, username: &str) -> RepoResult<Vec<Member>> {
        self.inner
            .execute(FIND_BY_USERNAME, &QueryArgs::new().bind("username", username))
    }

    pub fn find_user(&self, username: &str, age: i64) -> RepoResult<Vec<Member>> {
        self.inner.execute(
            FIND_USER,
            &QueryArgs::new().bind("username", username).bind("age", age),
        )
    }

    pub fn find_username_list(&self) -> RepoResult<Vec<String>> {
        let rows = self
            .inner
            .find_projected::<UsernameOnly>(&Predicate::always())?;
        Ok(rows.into_iter().map(|row| row.username).collect())
    }

    pub fn find_member_dto(&self) -> RepoResult<Vec<MemberDto>> {
        self.inner.find_projected(&Predicate::always())
    }

    pub fn find_by_names<S: AsRef<str>>(&self, names: &[S]) -> RepoResult<Vec<Member>> {
        self.inner.execute(
            FIND_BY_NAMES,
            &QueryArgs::new().bind_list("names", names.iter().map(|name| name.as_ref().to_string())),
        )
    }

    pub fn find_list_by_username(&self, username: &str) -> RepoResult<Vec<Member>> {
        self.inner
            .execute(FIND_LIST_BY_USERNAME, &QueryArgs::new().arg(username))
    }

    /// # Errors
    /// - `NonUniqueResult` when several members share `username`.
    pub fn find_member_by_username(&self, username: &str) -> RepoResult<Option<Member>> {
        self.inner
            .execute_one(FIND_MEMBER_BY_USERNAME, &QueryArgs::new().arg(username))
    }

    pub fn find_optional_by_username(&self, username: &str) -> RepoResult<Option<Member>> {
        self.inner
            .execute_one(FIND_OPTIONAL_BY_USERNAME, &QueryArgs::new().arg(username))
    }

    pub fn find_by_age(&self, age: i64, request: &PageRequest) -> RepoResult<Page<Member>> {
        self.inner
            .execute_page(FIND_BY_AGE, &QueryArgs::new().arg(age), request)
    }

    /// Page content only, without counting.
    pub fn find_by_age_limited(&self, age: i64, request: &PageRequest) -> RepoResult<Vec<Member>> {
        Ok(self.find_by_age_slice(age, request)?.into_content())
    }

    pub fn find_by_age_slice(&self, age: i64, request: &PageRequest) -> RepoResult<Slice<Member>> {
        self.inner
            .execute_slice(FIND_SLICE_BY_AGE, &QueryArgs::new().arg(age), request)
    }

    pub fn count_by_age_greater_than_equal(&self, age: i64) -> RepoResult<u64> {
        self.inner
            .execute_count(COUNT_BY_AGE_GREATER_THAN_EQUAL, &QueryArgs::new().arg(age))
    }

    /// Adds one year to every member aged `age` or more.
    pub fn bulk_age_plus(&self, age: i64) -> RepoResult<u64> {
        self.inner
            .execute_update(BULK_AGE_PLUS, &QueryArgs::new().bind("age", age))
    }

    pub fn find_member_fetch_join(&self) -> RepoResult<Vec<Member>> {
        self.inner
            .find_all_fetching(&Predicate::always(), &["team"])
    }

    /// Every member with its team loaded in the same statement.
    pub fn find_all_with_team(&self) -> RepoResult<Vec<Member>> {
        self.find_member_fetch_join()
    }

    pub fn find_member_entity_graph(&self) -> RepoResult<Vec<Member>> {
        self.find_member_fetch_join()
    }

    pub fn find_entity_graph_by_username(&self, username: &str) -> RepoResult<Vec<Member>> {
        self.inner
            .execute(FIND_ENTITY_GRAPH_BY_USERNAME, &QueryArgs::new().arg(username))
    }

    /// Loads without registering the result in the session.
    pub fn find_read_only_by_username(&self, username: &str) -> RepoResult<Option<Member>> {
        self.inner
            .execute_one(FIND_READ_ONLY_BY_USERNAME, &QueryArgs::new().arg(username))
    }

    /// # Errors
    /// - `NoActiveTransaction` outside an explicit transaction.
    /// - `LockTimeout` when another connection holds the write lock.
    pub fn find_lock_by_username(&self, username: &str) -> RepoResult<Vec<Member>> {
        self.inner
            .execute(FIND_LOCK_BY_USERNAME, &QueryArgs::new().arg(username))
    }

    pub fn find_projections_by_username<P: Projection<Member>>(
        &self,
        username: &str,
    ) -> RepoResult<Vec<P>> {
        self.inner
            .execute_projected(FIND_PROJECTIONS_BY_USERNAME, &QueryArgs::new().arg(username))
    }

    pub fn find_by_native_query(&self, username: &str) -> RepoResult<Option<Member>> {
        self.inner
            .execute_one(FIND_BY_NATIVE_QUERY, &QueryArgs::new().arg(username))
    }

    pub fn find_by_native_projection(
        &self,
        request: &PageRequest,
    ) -> RepoResult<Page<MemberSummary>> {
        self.inner
            .execute_projected_page(FIND_BY_NATIVE_PROJECTION, &QueryArgs::new(), request)
    }

    /// Members matching `predicate`, e.g. built from
    /// [`member_spec`](crate::repo::member_spec).
    pub fn find_all_by_spec(&self, predicate: &Predicate<Member>) -> RepoResult<Vec<Member>> {
        self.inner.find_all_matching(predicate)
    }
}

impl<'conn> Deref for MemberRepository<'conn> {
    type Target = SqliteRepository<'conn, Member>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
