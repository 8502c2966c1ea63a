//! Generic SQLite repository over any [`Entity`].
//!
//! # Responsibility
//! - CRUD, sorting, paging and slicing over one entity table.
//! - Execute predicates, bulk updates, fetch joins, locking reads,
//!   read-only reads and projections.
//! - Execute queries registered in a [`QueryRegistry`].
//!
//! # Invariants
//! - One repository value is one session: its identity map is never shared.
//! - Managed reads return the session's cached entity when it has one.
//! - Read-only reads never touch the identity map.
//! - Fetch and locking reads replace the cached entity with the fresh row.
//! - Entities cached while a transaction is open are evicted once the
//!   connection is back in autocommit mode, whether it committed or rolled
//!   back.
//! - Any bulk update clears the identity map before returning.
//! - Every listing is ordered with the identity column as final tie-breaker.

use crate::db::migrations::latest_version;
use crate::model::audit::AuditContext;
use crate::model::entity::{Entity, EntityId, EntityMeta, EntityRow};
use crate::model::lazy::Loader;
use crate::query::descriptor::QueryDescriptor;
use crate::query::page::{Direction, Page, PageRequest, Slice, Sort};
use crate::query::predicate::Predicate;
use crate::query::projection::Projection;
use crate::query::resolver::{PlanBody, QueryArgs, QueryKind, QueryPlan, QueryRegistry};
use crate::query::sql::{to_i64, ColumnPath, Condition, JoinRef, SelectStatement, WhereClause};
use crate::query::update::FieldUpdate;
use crate::query::Comparator;
use crate::repo::{RepoError, RepoResult};
use log::{debug, info, warn};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// How loaded rows interact with the session identity map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CachePolicy {
    /// Return the cached entity if present, otherwise cache the row.
    Managed,
    /// Replace the cached entity with the row.
    Refresh,
    /// Leave the identity map alone.
    Bypass,
}

/// SQLite-backed repository for entity `E`, scoped to one session.
pub struct SqliteRepository<'conn, E: Entity> {
    conn: &'conn Connection,
    audit: AuditContext,
    identity_map: RefCell<HashMap<EntityId, E>>,
    /// Ids cached while a transaction was open.
    tx_cached: RefCell<HashSet<EntityId>>,
    registry: QueryRegistry<E>,
}

impl<'conn, E: Entity> SqliteRepository<'conn, E> {
    /// Creates a repository from a migrated connection, using the wall clock
    /// and no actor for auditing.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        Self::with_audit(conn, AuditContext::system())
    }

    /// Creates a repository with explicit auditing collaborators.
    pub fn with_audit(conn: &'conn Connection, audit: AuditContext) -> RepoResult<Self> {
        ensure_connection_ready(conn, E::meta())?;
        Ok(Self {
            conn,
            audit,
            identity_map: RefCell::new(HashMap::new()),
            tx_cached: RefCell::new(HashSet::new()),
            registry: QueryRegistry::new(),
        })
    }

    /// Resolves and registers named queries. Fails on the first invalid one.
    pub fn with_queries(
        mut self,
        descriptors: impl IntoIterator<Item = QueryDescriptor<E>>,
    ) -> RepoResult<Self> {
        self.registry = QueryRegistry::build(self.conn, descriptors)?;
        Ok(self)
    }

    pub fn registry(&self) -> &QueryRegistry<E> {
        &self.registry
    }

    pub fn connection(&self) -> &'conn Connection {
        self.conn
    }

    pub fn audit_context(&self) -> &AuditContext {
        &self.audit
    }

    /// Inserts a transient entity or updates a persistent one.
    ///
    /// Auditing hooks run on a staged copy; `entity` only changes once the
    /// write succeeded.
    ///
    /// # Errors
    /// - `Validation` before any SQL runs.
    /// - `StaleEntity` when the row to update no longer exists.
    /// - `Persistence` on constraint violations.
    pub fn save(&self, entity: &mut E) -> RepoResult<EntityId> {
        let meta = E::meta();
        entity.validate()?;
        self.settle_session();

        let mut staged = entity.clone();
        let (id, operation) = match staged.id() {
            None => {
                if let Some(audit) = staged.audit_mut() {
                    audit.on_create(&self.audit);
                }
                let id = self.insert_row(&staged).map_err(|err| err.for_entity(meta.name))?;
                staged.assign_id(id);
                (id, "insert")
            }
            Some(id) => {
                if let Some(audit) = staged.audit_mut() {
                    audit.on_update(&self.audit);
                }
                self.update_row(id, &staged)
                    .map_err(|err| err.for_entity(meta.name))?;
                (id, "update")
            }
        };

        *entity = staged;
        self.remember(id, entity.clone());
        debug!(
            "event=entity_save module=repo status=ok entity={} id={} op={}",
            meta.name, id, operation
        );
        Ok(id)
    }

    /// Loads one entity, served from the identity map when cached.
    pub fn find_by_id(&self, id: EntityId) -> RepoResult<Option<E>> {
        self.settle_session();
        if let Some(cached) = self.identity_map.borrow().get(&id) {
            return Ok(Some(cached.clone()));
        }

        let statement = self.id_statement(id).select_entity(E::meta());
        Ok(self
            .load(&statement, &[], CachePolicy::Managed)?
            .into_iter()
            .next())
    }

    pub fn exists_by_id(&self, id: EntityId) -> RepoResult<bool> {
        self.settle_session();
        if self.identity_map.borrow().contains_key(&id) {
            return Ok(true);
        }
        let (sql, binds) = self.id_statement(id).render_count();
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(binds.iter()), |row| row.get(0))?;
        Ok(count > 0)
    }

    pub fn find_all(&self) -> RepoResult<Vec<E>> {
        self.find_all_sorted(&Sort::unsorted())
    }

    pub fn find_all_sorted(&self, sort: &Sort) -> RepoResult<Vec<E>> {
        let statement = self.entity_statement(&Predicate::always());
        let statement = self.ordered(statement, sort)?;
        self.load(&statement, &[], CachePolicy::Managed)
    }

    pub fn find_page(&self, request: &PageRequest) -> RepoResult<Page<E>> {
        self.find_page_matching(&Predicate::always(), request)
    }

    /// Loads `size + 1` rows to learn whether a next slice exists; never
    /// counts.
    pub fn find_slice(&self, request: &PageRequest) -> RepoResult<Slice<E>> {
        self.find_slice_matching(&Predicate::always(), request)
    }

    /// # Errors
    /// - `StaleEntity` when `entity` is transient or already removed.
    pub fn delete(&self, entity: &E) -> RepoResult<()> {
        match entity.id() {
            Some(id) => self.delete_by_id(id),
            None => Err(RepoError::StaleEntity {
                entity: E::meta().name,
                id: None,
            }),
        }
    }

    pub fn delete_by_id(&self, id: EntityId) -> RepoResult<()> {
        let meta = E::meta();
        let changed = self
            .conn
            .execute(
                &format!("DELETE FROM {} WHERE {} = ?1;", meta.table, meta.id.column),
                [id],
            )
            .map_err(|err| RepoError::from(err).for_entity(meta.name))?;

        self.identity_map.borrow_mut().remove(&id);
        if changed == 0 {
            return Err(RepoError::StaleEntity {
                entity: meta.name,
                id: Some(id),
            });
        }

        debug!(
            "event=entity_delete module=repo status=ok entity={} id={}",
            meta.name, id
        );
        Ok(())
    }

    pub fn count(&self) -> RepoResult<u64> {
        self.count_matching(&Predicate::always())
    }

    pub fn count_matching(&self, predicate: &Predicate<E>) -> RepoResult<u64> {
        self.count_rows(&self.entity_statement(predicate))
    }

    /// Loads every matching entity; `Predicate::always()` loads all rows.
    pub fn find_all_matching(&self, predicate: &Predicate<E>) -> RepoResult<Vec<E>> {
        let statement = self.ordered(self.entity_statement(predicate), &Sort::unsorted())?;
        self.load(&statement, &[], CachePolicy::Managed)
    }

    pub fn find_page_matching(
        &self,
        predicate: &Predicate<E>,
        request: &PageRequest,
    ) -> RepoResult<Page<E>> {
        let statement = self.entity_statement(predicate);
        let total = self.count_rows(&statement)?;
        let content = if request.offset() >= total {
            Vec::new()
        } else {
            let statement = self
                .ordered(statement, request.sort())?
                .limit(u64::from(request.size()), request.offset());
            self.load(&statement, &[], CachePolicy::Managed)?
        };
        Ok(Page::new(content, request.clone(), total))
    }

    pub fn find_slice_matching(
        &self,
        predicate: &Predicate<E>,
        request: &PageRequest,
    ) -> RepoResult<Slice<E>> {
        let statement = self
            .ordered(self.entity_statement(predicate), request.sort())?
            .limit(u64::from(request.size()) + 1, request.offset());
        let rows = self.load(&statement, &[], CachePolicy::Managed)?;
        Ok(Slice::from_lookahead(rows, request.clone()))
    }

    /// # Errors
    /// - `NonUniqueResult` when more than one row matches.
    pub fn find_one_matching(&self, predicate: &Predicate<E>) -> RepoResult<Option<E>> {
        single(self.find_all_matching(predicate)?)
    }

    /// Applies `updates` to every matching row in one statement.
    ///
    /// Bypasses validation and auditing. The identity map is cleared
    /// afterwards so later reads observe the new values.
    pub fn bulk_update_where(
        &self,
        predicate: &Predicate<E>,
        updates: &[FieldUpdate<E>],
    ) -> RepoResult<u64> {
        let meta = E::meta();
        if updates.is_empty() {
            return Err(RepoError::QueryArgument(
                "bulk update needs at least one assignment".to_string(),
            ));
        }
        if let Some(update) = updates.iter().find(|update| !update.is_allowed(meta)) {
            return Err(RepoError::QueryArgument(format!(
                "{}.{} is not updatable",
                meta.name,
                update.field()
            )));
        }

        let assignments = updates.iter().map(FieldUpdate::render).collect::<Vec<_>>();
        self.run_bulk_update(&assignments, self.entity_statement(predicate))
    }

    /// Empties the session identity map.
    ///
    /// Callers that roll back and start a new transaction before touching the
    /// repository again should call this, since the rollback is only noticed
    /// while the connection is in autocommit mode.
    pub fn clear(&self) {
        self.identity_map.borrow_mut().clear();
        self.tx_cached.borrow_mut().clear();
    }

    /// Number of entities currently held by the session.
    pub fn cached_len(&self) -> usize {
        self.settle_session();
        self.identity_map.borrow().len()
    }

    /// Loads matching entities with the named associations in the same
    /// statement, so their `Lazy` fields come back loaded.
    pub fn find_all_fetching(
        &self,
        predicate: &Predicate<E>,
        associations: &[&str],
    ) -> RepoResult<Vec<E>> {
        let meta = E::meta();
        let mut statement = self.entity_statement(predicate);
        let mut fetched = Vec::with_capacity(associations.len());
        for name in associations {
            let def = meta.association(name).ok_or_else(|| {
                RepoError::QueryArgument(format!("{} has no association `{name}`", meta.name))
            })?;
            statement = statement.fetch(JoinRef::from_def(def));
            fetched.push(def.name);
        }

        let statement = self.ordered(statement, &Sort::unsorted())?;
        self.load(&statement, &fetched, CachePolicy::Refresh)
    }

    /// Takes the write lock for the rest of the enclosing transaction, then
    /// loads the matching entities.
    ///
    /// # Errors
    /// - `NoActiveTransaction` when the connection is in autocommit mode.
    /// - `LockTimeout` when another connection holds the lock past the busy
    ///   timeout.
    pub fn find_all_locked(&self, predicate: &Predicate<E>) -> RepoResult<Vec<E>> {
        let statement = self.entity_statement(predicate);
        self.lock_rows(&statement)?;
        let statement = self.ordered(statement, &Sort::unsorted())?;
        self.load(&statement, &[], CachePolicy::Refresh)
    }

    /// Loads matching entities without registering them in the session.
    pub fn find_all_read_only(&self, predicate: &Predicate<E>) -> RepoResult<Vec<E>> {
        let statement = self.ordered(self.entity_statement(predicate), &Sort::unsorted())?;
        self.load(&statement, &[], CachePolicy::Bypass)
    }

    pub fn find_projected<P: Projection<E>>(&self, predicate: &Predicate<E>) -> RepoResult<Vec<P>> {
        let statement = self.ordered(
            projected_statement::<E, P>(predicate.where_clause()),
            &Sort::unsorted(),
        )?;
        self.query_rows(&statement, |row| P::read(row).map_err(RepoError::from))
    }

    pub fn find_projected_page<P: Projection<E>>(
        &self,
        predicate: &Predicate<E>,
        request: &PageRequest,
    ) -> RepoResult<Page<P>> {
        self.projected_page(projected_statement::<E, P>(predicate.where_clause()), request)
    }

    /// Runs a registered select query.
    pub fn execute(&self, name: &str, args: &QueryArgs) -> RepoResult<Vec<E>> {
        let plan = self.plan_of(name, &[QueryKind::Select])?;
        match &plan.body {
            PlanBody::Native { sql, .. } => {
                let rows = self.query_native(sql, args, &[], |row| read_entity::<E>(row, &[]))?;
                Ok(self.attach(rows, plan_policy(&plan)))
            }
            PlanBody::Structured(_) => {
                let statement = self.plan_statement(&plan, args)?;
                if plan.lock_mode().is_some() {
                    self.lock_rows(&statement)?;
                }
                let statement = self.ordered(statement, &Sort::unsorted())?;
                self.load(
                    &statement,
                    &plan.fetched_associations(),
                    plan_policy(&plan),
                )
            }
        }
    }

    /// Runs a registered select query expecting at most one row.
    pub fn execute_one(&self, name: &str, args: &QueryArgs) -> RepoResult<Option<E>> {
        single(self.execute(name, args)?)
    }

    pub fn execute_page(
        &self,
        name: &str,
        args: &QueryArgs,
        request: &PageRequest,
    ) -> RepoResult<Page<E>> {
        let plan = self.plan_of(name, &[QueryKind::Select])?;
        if plan.lock_mode().is_some() {
            return Err(RepoError::QueryArgument(format!(
                "query `{name}` locks rows and cannot be paged"
            )));
        }

        match &plan.body {
            PlanBody::Native { sql, count_sql } => {
                let total = self.count_native(sql, count_sql.as_deref(), args)?;
                let content = if request.offset() >= total {
                    Vec::new()
                } else {
                    let rows = self.query_native_page(
                        sql,
                        args,
                        &native_entity_order(E::meta(), request.sort())?,
                        u64::from(request.size()),
                        request.offset(),
                        |row| read_entity::<E>(row, &[]),
                    )?;
                    self.attach(rows, plan_policy(&plan))
                };
                Ok(Page::new(content, request.clone(), total))
            }
            PlanBody::Structured(_) => {
                let statement = self.plan_statement(&plan, args)?;
                let total = self.count_rows(&statement)?;
                let content = if request.offset() >= total {
                    Vec::new()
                } else {
                    let statement = self
                        .ordered(statement, request.sort())?
                        .limit(u64::from(request.size()), request.offset());
                    self.load(
                        &statement,
                        &plan.fetched_associations(),
                        plan_policy(&plan),
                    )?
                };
                Ok(Page::new(content, request.clone(), total))
            }
        }
    }

    pub fn execute_slice(
        &self,
        name: &str,
        args: &QueryArgs,
        request: &PageRequest,
    ) -> RepoResult<Slice<E>> {
        let plan = self.plan_of(name, &[QueryKind::Select])?;
        if plan.lock_mode().is_some() {
            return Err(RepoError::QueryArgument(format!(
                "query `{name}` locks rows and cannot be sliced"
            )));
        }

        let lookahead = u64::from(request.size()) + 1;
        let rows = match &plan.body {
            PlanBody::Native { sql, .. } => {
                let rows = self.query_native_page(
                    sql,
                    args,
                    &native_entity_order(E::meta(), request.sort())?,
                    lookahead,
                    request.offset(),
                    |row| read_entity::<E>(row, &[]),
                )?;
                self.attach(rows, plan_policy(&plan))
            }
            PlanBody::Structured(_) => {
                let statement = self
                    .ordered(self.plan_statement(&plan, args)?, request.sort())?
                    .limit(lookahead, request.offset());
                self.load(
                    &statement,
                    &plan.fetched_associations(),
                    plan_policy(&plan),
                )?
            }
        };
        Ok(Slice::from_lookahead(rows, request.clone()))
    }

    /// Runs a registered count query; select queries are counted too.
    pub fn execute_count(&self, name: &str, args: &QueryArgs) -> RepoResult<u64> {
        let plan = self.plan_of(name, &[QueryKind::Count, QueryKind::Select])?;
        match &plan.body {
            PlanBody::Native { sql, count_sql } => {
                self.count_native(sql, count_sql.as_deref(), args)
            }
            PlanBody::Structured(_) => self.count_rows(&self.plan_statement(&plan, args)?),
        }
    }

    pub fn execute_exists(&self, name: &str, args: &QueryArgs) -> RepoResult<bool> {
        let plan = self.plan_of(name, &[QueryKind::Exists, QueryKind::Select])?;
        match &plan.body {
            PlanBody::Native { sql, count_sql } => {
                Ok(self.count_native(sql, count_sql.as_deref(), args)? > 0)
            }
            PlanBody::Structured(_) => {
                let (sql, binds) = self
                    .plan_statement(&plan, args)?
                    .limit(1, 0)
                    .render();
                let found = self
                    .conn
                    .query_row(&sql, params_from_iter(binds.iter()), |_| Ok(()))
                    .optional()?;
                Ok(found.is_some())
            }
        }
    }

    /// Runs a registered select query and reads each row as `P`.
    pub fn execute_projected<P: Projection<E>>(
        &self,
        name: &str,
        args: &QueryArgs,
    ) -> RepoResult<Vec<P>> {
        let plan = self.plan_of(name, &[QueryKind::Select])?;
        match &plan.body {
            PlanBody::Native { sql, .. } => {
                self.query_native(sql, args, &[], |row| P::read(row).map_err(RepoError::from))
            }
            PlanBody::Structured(_) => {
                let statement = projected_statement::<E, P>(plan.where_clause(args)?);
                let statement = self.ordered(statement, &Sort::unsorted())?;
                self.query_rows(&statement, |row| P::read(row).map_err(RepoError::from))
            }
        }
    }

    pub fn execute_projected_page<P: Projection<E>>(
        &self,
        name: &str,
        args: &QueryArgs,
        request: &PageRequest,
    ) -> RepoResult<Page<P>> {
        let plan = self.plan_of(name, &[QueryKind::Select])?;
        match &plan.body {
            PlanBody::Native { sql, count_sql } => {
                let total = self.count_native(sql, count_sql.as_deref(), args)?;
                let content = if request.offset() >= total {
                    Vec::new()
                } else {
                    self.query_native_page(
                        sql,
                        args,
                        &native_projection_order::<E, P>(request.sort())?,
                        u64::from(request.size()),
                        request.offset(),
                        |row| P::read(row).map_err(RepoError::from),
                    )?
                };
                Ok(Page::new(content, request.clone(), total))
            }
            PlanBody::Structured(_) => {
                self.projected_page(projected_statement::<E, P>(plan.where_clause(args)?), request)
            }
        }
    }

    /// Runs a registered modifying query and returns the affected row count.
    /// Clears the identity map like `bulk_update_where`.
    pub fn execute_update(&self, name: &str, args: &QueryArgs) -> RepoResult<u64> {
        let plan = self.plan_of(name, &[QueryKind::Update])?;
        let statement = SelectStatement::new(E::meta(), plan.where_clause(args)?);
        self.run_bulk_update(&plan.updates, statement)
    }

    fn insert_row(&self, entity: &E) -> RepoResult<EntityId> {
        let meta = E::meta();
        let values = entity.write_values();
        let columns = values.iter().map(|(column, _)| *column).collect::<Vec<_>>();
        let placeholders = vec!["?"; columns.len()].join(", ");

        self.conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES ({placeholders});",
                meta.table,
                columns.join(", ")
            ),
            params_from_iter(values.into_iter().map(|(_, value)| value)),
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update_row(&self, id: EntityId, entity: &E) -> RepoResult<()> {
        let meta = E::meta();
        let values = entity
            .write_values()
            .into_iter()
            .filter(|(column, _)| meta.is_updatable_column(column))
            .collect::<Vec<_>>();
        let assignments = values
            .iter()
            .map(|(column, _)| format!("{column} = ?"))
            .collect::<Vec<_>>()
            .join(", ");

        let mut binds = values.into_iter().map(|(_, value)| value).collect::<Vec<_>>();
        binds.push(Value::Integer(id));

        let changed = self.conn.execute(
            &format!(
                "UPDATE {} SET {assignments} WHERE {} = ?;",
                meta.table, meta.id.column
            ),
            params_from_iter(binds),
        )?;

        if changed == 0 {
            self.identity_map.borrow_mut().remove(&id);
            return Err(RepoError::StaleEntity {
                entity: meta.name,
                id: Some(id),
            });
        }
        Ok(())
    }

    fn run_bulk_update(
        &self,
        assignments: &[(String, Value)],
        statement: SelectStatement,
    ) -> RepoResult<u64> {
        let meta = E::meta();
        let started_at = Instant::now();
        let (subquery, filter_binds) = statement.render_ids(meta.id.column);
        let set_sql = assignments
            .iter()
            .map(|(sql, _)| sql.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        let mut binds = assignments
            .iter()
            .map(|(_, value)| value.clone())
            .collect::<Vec<_>>();
        binds.extend(filter_binds);

        let result = self.conn.execute(
            &format!(
                "UPDATE {table} SET {set_sql} WHERE {id} IN ({subquery});",
                table = meta.table,
                id = meta.id.column
            ),
            params_from_iter(binds),
        );

        // Cached copies may be stale even if the statement failed midway.
        self.clear();

        let affected = result.map_err(|err| RepoError::from(err).for_entity(meta.name))?;
        info!(
            "event=bulk_update module=repo status=ok entity={} affected={} duration_ms={}",
            meta.name,
            affected,
            started_at.elapsed().as_millis()
        );
        Ok(affected as u64)
    }

    fn lock_rows(&self, statement: &SelectStatement) -> RepoResult<()> {
        let meta = E::meta();
        if self.conn.is_autocommit() {
            return Err(RepoError::NoActiveTransaction);
        }

        let started_at = Instant::now();
        let (subquery, binds) = statement.render_ids(meta.id.column);
        let result = self.conn.execute(
            &format!(
                "UPDATE {table} SET {id} = {id} WHERE {id} IN ({subquery});",
                table = meta.table,
                id = meta.id.column
            ),
            params_from_iter(binds.iter()),
        );

        match result {
            Ok(locked) => {
                debug!(
                    "event=lock_acquire module=repo status=ok entity={} rows={} duration_ms={}",
                    meta.name,
                    locked,
                    started_at.elapsed().as_millis()
                );
                Ok(())
            }
            Err(err) => {
                let err = RepoError::from(err).for_entity(meta.name);
                warn!(
                    "event=lock_acquire module=repo status=error entity={} duration_ms={} error={}",
                    meta.name,
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }

    fn plan_of(&self, name: &str, accepted: &[QueryKind]) -> RepoResult<Arc<QueryPlan>> {
        let plan = self
            .registry
            .plan(name)
            .ok_or_else(|| RepoError::UnknownQuery(name.to_string()))?;
        if !accepted.contains(&plan.kind()) {
            return Err(RepoError::QueryArgument(format!(
                "query `{name}` is a {:?} query",
                plan.kind()
            )));
        }
        Ok(Arc::clone(plan))
    }

    fn plan_statement(&self, plan: &QueryPlan, args: &QueryArgs) -> RepoResult<SelectStatement> {
        let mut statement = SelectStatement::new(E::meta(), plan.where_clause(args)?)
            .select_entity(E::meta());
        for join in &plan.fetch {
            statement = statement.fetch(*join);
        }
        Ok(statement)
    }

    fn entity_statement(&self, predicate: &Predicate<E>) -> SelectStatement {
        SelectStatement::new(E::meta(), predicate.where_clause()).select_entity(E::meta())
    }

    fn id_statement(&self, id: EntityId) -> SelectStatement {
        let meta = E::meta();
        let filter = WhereClause::from_conditions(&[Condition {
            path: ColumnPath::root(meta.id.column),
            op: Comparator::Eq,
            values: vec![Value::Integer(id)],
        }]);
        SelectStatement::new(meta, filter)
    }

    /// Applies `sort`, then the identity column as tie-breaker.
    fn ordered(&self, statement: SelectStatement, sort: &Sort) -> RepoResult<SelectStatement> {
        let meta = E::meta();
        let mut statement = statement;
        let mut has_id = false;
        for (column, direction) in resolve_sort(meta, sort)? {
            has_id |= column == meta.id.column;
            statement = statement.order_by(ColumnPath::root(column), direction == Direction::Desc);
        }
        if !has_id {
            statement = statement.order_by(ColumnPath::root(meta.id.column), false);
        }
        Ok(statement)
    }

    fn projected_page<P: Projection<E>>(
        &self,
        statement: SelectStatement,
        request: &PageRequest,
    ) -> RepoResult<Page<P>> {
        let total = self.count_rows(&statement)?;
        let content = if request.offset() >= total {
            Vec::new()
        } else {
            let statement = self
                .ordered(statement, request.sort())?
                .limit(u64::from(request.size()), request.offset());
            self.query_rows(&statement, |row| P::read(row).map_err(RepoError::from))?
        };
        Ok(Page::new(content, request.clone(), total))
    }

    fn count_rows(&self, statement: &SelectStatement) -> RepoResult<u64> {
        let (sql, binds) = statement.render_count();
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(binds.iter()), |row| row.get(0))?;
        u64::try_from(count).map_err(|_| RepoError::InvalidData(format!("negative count {count}")))
    }

    fn load(
        &self,
        statement: &SelectStatement,
        fetched: &[&'static str],
        policy: CachePolicy,
    ) -> RepoResult<Vec<E>> {
        let rows = self.query_rows(statement, |row| read_entity(row, fetched))?;
        Ok(self.attach(rows, policy))
    }

    fn query_rows<T>(
        &self,
        statement: &SelectStatement,
        mut read: impl FnMut(&Row<'_>) -> RepoResult<T>,
    ) -> RepoResult<Vec<T>> {
        let started_at = Instant::now();
        let (sql, binds) = statement.render();
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(binds.iter()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read(row)?);
        }

        debug!(
            "event=repo_query module=repo status=ok entity={} rows={} duration_ms={}",
            E::meta().name,
            out.len(),
            started_at.elapsed().as_millis()
        );
        Ok(out)
    }

    fn query_native<T>(
        &self,
        sql: &str,
        args: &QueryArgs,
        extra: &[(&str, Value)],
        mut read: impl FnMut(&Row<'_>) -> RepoResult<T>,
    ) -> RepoResult<Vec<T>> {
        let started_at = Instant::now();
        let mut stmt = self.conn.prepare(sql)?;
        args.bind_native(&mut stmt, extra)?;

        let mut out = Vec::new();
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next()? {
            out.push(read(row)?);
        }

        debug!(
            "event=repo_native_query module=repo status=ok entity={} rows={} duration_ms={}",
            E::meta().name,
            out.len(),
            started_at.elapsed().as_millis()
        );
        Ok(out)
    }

    fn query_native_page<T>(
        &self,
        sql: &str,
        args: &QueryArgs,
        order: &[(String, Direction)],
        limit: u64,
        offset: u64,
        read: impl FnMut(&Row<'_>) -> RepoResult<T>,
    ) -> RepoResult<Vec<T>> {
        let mut order = order
            .iter()
            .map(|(column, direction)| match direction {
                Direction::Asc => format!("{column} ASC"),
                Direction::Desc => format!("{column} DESC"),
            })
            .collect::<Vec<_>>()
            .join(", ");
        if !order.is_empty() {
            order.insert_str(0, " ORDER BY ");
        }

        let paged = format!(
            "SELECT * FROM ({}) AS native{order} LIMIT :__limit OFFSET :__offset",
            trim_statement(sql)
        );
        self.query_native(
            &paged,
            args,
            &[
                ("__limit", Value::Integer(to_i64(limit))),
                ("__offset", Value::Integer(to_i64(offset))),
            ],
            read,
        )
    }

    fn count_native(&self, sql: &str, count_sql: Option<&str>, args: &QueryArgs) -> RepoResult<u64> {
        let count_sql = match count_sql {
            Some(count_sql) => count_sql.to_string(),
            None => format!("SELECT COUNT(*) FROM ({}) AS native", trim_statement(sql)),
        };
        let counts = self.query_native(&count_sql, args, &[], |row| {
            row.get::<_, i64>(0).map_err(RepoError::from)
        })?;
        let count = counts.into_iter().next().unwrap_or(0);
        u64::try_from(count).map_err(|_| RepoError::InvalidData(format!("negative count {count}")))
    }

    fn attach(&self, entities: Vec<E>, policy: CachePolicy) -> Vec<E> {
        if policy == CachePolicy::Bypass {
            return entities;
        }

        self.settle_session();
        let in_transaction = !self.conn.is_autocommit();
        let mut identity_map = self.identity_map.borrow_mut();
        let mut tx_cached = self.tx_cached.borrow_mut();
        entities
            .into_iter()
            .map(|entity| {
                let Some(id) = entity.id() else {
                    return entity;
                };
                if in_transaction {
                    tx_cached.insert(id);
                }
                match policy {
                    CachePolicy::Managed => identity_map.entry(id).or_insert(entity).clone(),
                    _ => {
                        identity_map.insert(id, entity.clone());
                        entity
                    }
                }
            })
            .collect()
    }

    fn remember(&self, id: EntityId, entity: E) {
        if !self.conn.is_autocommit() {
            self.tx_cached.borrow_mut().insert(id);
        }
        self.identity_map.borrow_mut().insert(id, entity);
    }

    /// Evicts entities cached inside a transaction that has since ended.
    fn settle_session(&self) {
        if !self.conn.is_autocommit() {
            return;
        }
        let mut tx_cached = self.tx_cached.borrow_mut();
        if tx_cached.is_empty() {
            return;
        }

        let mut identity_map = self.identity_map.borrow_mut();
        let evicted = tx_cached.len();
        for id in tx_cached.drain() {
            identity_map.remove(&id);
        }
        debug!(
            "event=session_settle module=repo status=ok entity={} evicted={}",
            E::meta().name,
            evicted
        );
    }
}

impl<E: Entity> Loader<E> for SqliteRepository<'_, E> {
    fn load(&self, id: EntityId) -> RepoResult<Option<E>> {
        self.find_by_id(id)
    }
}

impl<E: Entity> std::fmt::Debug for SqliteRepository<'_, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRepository")
            .field("entity", &E::meta().name)
            .field("cached", &self.cached_len())
            .field("registry", &self.registry)
            .finish()
    }
}

fn read_entity<E: Entity>(row: &Row<'_>, fetched: &[&'static str]) -> RepoResult<E> {
    E::read(&EntityRow::new(row, fetched))
}

fn plan_policy(plan: &QueryPlan) -> CachePolicy {
    if plan.is_read_only() {
        CachePolicy::Bypass
    } else if !plan.fetch.is_empty() || plan.lock_mode().is_some() {
        CachePolicy::Refresh
    } else {
        CachePolicy::Managed
    }
}

fn projected_statement<E: Entity, P: Projection<E>>(filter: WhereClause) -> SelectStatement {
    let mut statement = SelectStatement::new(E::meta(), filter);
    for column in P::columns() {
        if let Some(join) = column.path.join {
            statement.ensure_join(join, P::join_type());
        }
        statement = statement.column(column.path, column.alias());
    }
    statement
}

fn resolve_sort(
    meta: &'static EntityMeta,
    sort: &Sort,
) -> RepoResult<Vec<(&'static str, Direction)>> {
    sort.orders()
        .iter()
        .map(|order| {
            meta.field(&order.property)
                .map(|field| field.column)
                .or_else(|| {
                    meta.association(&order.property)
                        .map(|association| association.column)
                })
                .map(|column| (column, order.direction))
                .ok_or_else(|| {
                    RepoError::QueryArgument(format!(
                        "{} has no sortable property `{}`",
                        meta.name, order.property
                    ))
                })
        })
        .collect()
}

/// Sort keys for native entity SQL, which selects the table's own columns.
fn native_entity_order(
    meta: &'static EntityMeta,
    sort: &Sort,
) -> RepoResult<Vec<(String, Direction)>> {
    Ok(resolve_sort(meta, sort)?
        .into_iter()
        .map(|(column, direction)| (column.to_string(), direction))
        .collect())
}

/// Sort keys for native projection SQL, which selects the projection's
/// aliases.
fn native_projection_order<E: Entity, P: Projection<E>>(
    sort: &Sort,
) -> RepoResult<Vec<(String, Direction)>> {
    let columns = P::columns();
    sort.orders()
        .iter()
        .map(|order| {
            columns
                .iter()
                .find(|column| column.alias() == order.property)
                .map(|column| (column.alias().to_string(), order.direction))
                .ok_or_else(|| {
                    RepoError::QueryArgument(format!(
                        "projection of {} has no sortable alias `{}`",
                        E::meta().name,
                        order.property
                    ))
                })
        })
        .collect()
}

fn single<E: Entity>(mut rows: Vec<E>) -> RepoResult<Option<E>> {
    match rows.len() {
        0 => Ok(None),
        1 => Ok(rows.pop()),
        count => Err(RepoError::NonUniqueResult {
            entity: E::meta().name,
            count,
        }),
    }
}

fn trim_statement(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

/// Checks schema version, table and columns before a repository is handed
/// out.
fn ensure_connection_ready(conn: &Connection, meta: &'static EntityMeta) -> RepoResult<()> {
    let expected_version = latest_version();
    let actual_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if actual_version != expected_version {
        return Err(RepoError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    if !table_exists(conn, meta.table)? {
        return Err(RepoError::MissingRequiredTable(meta.table));
    }

    for column in meta.columns() {
        if !table_has_column(conn, meta.table, column)? {
            return Err(RepoError::MissingRequiredColumn {
                table: meta.table,
                column,
            });
        }
    }

    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> RepoResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let current: String = row.get(1)?;
        if current == column {
            return Ok(true);
        }
    }
    Ok(false)
}
