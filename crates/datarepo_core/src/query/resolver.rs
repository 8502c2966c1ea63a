//! Resolution of query descriptors into validated, shared query plans.
//!
//! # Responsibility
//! - Parse derived names and declarative clauses against static entity
//!   metadata.
//! - Prepare native SQL once so a typo fails at registration.
//! - Share one plan between descriptors with the same signature.
//!
//! # Invariants
//! - Every descriptor error surfaces from `register`/`build`; execution only
//!   fails on argument binding or storage errors.
//! - The registry only grows with the declared descriptor set.

use crate::model::entity::{Entity, EntityMeta};
use crate::query::descriptor::{DerivedName, LockMode, QueryDescriptor, QuerySource};
use crate::query::sql::{ColumnPath, Condition, JoinRef, WhereClause};
use crate::query::{Comparator, IntoValue};
use crate::repo::{RepoError, RepoResult};
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::Value;
use rusqlite::{Connection, Statement};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::sync::Arc;

const DERIVED_SUFFIXES: [(&str, Comparator); 7] = [
    ("_greater_than_equal", Comparator::Ge),
    ("_greater_than", Comparator::Gt),
    ("_less_than_equal", Comparator::Le),
    ("_less_than", Comparator::Lt),
    ("_is_not_null", Comparator::IsNotNull),
    ("_is_null", Comparator::IsNull),
    ("_in", Comparator::In),
];

const SYMBOL_OPERATORS: [(&str, Comparator); 5] = [
    (">=", Comparator::Ge),
    ("<=", Comparator::Le),
    ("=", Comparator::Eq),
    (">", Comparator::Gt),
    ("<", Comparator::Lt),
];

static CLAUSE_SPLIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s+and\s+").expect("valid clause split regex"));
static CLAUSE_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)(?:\.([A-Za-z_][A-Za-z0-9_]*))?\s*(.*)$")
        .expect("valid clause path regex")
});
static WORD_OPERATOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(is\s+not\s+null|is\s+null|in)\b\s*(.*)$").expect("valid operator regex")
});
static PARAM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\(?\s*:([A-Za-z_][A-Za-z0-9_]*)\s*\)?$").expect("valid param regex")
});

/// Descriptor rejected at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryDefinitionError {
    /// Derived name does not follow `find|count|exists[_subject]_by_<clauses>`.
    MalformedName { query: String },
    /// A clause is empty or cannot be read as `<path> <op> [:param]`.
    MalformedClause { query: String, clause: String },
    UnknownField {
        query: String,
        entity: &'static str,
        path: String,
    },
    UnknownAssociation {
        query: String,
        entity: &'static str,
        association: String,
    },
    UnknownComparator { query: String, clause: String },
    /// More than one reading of a derived clause matches known fields.
    AmbiguousPath {
        query: String,
        clause: String,
        readings: Vec<String>,
    },
    DuplicateName(String),
    /// SQLite refused to prepare native SQL.
    InvalidNative { query: String, message: String },
    NotUpdatable { query: String, field: &'static str },
    /// Modifiers that cannot be combined with the query kind.
    InvalidModifier { query: String, reason: &'static str },
}

impl Display for QueryDefinitionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedName { query } => write!(
                f,
                "query `{query}`: expected `find|count|exists[_subject]_by_<clauses>`"
            ),
            Self::MalformedClause { query, clause } => {
                write!(f, "query `{query}`: malformed clause `{clause}`")
            }
            Self::UnknownField {
                query,
                entity,
                path,
            } => write!(f, "query `{query}`: {entity} has no field `{path}`"),
            Self::UnknownAssociation {
                query,
                entity,
                association,
            } => write!(
                f,
                "query `{query}`: {entity} has no association `{association}`"
            ),
            Self::UnknownComparator { query, clause } => {
                write!(f, "query `{query}`: unknown comparator in `{clause}`")
            }
            Self::AmbiguousPath {
                query,
                clause,
                readings,
            } => write!(
                f,
                "query `{query}`: clause `{clause}` is ambiguous ({})",
                readings.join(" | ")
            ),
            Self::DuplicateName(name) => write!(f, "query `{name}` is registered twice"),
            Self::InvalidNative { query, message } => {
                write!(f, "query `{query}`: native SQL rejected: {message}")
            }
            Self::NotUpdatable { query, field } => {
                write!(f, "query `{query}`: field `{field}` is not updatable")
            }
            Self::InvalidModifier { query, reason } => write!(f, "query `{query}`: {reason}"),
        }
    }
}

impl Error for QueryDefinitionError {}

/// Result shape of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Select,
    Count,
    Exists,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Binding {
    None,
    Positional(usize),
    Named(String),
}

#[derive(Debug, Clone)]
pub(crate) struct PlannedCondition {
    path: ColumnPath,
    op: Comparator,
    binding: Binding,
}

#[derive(Debug)]
pub(crate) enum PlanBody {
    Structured(Vec<PlannedCondition>),
    Native {
        sql: String,
        count_sql: Option<String>,
    },
}

/// Resolved, immutable form of a query descriptor.
#[derive(Debug)]
pub struct QueryPlan {
    kind: QueryKind,
    pub(crate) body: PlanBody,
    pub(crate) fetch: Vec<JoinRef>,
    lock: Option<LockMode>,
    read_only: bool,
    pub(crate) updates: Vec<(String, Value)>,
    /// Positional argument count; `None` when arguments bind by name.
    arity: Option<usize>,
}

impl QueryPlan {
    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn lock_mode(&self) -> Option<LockMode> {
        self.lock
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_native(&self) -> bool {
        matches!(self.body, PlanBody::Native { .. })
    }

    /// Association names loaded in the same statement.
    pub fn fetched_associations(&self) -> Vec<&'static str> {
        self.fetch.iter().map(|join| join.association).collect()
    }

    /// Builds the filter for a structured plan from call arguments.
    pub(crate) fn where_clause(&self, args: &QueryArgs) -> RepoResult<WhereClause> {
        let PlanBody::Structured(conditions) = &self.body else {
            return Err(RepoError::QueryArgument(
                "native queries have no structured filter".to_string(),
            ));
        };

        if let Some(arity) = self.arity {
            if args.positional.len() != arity {
                return Err(RepoError::QueryArgument(format!(
                    "expected {arity} positional arguments, got {}",
                    args.positional.len()
                )));
            }
        }

        let mut clause = WhereClause::default();
        for planned in conditions {
            let argument = match &planned.binding {
                Binding::None => None,
                Binding::Positional(index) => args.positional.get(*index),
                Binding::Named(name) => Some(args.named.get(name).ok_or_else(|| {
                    RepoError::QueryArgument(format!("missing argument `{name}`"))
                })?),
            };

            let values = match (planned.op, argument) {
                (_, None) => Vec::new(),
                (Comparator::In, Some(ArgValue::List(values))) => values.clone(),
                (Comparator::In, Some(ArgValue::Single(value))) => vec![value.clone()],
                (_, Some(ArgValue::Single(value))) => vec![value.clone()],
                (op, Some(ArgValue::List(_))) => {
                    return Err(RepoError::QueryArgument(format!(
                        "a list argument cannot be used with `{}`",
                        op.keyword()
                    )))
                }
            };

            clause.push(&Condition {
                path: planned.path,
                op: planned.op,
                values,
            });
        }
        Ok(clause)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ArgValue {
    Single(Value),
    List(Vec<Value>),
}

/// Arguments for one registered query call.
///
/// Derived queries bind positionally in clause order; declarative and
/// native queries bind by `:name`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryArgs {
    positional: Vec<ArgValue>,
    named: HashMap<String, ArgValue>,
}

impl QueryArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the next positional argument.
    pub fn arg(mut self, value: impl IntoValue) -> Self {
        self.positional.push(ArgValue::Single(value.into_value()));
        self
    }

    /// Appends the next positional argument as a list, for `_in` clauses.
    pub fn list<V: IntoValue>(mut self, values: impl IntoIterator<Item = V>) -> Self {
        self.positional.push(ArgValue::List(
            values.into_iter().map(IntoValue::into_value).collect(),
        ));
        self
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl IntoValue) -> Self {
        self.named
            .insert(name.into(), ArgValue::Single(value.into_value()));
        self
    }

    pub fn bind_list<V: IntoValue>(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.named.insert(
            name.into(),
            ArgValue::List(values.into_iter().map(IntoValue::into_value).collect()),
        );
        self
    }

    /// Binds every parameter of a prepared native statement.
    ///
    /// `extra` supplies values for parameters the caller added around the
    /// native SQL (paging bounds).
    pub(crate) fn bind_native(
        &self,
        stmt: &mut Statement<'_>,
        extra: &[(&str, Value)],
    ) -> RepoResult<()> {
        let mut next_positional = self.positional.iter();
        for index in 1..=stmt.parameter_count() {
            let argument = match stmt.parameter_name(index) {
                Some(raw) => {
                    let name = raw.trim_start_matches([':', '@', '$']);
                    match extra.iter().find(|(key, _)| *key == name) {
                        Some((_, value)) => ArgValue::Single(value.clone()),
                        None => self.named.get(name).cloned().ok_or_else(|| {
                            RepoError::QueryArgument(format!("missing argument `{name}`"))
                        })?,
                    }
                }
                None => next_positional.next().cloned().ok_or_else(|| {
                    RepoError::QueryArgument(format!("missing positional argument {index}"))
                })?,
            };

            match argument {
                ArgValue::Single(value) => stmt.raw_bind_parameter(index, value)?,
                ArgValue::List(_) => {
                    return Err(RepoError::QueryArgument(
                        "native queries do not accept list arguments".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }
}

/// Named, resolved queries over entity `E`.
pub struct QueryRegistry<E> {
    by_name: HashMap<String, Arc<QueryPlan>>,
    by_signature: HashMap<String, Arc<QueryPlan>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> QueryRegistry<E> {
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
            by_signature: HashMap::new(),
            _entity: PhantomData,
        }
    }

    /// Resolves every descriptor, failing on the first invalid one.
    pub fn build(
        conn: &Connection,
        descriptors: impl IntoIterator<Item = QueryDescriptor<E>>,
    ) -> Result<Self, QueryDefinitionError> {
        let mut registry = Self::new();
        for descriptor in descriptors {
            registry.register(conn, descriptor)?;
        }
        info!(
            "event=query_registry_build module=query status=ok entity={} queries={} plans={}",
            E::meta().name,
            registry.len(),
            registry.distinct_plans()
        );
        Ok(registry)
    }

    /// Resolves one descriptor, reusing an existing plan with the same
    /// signature.
    pub fn register(
        &mut self,
        conn: &Connection,
        descriptor: QueryDescriptor<E>,
    ) -> Result<Arc<QueryPlan>, QueryDefinitionError> {
        if self.by_name.contains_key(&descriptor.name) {
            return Err(QueryDefinitionError::DuplicateName(descriptor.name));
        }

        let signature = descriptor.signature();
        let plan = match self.by_signature.get(&signature) {
            Some(plan) => {
                debug!(
                    "event=query_register module=query status=reused entity={} query={}",
                    E::meta().name,
                    descriptor.name
                );
                Arc::clone(plan)
            }
            None => {
                let plan = Arc::new(resolve(conn, E::meta(), &descriptor)?);
                debug!(
                    "event=query_register module=query status=resolved entity={} query={} kind={:?}",
                    E::meta().name,
                    descriptor.name,
                    plan.kind
                );
                self.by_signature.insert(signature, Arc::clone(&plan));
                plan
            }
        };

        self.by_name.insert(descriptor.name, Arc::clone(&plan));
        Ok(plan)
    }

    pub fn plan(&self, name: &str) -> Option<&Arc<QueryPlan>> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Number of plans actually resolved, after signature sharing.
    pub fn distinct_plans(&self) -> usize {
        self.by_signature.len()
    }
}

impl<E: Entity> Default for QueryRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for QueryRegistry<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut names = self.by_name.keys().collect::<Vec<_>>();
        names.sort();
        f.debug_struct("QueryRegistry")
            .field("queries", &names)
            .field("plans", &self.by_signature.len())
            .finish()
    }
}

fn resolve<E>(
    conn: &Connection,
    meta: &'static EntityMeta,
    descriptor: &QueryDescriptor<E>,
) -> Result<QueryPlan, QueryDefinitionError> {
    let query = descriptor.name.as_str();

    let (kind, body, arity) = match &descriptor.source {
        QuerySource::Derived => {
            let (kind, conditions) = resolve_derived(meta, query)?;
            let arity = conditions
                .iter()
                .filter(|condition| matches!(condition.binding, Binding::Positional(_)))
                .count();
            (kind, PlanBody::Structured(conditions), Some(arity))
        }
        QuerySource::Declarative(clause) => (
            QueryKind::Select,
            PlanBody::Structured(resolve_declarative(meta, query, clause)?),
            None,
        ),
        QuerySource::Native { sql, count_sql } => {
            prepare_native(conn, query, sql)?;
            if let Some(count_sql) = count_sql {
                prepare_native(conn, query, count_sql)?;
            }
            (
                QueryKind::Select,
                PlanBody::Native {
                    sql: sql.clone(),
                    count_sql: count_sql.clone(),
                },
                None,
            )
        }
    };

    let mut fetch = Vec::with_capacity(descriptor.fetch.len());
    for association in &descriptor.fetch {
        let def = meta
            .association(association)
            .ok_or_else(|| QueryDefinitionError::UnknownAssociation {
                query: query.to_string(),
                entity: meta.name,
                association: (*association).to_string(),
            })?;
        fetch.push(JoinRef::from_def(def));
    }

    let mut updates = Vec::with_capacity(descriptor.updates.len());
    for update in &descriptor.updates {
        if !update.is_allowed(meta) {
            return Err(QueryDefinitionError::NotUpdatable {
                query: query.to_string(),
                field: update.field(),
            });
        }
        updates.push(update.render());
    }

    let is_native = matches!(body, PlanBody::Native { .. });
    let invalid = |reason| QueryDefinitionError::InvalidModifier {
        query: query.to_string(),
        reason,
    };
    if is_native && (!fetch.is_empty() || descriptor.lock.is_some() || !updates.is_empty()) {
        return Err(invalid("native queries cannot fetch, lock or modify"));
    }
    if kind != QueryKind::Select && (!fetch.is_empty() || descriptor.lock.is_some()) {
        return Err(invalid("count and exists queries cannot fetch or lock"));
    }
    if !updates.is_empty() && (kind != QueryKind::Select || !fetch.is_empty() || descriptor.lock.is_some())
    {
        return Err(invalid("modifying queries cannot count, fetch or lock"));
    }

    let kind = if updates.is_empty() {
        kind
    } else {
        QueryKind::Update
    };

    Ok(QueryPlan {
        kind,
        body,
        fetch,
        lock: descriptor.lock,
        read_only: descriptor.read_only,
        updates,
        arity,
    })
}

fn resolve_derived(
    meta: &'static EntityMeta,
    query: &str,
) -> Result<(QueryKind, Vec<PlannedCondition>), QueryDefinitionError> {
    let parts = DerivedName::parse(query).ok_or_else(|| QueryDefinitionError::MalformedName {
        query: query.to_string(),
    })?;

    let kind = match parts.prefix {
        "count" => QueryKind::Count,
        "exists" => QueryKind::Exists,
        _ => QueryKind::Select,
    };

    let mut conditions = Vec::new();
    let mut position = 0;
    for clause in parts.clauses.split("_and_") {
        if clause.is_empty() {
            return Err(QueryDefinitionError::MalformedClause {
                query: query.to_string(),
                clause: parts.clauses.to_string(),
            });
        }

        let (path, op) = resolve_derived_clause(meta, query, clause)?;
        let binding = if op.takes_argument() {
            position += 1;
            Binding::Positional(position - 1)
        } else {
            Binding::None
        };
        conditions.push(PlannedCondition { path, op, binding });
    }

    Ok((kind, conditions))
}

fn resolve_derived_clause(
    meta: &'static EntityMeta,
    query: &str,
    clause: &str,
) -> Result<(ColumnPath, Comparator), QueryDefinitionError> {
    let mut candidates = vec![(clause, Comparator::Eq)];
    for (suffix, op) in DERIVED_SUFFIXES {
        if let Some(stripped) = clause.strip_suffix(suffix) {
            if !stripped.is_empty() {
                candidates.push((stripped, op));
            }
        }
    }

    let mut readings = Vec::new();
    for (path, op) in candidates {
        for (column, description) in underscored_paths(meta, path) {
            readings.push((column, op, format!("{description} {}", op.keyword())));
        }
    }

    match readings.len() {
        0 => Err(QueryDefinitionError::UnknownField {
            query: query.to_string(),
            entity: meta.name,
            path: clause.to_string(),
        }),
        1 => {
            let (column, op, _) = readings.remove(0);
            Ok((column, op))
        }
        _ => Err(QueryDefinitionError::AmbiguousPath {
            query: query.to_string(),
            clause: clause.to_string(),
            readings: readings
                .into_iter()
                .map(|(_, _, description)| description)
                .collect(),
        }),
    }
}

/// Every way `path` can be read as a field, an association key, or
/// `<association>_<field>`.
fn underscored_paths(meta: &'static EntityMeta, path: &str) -> Vec<(ColumnPath, String)> {
    let mut found = Vec::new();
    if let Some(field) = meta.field(path) {
        found.push((ColumnPath::root(field.column), field.name.to_string()));
    }
    if let Some(association) = meta.association(path) {
        found.push((ColumnPath::root(association.column), association.name.to_string()));
    }

    for (index, _) in path.match_indices('_') {
        let (head, tail) = (&path[..index], &path[index + 1..]);
        if let Some(association) = meta.association(head) {
            let join = JoinRef::from_def(association);
            if let Some(field) = join.target.field(tail) {
                found.push((
                    ColumnPath::joined(join, field.column),
                    format!("{}.{}", association.name, field.name),
                ));
            }
        }
    }
    found
}

fn resolve_declarative(
    meta: &'static EntityMeta,
    query: &str,
    where_clause: &str,
) -> Result<Vec<PlannedCondition>, QueryDefinitionError> {
    let malformed = |clause: &str| QueryDefinitionError::MalformedClause {
        query: query.to_string(),
        clause: clause.to_string(),
    };

    let mut conditions = Vec::new();
    for clause in CLAUSE_SPLIT_RE.split(where_clause.trim()) {
        let clause = clause.trim();
        let captures = CLAUSE_PATH_RE
            .captures(clause)
            .ok_or_else(|| malformed(clause))?;

        let path = declared_path(meta, query, &captures[1], captures.get(2).map(|m| m.as_str()))?;
        let (op, operand) = split_operator(&captures[3]).ok_or_else(|| {
            QueryDefinitionError::UnknownComparator {
                query: query.to_string(),
                clause: clause.to_string(),
            }
        })?;

        let binding = if op.takes_argument() {
            let param = PARAM_RE
                .captures(operand)
                .ok_or_else(|| malformed(clause))?;
            Binding::Named(param[1].to_string())
        } else if operand.is_empty() {
            Binding::None
        } else {
            return Err(malformed(clause));
        };

        conditions.push(PlannedCondition { path, op, binding });
    }

    Ok(conditions)
}

fn declared_path(
    meta: &'static EntityMeta,
    query: &str,
    head: &str,
    tail: Option<&str>,
) -> Result<ColumnPath, QueryDefinitionError> {
    let unknown_field = |entity: &'static str, path: String| QueryDefinitionError::UnknownField {
        query: query.to_string(),
        entity,
        path,
    };

    match tail {
        None => {
            if let Some(field) = meta.field(head) {
                return Ok(ColumnPath::root(field.column));
            }
            if let Some(association) = meta.association(head) {
                return Ok(ColumnPath::root(association.column));
            }
            Err(unknown_field(meta.name, head.to_string()))
        }
        Some(tail) => {
            let association =
                meta.association(head)
                    .ok_or_else(|| QueryDefinitionError::UnknownAssociation {
                        query: query.to_string(),
                        entity: meta.name,
                        association: head.to_string(),
                    })?;
            let join = JoinRef::from_def(association);
            let field = join
                .target
                .field(tail)
                .ok_or_else(|| unknown_field(join.target.name, tail.to_string()))?;
            Ok(ColumnPath::joined(join, field.column))
        }
    }
}

fn split_operator(rest: &str) -> Option<(Comparator, &str)> {
    let rest = rest.trim();
    for (token, op) in SYMBOL_OPERATORS {
        if let Some(operand) = rest.strip_prefix(token) {
            return Some((op, operand.trim()));
        }
    }

    let captures = WORD_OPERATOR_RE.captures(rest)?;
    let keyword = captures[1]
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase();
    let op = match keyword.as_str() {
        "is not null" => Comparator::IsNotNull,
        "is null" => Comparator::IsNull,
        _ => Comparator::In,
    };
    let operand = captures.get(2).map_or("", |m| m.as_str()).trim();
    Some((op, operand))
}

fn prepare_native(conn: &Connection, query: &str, sql: &str) -> Result<(), QueryDefinitionError> {
    conn.prepare(sql)
        .map(drop)
        .map_err(|err| QueryDefinitionError::InvalidNative {
            query: query.to_string(),
            message: err.to_string(),
        })
}
