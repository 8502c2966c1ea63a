//! Declared query shapes, resolved into plans by
//! [`QueryRegistry`](crate::query::resolver::QueryRegistry).
//!
//! A descriptor is inert data. Nothing is parsed or checked until it is
//! registered.

use crate::query::update::FieldUpdate;
use once_cell::sync::Lazy;
use regex::Regex;

const DERIVED_PREFIXES: [&str; 3] = ["find", "count", "exists"];

static DERIVED_WORDS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_]+$").expect("valid derived words regex"));

/// A derived query name split as `<prefix>[_<subject>]_by_<clauses>`.
///
/// The split happens at the first `_by_`, so the subject never contains
/// `by` while clauses may name fields such as `created_by`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DerivedName<'a> {
    pub(crate) prefix: &'a str,
    pub(crate) subject: Option<&'a str>,
    pub(crate) clauses: &'a str,
}

impl<'a> DerivedName<'a> {
    pub(crate) fn parse(name: &'a str) -> Option<Self> {
        let (prefix, rest) = DERIVED_PREFIXES
            .iter()
            .find_map(|prefix| name.strip_prefix(prefix).map(|rest| (*prefix, rest)))?;
        let rest = rest.strip_prefix('_')?;

        let (subject, clauses) = match rest.strip_prefix("by_") {
            Some(clauses) => (None, clauses),
            None => {
                let (subject, clauses) = rest.split_once("_by_")?;
                (Some(subject), clauses)
            }
        };

        let words_ok = |words: &str| DERIVED_WORDS_RE.is_match(words);
        if !words_ok(clauses) || !subject.map_or(true, words_ok) {
            return None;
        }
        Some(Self {
            prefix,
            subject,
            clauses,
        })
    }
}

/// Where the query condition comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuerySource {
    /// Condition encoded in the query name, e.g. `find_by_username_and_age_greater_than`.
    Derived,
    /// Structured where-clause over entity paths with `:param` placeholders.
    Declarative(String),
    /// SQLite SQL passed through verbatim.
    Native {
        sql: String,
        count_sql: Option<String>,
    },
}

/// Row lock taken by a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Exclusive write lock held until the enclosing transaction ends.
    PessimisticWrite,
}

/// One named query over entity `E`.
pub struct QueryDescriptor<E> {
    pub(crate) name: String,
    pub(crate) source: QuerySource,
    pub(crate) fetch: Vec<&'static str>,
    pub(crate) lock: Option<LockMode>,
    pub(crate) read_only: bool,
    pub(crate) updates: Vec<FieldUpdate<E>>,
}

impl<E> QueryDescriptor<E> {
    /// Query whose condition is derived from `name` itself.
    pub fn derived(name: impl Into<String>) -> Self {
        Self::with_source(name.into(), QuerySource::Derived)
    }

    pub fn declarative(name: impl Into<String>, where_clause: impl Into<String>) -> Self {
        Self::with_source(name.into(), QuerySource::Declarative(where_clause.into()))
    }

    pub fn native(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::with_source(
            name.into(),
            QuerySource::Native {
                sql: sql.into(),
                count_sql: None,
            },
        )
    }

    /// Count statement used for paged native queries. Ignored otherwise.
    pub fn with_count_query(mut self, count_sql: impl Into<String>) -> Self {
        if let QuerySource::Native { count_sql: slot, .. } = &mut self.source {
            *slot = Some(count_sql.into());
        }
        self
    }

    /// Loads `association` in the same statement.
    pub fn fetch(mut self, association: &'static str) -> Self {
        if !self.fetch.contains(&association) {
            self.fetch.push(association);
        }
        self
    }

    pub fn lock(mut self, mode: LockMode) -> Self {
        self.lock = Some(mode);
        self
    }

    /// Results bypass the session identity map.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Turns the query into a set-based update of the matching rows.
    pub fn modifying(mut self, updates: Vec<FieldUpdate<E>>) -> Self {
        self.updates = updates;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &QuerySource {
        &self.source
    }

    /// Key under which resolved plans are shared.
    ///
    /// Derived names that only differ in their subject words share a
    /// signature, as do identical declarative and native queries.
    pub fn signature(&self) -> String {
        let body = match &self.source {
            QuerySource::Derived => match DerivedName::parse(&self.name) {
                Some(parts) => format!("derived:{}:{}", parts.prefix, parts.clauses),
                None => format!("derived:{}", self.name),
            },
            QuerySource::Declarative(clause) => {
                format!("declarative:{}", clause.split_whitespace().collect::<Vec<_>>().join(" "))
            }
            QuerySource::Native { sql, count_sql } => {
                format!("native:{sql}|count={}", count_sql.as_deref().unwrap_or(""))
            }
        };

        let updates = self
            .updates
            .iter()
            .map(|update| format!("{}:{:?}", update.column, update.assignment))
            .collect::<Vec<_>>()
            .join(",");

        format!(
            "{body}|fetch={}|lock={:?}|read_only={}|set={updates}",
            self.fetch.join(","),
            self.lock,
            self.read_only,
        )
    }

    fn with_source(name: String, source: QuerySource) -> Self {
        Self {
            name,
            source,
            fetch: Vec::new(),
            lock: None,
            read_only: false,
            updates: Vec::new(),
        }
    }
}

impl<E> Clone for QueryDescriptor<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            source: self.source.clone(),
            fetch: self.fetch.clone(),
            lock: self.lock,
            read_only: self.read_only,
            updates: self.updates.clone(),
        }
    }
}

impl<E> std::fmt::Debug for QueryDescriptor<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryDescriptor")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("fetch", &self.fetch)
            .field("lock", &self.lock)
            .field("read_only", &self.read_only)
            .field("updates", &self.updates)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{DerivedName, QueryDescriptor};
    use crate::model::member::Member;

    #[test]
    fn subject_words_do_not_change_signature() {
        let list = QueryDescriptor::<Member>::derived("find_list_by_username");
        let single = QueryDescriptor::<Member>::derived("find_member_by_username");
        let graph = QueryDescriptor::<Member>::derived("find_entity_graph_by_username").fetch("team");

        assert_eq!(list.signature(), single.signature());
        assert_ne!(list.signature(), graph.signature());
    }

    #[test]
    fn name_splits_at_first_by() {
        let audited = DerivedName::parse("find_by_created_by_and_age_greater_than").unwrap();
        assert_eq!(audited.prefix, "find");
        assert_eq!(audited.subject, None);
        assert_eq!(audited.clauses, "created_by_and_age_greater_than");

        let subject = DerivedName::parse("count_members_by_last_modified_by").unwrap();
        assert_eq!(subject.prefix, "count");
        assert_eq!(subject.subject, Some("members"));
        assert_eq!(subject.clauses, "last_modified_by");
    }

    #[test]
    fn malformed_names_do_not_split() {
        for name in [
            "find_by",
            "find_by_",
            "findings_by_age",
            "load_by_age",
            "find__by_age",
            "find_by_Age",
        ] {
            assert_eq!(DerivedName::parse(name), None, "{name}");
        }
    }

    #[test]
    fn audit_clause_is_part_of_signature() {
        let by_actor = QueryDescriptor::<Member>::derived("find_by_last_modified_by_and_username");
        let by_name = QueryDescriptor::<Member>::derived("find_by_username");
        assert_ne!(by_actor.signature(), by_name.signature());
    }
}
