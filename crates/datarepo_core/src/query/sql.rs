//! SQL text assembly shared by predicates, plans and repositories.
//!
//! The root table is always aliased `e`; a joined association is aliased
//! `j_<association>` and its fetched columns are selected as
//! `<association>__<column>`.

use crate::model::entity::{AssociationDef, EntityMeta};
use crate::query::Comparator;
use rusqlite::types::Value;

pub(crate) const ROOT_ALIAS: &str = "e";

/// How an association is joined into a select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    /// Rows without a related entity are dropped.
    Inner,
    /// Rows without a related entity are kept with null related columns.
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct JoinRef {
    pub(crate) association: &'static str,
    pub(crate) local_column: &'static str,
    pub(crate) target: &'static EntityMeta,
}

impl JoinRef {
    pub(crate) fn from_def(def: &AssociationDef) -> Self {
        Self {
            association: def.name,
            local_column: def.column,
            target: (def.target)(),
        }
    }

    pub(crate) fn alias(&self) -> String {
        format!("j_{}", self.association)
    }

    fn render(&self, join_type: JoinType) -> String {
        let keyword = match join_type {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
        };
        let alias = self.alias();
        format!(
            "{keyword} {table} {alias} ON {alias}.{target_id} = {ROOT_ALIAS}.{local}",
            table = self.target.table,
            target_id = self.target.id.column,
            local = self.local_column,
        )
    }
}

/// Column reference, either on the root table or through one join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ColumnPath {
    pub(crate) join: Option<JoinRef>,
    pub(crate) column: &'static str,
}

impl ColumnPath {
    pub(crate) fn root(column: &'static str) -> Self {
        Self { join: None, column }
    }

    pub(crate) fn joined(join: JoinRef, column: &'static str) -> Self {
        Self {
            join: Some(join),
            column,
        }
    }

    pub(crate) fn render(&self) -> String {
        match &self.join {
            Some(join) => format!("{}.{}", join.alias(), self.column),
            None => format!("{ROOT_ALIAS}.{}", self.column),
        }
    }
}

/// One bound comparison inside a conjunction.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Condition {
    pub(crate) path: ColumnPath,
    pub(crate) op: Comparator,
    pub(crate) values: Vec<Value>,
}

/// Rendered conjunction with its bind values and required inner joins.
#[derive(Debug, Clone, Default)]
pub(crate) struct WhereClause {
    terms: Vec<String>,
    pub(crate) binds: Vec<Value>,
    pub(crate) joins: Vec<JoinRef>,
}

impl WhereClause {
    pub(crate) fn from_conditions<'a>(conditions: impl IntoIterator<Item = &'a Condition>) -> Self {
        let mut clause = Self::default();
        for condition in conditions {
            clause.push(condition);
        }
        clause
    }

    pub(crate) fn push(&mut self, condition: &Condition) {
        let column = condition.path.render();
        let term = match condition.op {
            Comparator::IsNull | Comparator::IsNotNull => {
                format!("{column} {}", condition.op.keyword())
            }
            Comparator::In if condition.values.is_empty() => "0 = 1".to_string(),
            Comparator::In => {
                let placeholders = vec!["?"; condition.values.len()].join(", ");
                self.binds.extend(condition.values.iter().cloned());
                format!("{column} IN ({placeholders})")
            }
            op => {
                self.binds
                    .push(condition.values.first().cloned().unwrap_or(Value::Null));
                format!("{column} {} ?", op.keyword())
            }
        };
        self.terms.push(term);

        if let Some(join) = condition.path.join {
            if !self.joins.contains(&join) {
                self.joins.push(join);
            }
        }
    }

    pub(crate) fn sql(&self) -> Option<String> {
        if self.terms.is_empty() {
            None
        } else {
            Some(self.terms.join(" AND "))
        }
    }
}

/// SELECT statement builder over one root entity table.
#[derive(Debug, Clone)]
pub(crate) struct SelectStatement {
    table: &'static str,
    columns: Vec<String>,
    joins: Vec<(JoinRef, JoinType)>,
    filter: WhereClause,
    order_by: Vec<String>,
    limit: Option<u64>,
    offset: u64,
}

impl SelectStatement {
    pub(crate) fn new(meta: &'static EntityMeta, filter: WhereClause) -> Self {
        let joins = filter
            .joins
            .iter()
            .map(|join| (*join, JoinType::Inner))
            .collect();
        Self {
            table: meta.table,
            columns: Vec::new(),
            joins,
            filter,
            order_by: Vec::new(),
            limit: None,
            offset: 0,
        }
    }

    /// Selects every stored column of the root entity under its own name.
    pub(crate) fn select_entity(mut self, meta: &EntityMeta) -> Self {
        self.columns.extend(
            meta.columns()
                .into_iter()
                .map(|column| format!("{ROOT_ALIAS}.{column} AS {column}")),
        );
        self
    }

    /// Adds an association's columns, joined with `LEFT JOIN` unless the
    /// filter already requires an inner join.
    pub(crate) fn fetch(mut self, join: JoinRef) -> Self {
        let alias = join.alias();
        self.columns.extend(join.target.columns().into_iter().map(|column| {
            format!("{alias}.{column} AS {}__{column}", join.association)
        }));
        self.ensure_join(join, JoinType::Left);
        self
    }

    pub(crate) fn column(mut self, path: ColumnPath, alias: &str) -> Self {
        self.columns.push(format!("{} AS {alias}", path.render()));
        self
    }

    pub(crate) fn ensure_join(&mut self, join: JoinRef, join_type: JoinType) {
        match self.joins.iter_mut().find(|(existing, _)| *existing == join) {
            Some((_, existing_type)) => {
                if join_type == JoinType::Inner {
                    *existing_type = JoinType::Inner;
                }
            }
            None => self.joins.push((join, join_type)),
        }
    }

    pub(crate) fn order_by(mut self, path: ColumnPath, descending: bool) -> Self {
        let direction = if descending { "DESC" } else { "ASC" };
        self.order_by.push(format!("{} {direction}", path.render()));
        self
    }

    pub(crate) fn limit(mut self, limit: u64, offset: u64) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    pub(crate) fn render(&self) -> (String, Vec<Value>) {
        let mut sql = format!("SELECT {} FROM {} {ROOT_ALIAS}", self.columns.join(", "), self.table);
        let mut binds = self.filter.binds.clone();
        self.push_from_tail(&mut sql);

        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by.join(", "));
        }

        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ? OFFSET ?");
            binds.push(Value::Integer(to_i64(limit)));
            binds.push(Value::Integer(to_i64(self.offset)));
        }

        (sql, binds)
    }

    /// Renders `SELECT COUNT(*)` over the same joins and filter.
    pub(crate) fn render_count(&self) -> (String, Vec<Value>) {
        let mut sql = format!("SELECT COUNT(*) FROM {} {ROOT_ALIAS}", self.table);
        self.push_from_tail(&mut sql);
        (sql, self.filter.binds.clone())
    }

    /// Renders `SELECT e.<id>` for use as an `IN (...)` subquery.
    pub(crate) fn render_ids(&self, id_column: &str) -> (String, Vec<Value>) {
        let mut sql = format!(
            "SELECT {ROOT_ALIAS}.{id_column} FROM {} {ROOT_ALIAS}",
            self.table
        );
        self.push_from_tail(&mut sql);
        (sql, self.filter.binds.clone())
    }

    fn push_from_tail(&self, sql: &mut String) {
        for (join, join_type) in &self.joins {
            sql.push(' ');
            sql.push_str(&join.render(*join_type));
        }
        if let Some(filter) = self.filter.sql() {
            sql.push_str(" WHERE ");
            sql.push_str(&filter);
        }
    }
}

pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::{ColumnPath, Condition, JoinRef, SelectStatement, WhereClause};
    use crate::model::entity::Entity;
    use crate::model::member::Member;
    use crate::query::Comparator;
    use rusqlite::types::Value;

    #[test]
    fn inner_join_from_filter_wins_over_fetch_left_join() {
        let meta = Member::meta();
        let join = JoinRef::from_def(&meta.associations[0]);
        let filter = WhereClause::from_conditions(&[Condition {
            path: ColumnPath::joined(join, "name"),
            op: Comparator::Eq,
            values: vec![Value::Text("teamA".to_string())],
        }]);

        let (sql, binds) = SelectStatement::new(meta, filter)
            .select_entity(meta)
            .fetch(join)
            .render();

        assert!(sql.contains("INNER JOIN team j_team ON j_team.team_id = e.team_id"));
        assert!(!sql.contains("LEFT JOIN"));
        assert!(sql.ends_with("WHERE j_team.name = ?"));
        assert_eq!(binds, vec![Value::Text("teamA".to_string())]);
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let clause = WhereClause::from_conditions(&[Condition {
            path: ColumnPath::root("username"),
            op: Comparator::In,
            values: Vec::new(),
        }]);
        assert_eq!(clause.sql().as_deref(), Some("0 = 1"));
        assert!(clause.binds.is_empty());
    }
}
