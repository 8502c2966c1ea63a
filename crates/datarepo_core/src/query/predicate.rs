//! Composable filter predicates over typed entity paths.
//!
//! # Invariants
//! - Construction is pure; SQL text is produced only at execution.
//! - `Predicate::always()` is the identity element of `and`.
//! - A conjunction is always flat; no nested groups are built.

use crate::model::entity::{Attr, Entity, JoinAttr};
use crate::query::sql::{ColumnPath, Condition, JoinRef, WhereClause};
use crate::query::{Comparator, IntoValue};
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;

/// Conjunction of conditions over entity `E`. Empty means always true.
pub struct Predicate<E> {
    conditions: Vec<Condition>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Predicate<E> {
    /// Always-true predicate.
    pub fn always() -> Self {
        Self {
            conditions: Vec::new(),
            _entity: PhantomData,
        }
    }

    pub fn eq(attr: Attr<E>, value: impl IntoValue) -> Self {
        Self::compare(attr, Comparator::Eq, value)
    }

    pub fn gt(attr: Attr<E>, value: impl IntoValue) -> Self {
        Self::compare(attr, Comparator::Gt, value)
    }

    pub fn ge(attr: Attr<E>, value: impl IntoValue) -> Self {
        Self::compare(attr, Comparator::Ge, value)
    }

    pub fn lt(attr: Attr<E>, value: impl IntoValue) -> Self {
        Self::compare(attr, Comparator::Lt, value)
    }

    pub fn le(attr: Attr<E>, value: impl IntoValue) -> Self {
        Self::compare(attr, Comparator::Le, value)
    }

    /// Membership test. An empty list matches nothing.
    pub fn is_in<V: IntoValue>(attr: Attr<E>, values: impl IntoIterator<Item = V>) -> Self {
        Self::single(Condition {
            path: ColumnPath::root(attr.column()),
            op: Comparator::In,
            values: values.into_iter().map(IntoValue::into_value).collect(),
        })
    }

    pub fn is_null(attr: Attr<E>) -> Self {
        Self::unary(ColumnPath::root(attr.column()), Comparator::IsNull)
    }

    pub fn is_not_null(attr: Attr<E>) -> Self {
        Self::unary(ColumnPath::root(attr.column()), Comparator::IsNotNull)
    }

    /// Equality that collapses to `always()` for missing or blank input.
    pub fn eq_if_present(attr: Attr<E>, value: Option<&str>) -> Self {
        match non_blank(value) {
            Some(value) => Self::eq(attr, value),
            None => Self::always(),
        }
    }

    /// Equality on a related entity's field, joined with `INNER JOIN`.
    pub fn join_eq<T: Entity>(attr: JoinAttr<E, T>, value: impl IntoValue) -> Self {
        let join = JoinRef {
            association: attr.association(),
            local_column: attr.local_column(),
            target: T::meta(),
        };
        Self::single(Condition {
            path: ColumnPath::joined(join, attr.target().column()),
            op: Comparator::Eq,
            values: vec![value.into_value()],
        })
    }

    /// `join_eq` that collapses to `always()` for missing or blank input.
    pub fn join_eq_if_present<T: Entity>(attr: JoinAttr<E, T>, value: Option<&str>) -> Self {
        match non_blank(value) {
            Some(value) => Self::join_eq(attr, value),
            None => Self::always(),
        }
    }

    /// Conjunction of both sides.
    pub fn and(mut self, other: Self) -> Self {
        self.conditions.extend(other.conditions);
        self
    }

    /// Conjunction of every predicate; `always()` for an empty input.
    pub fn all(predicates: impl IntoIterator<Item = Self>) -> Self {
        predicates.into_iter().fold(Self::always(), Self::and)
    }

    pub fn is_always(&self) -> bool {
        self.conditions.is_empty()
    }

    pub(crate) fn where_clause(&self) -> WhereClause {
        WhereClause::from_conditions(&self.conditions)
    }

    fn compare(attr: Attr<E>, op: Comparator, value: impl IntoValue) -> Self {
        Self::single(Condition {
            path: ColumnPath::root(attr.column()),
            op,
            values: vec![value.into_value()],
        })
    }

    fn unary(path: ColumnPath, op: Comparator) -> Self {
        Self::single(Condition {
            path,
            op,
            values: Vec::new(),
        })
    }

    fn single(condition: Condition) -> Self {
        Self {
            conditions: vec![condition],
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> Default for Predicate<E> {
    fn default() -> Self {
        Self::always()
    }
}

impl<E> Clone for Predicate<E> {
    fn clone(&self) -> Self {
        Self {
            conditions: self.conditions.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E> Debug for Predicate<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Predicate")
            .field("conditions", &self.conditions.len())
            .finish()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::Predicate;
    use crate::model::member::Member;

    #[test]
    fn blank_input_collapses_to_always() {
        assert!(Predicate::eq_if_present(Member::USERNAME, None).is_always());
        assert!(Predicate::eq_if_present(Member::USERNAME, Some("")).is_always());
        assert!(Predicate::join_eq_if_present(Member::TEAM_NAME, Some("  ")).is_always());
        assert!(!Predicate::eq_if_present(Member::USERNAME, Some("member1")).is_always());
    }

    #[test]
    fn always_is_identity_of_and() {
        let base = Predicate::eq(Member::USERNAME, "member1");
        let left = Predicate::always().and(base.clone());
        let right = base.clone().and(Predicate::always());

        assert_eq!(left.where_clause().sql(), base.where_clause().sql());
        assert_eq!(right.where_clause().sql(), base.where_clause().sql());
        assert!(Predicate::<Member>::all(Vec::new()).is_always());
    }

    #[test]
    fn join_predicate_requires_inner_join() {
        let clause = Predicate::join_eq(Member::TEAM_NAME, "teamA")
            .and(Predicate::ge(Member::AGE, 10))
            .where_clause();

        assert_eq!(clause.sql().as_deref(), Some("j_team.name = ? AND e.age >= ?"));
        assert_eq!(clause.joins.len(), 1);
        assert_eq!(clause.joins[0].association, "team");
    }
}
