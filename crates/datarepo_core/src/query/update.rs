//! Assignments used by set-based bulk updates.

use crate::model::entity::{Attr, EntityMeta};
use crate::query::IntoValue;
use rusqlite::types::Value;
use std::marker::PhantomData;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Assignment {
    Set(Value),
    Increment(i64),
}

/// One `SET` assignment on a field of `E`.
pub struct FieldUpdate<E> {
    pub(crate) name: &'static str,
    pub(crate) column: &'static str,
    pub(crate) assignment: Assignment,
    _entity: PhantomData<fn() -> E>,
}

impl<E> FieldUpdate<E> {
    pub fn set(attr: Attr<E>, value: impl IntoValue) -> Self {
        Self::new(attr, Assignment::Set(value.into_value()))
    }

    /// Adds `delta` to the current stored value.
    pub fn increment(attr: Attr<E>, delta: i64) -> Self {
        Self::new(attr, Assignment::Increment(delta))
    }

    fn new(attr: Attr<E>, assignment: Assignment) -> Self {
        Self {
            name: attr.name(),
            column: attr.column(),
            assignment,
            _entity: PhantomData,
        }
    }

    pub fn field(&self) -> &'static str {
        self.name
    }

    pub(crate) fn is_allowed(&self, meta: &EntityMeta) -> bool {
        meta.is_updatable_column(self.column)
    }

    /// Renders `column = ...` with its bind value.
    pub(crate) fn render(&self) -> (String, Value) {
        match &self.assignment {
            Assignment::Set(value) => (format!("{} = ?", self.column), value.clone()),
            Assignment::Increment(delta) => (
                format!("{column} = {column} + ?", column = self.column),
                Value::Integer(*delta),
            ),
        }
    }
}

impl<E> Clone for FieldUpdate<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            column: self.column,
            assignment: self.assignment.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E> std::fmt::Debug for FieldUpdate<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldUpdate")
            .field("field", &self.name)
            .field("assignment", &self.assignment)
            .finish()
    }
}
