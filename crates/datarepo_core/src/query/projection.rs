//! Reduced view shapes selected instead of full entities.

use crate::model::entity::{Attr, Entity, JoinAttr};
use crate::query::sql::{ColumnPath, JoinRef};
use rusqlite::Row;
use std::marker::PhantomData;

pub use crate::query::sql::JoinType;

/// One selected column of a projection and the name it is read back under.
pub struct ProjectedColumn<E> {
    pub(crate) path: ColumnPath,
    alias: String,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> ProjectedColumn<E> {
    /// Root field, read back under its attribute name.
    pub fn root(attr: Attr<E>) -> Self {
        Self {
            path: ColumnPath::root(attr.column()),
            alias: attr.name().to_string(),
            _entity: PhantomData,
        }
    }

    /// Related field, read back as `<association>_<field>`.
    pub fn joined<T: Entity>(attr: JoinAttr<E, T>) -> Self {
        let join = JoinRef {
            association: attr.association(),
            local_column: attr.local_column(),
            target: T::meta(),
        };
        Self {
            path: ColumnPath::joined(join, attr.target().column()),
            alias: format!("{}_{}", attr.association(), attr.target().name()),
            _entity: PhantomData,
        }
    }

    pub fn aliased(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }
}

/// View shape over entity `E`.
///
/// Implementations list the columns they need and read them back by alias.
/// The same `read` is used for native queries, whose SQL must select the
/// same aliases.
pub trait Projection<E: Entity>: Sized {
    fn columns() -> Vec<ProjectedColumn<E>>;

    /// Join used for associations referenced by `columns`.
    fn join_type() -> JoinType {
        JoinType::Left
    }

    fn read(row: &Row<'_>) -> rusqlite::Result<Self>;
}
