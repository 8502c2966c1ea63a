//! Entity contracts shared by repositories and the query resolver.
//!
//! # Responsibility
//! - Describe each entity type statically (table, identity, fields,
//!   associations) so queries can be validated without reflection.
//! - Provide typed attribute paths used by predicates, sorts and updates.
//! - Map entities to and from SQLite rows.
//!
//! # Invariants
//! - `Entity::id()` is `None` exactly while the entity is transient.
//! - An assigned identity is never reassigned; repositories only call
//!   `assign_id` on transient entities.
//! - Fields flagged `updatable: false` are written on insert only.

use crate::model::audit::AuditMetadata;
use crate::repo::RepoResult;
use rusqlite::types::{FromSql, Value};
use rusqlite::Row;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;

/// Surrogate key assigned by storage on first save.
pub type EntityId = i64;

/// Storage class of a mapped field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    Text,
}

/// One mapped field of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    pub column: &'static str,
    pub kind: FieldKind,
    pub updatable: bool,
}

impl FieldDef {
    pub const fn new(name: &'static str, column: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            column,
            kind,
            updatable: true,
        }
    }

    /// Marks a field as insert-only.
    pub const fn insert_only(mut self) -> Self {
        self.updatable = false;
        self
    }
}

/// Owning side of a many-to-one association.
#[derive(Debug, Clone, Copy)]
pub struct AssociationDef {
    pub name: &'static str,
    /// Foreign key column on the owning table.
    pub column: &'static str,
    pub target: fn() -> &'static EntityMeta,
}

/// Static description of one entity type.
#[derive(Debug)]
pub struct EntityMeta {
    pub name: &'static str,
    pub table: &'static str,
    pub id: FieldDef,
    pub fields: &'static [FieldDef],
    pub associations: &'static [AssociationDef],
}

impl EntityMeta {
    /// Looks up a field (the identity included) by its attribute name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        if self.id.name == name {
            return Some(&self.id);
        }
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn association(&self, name: &str) -> Option<&AssociationDef> {
        self.associations
            .iter()
            .find(|association| association.name == name)
    }

    /// Returns whether a column may appear in an UPDATE statement.
    pub fn is_updatable_column(&self, column: &str) -> bool {
        if column == self.id.column {
            return false;
        }
        if let Some(field) = self.fields.iter().find(|field| field.column == column) {
            return field.updatable;
        }
        self.associations
            .iter()
            .any(|association| association.column == column)
    }

    /// All stored columns, identity first.
    pub fn columns(&self) -> Vec<&'static str> {
        let mut columns = Vec::with_capacity(1 + self.fields.len() + self.associations.len());
        columns.push(self.id.column);
        columns.extend(self.fields.iter().map(|field| field.column));
        columns.extend(self.associations.iter().map(|association| association.column));
        columns
    }
}

/// Metadata is static; two descriptions are equal only if they are the same.
impl PartialEq for EntityMeta {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for EntityMeta {}

/// Typed path to one field of entity `E`.
pub struct Attr<E> {
    name: &'static str,
    column: &'static str,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Attr<E> {
    pub const fn new(name: &'static str, column: &'static str) -> Self {
        Self {
            name,
            column,
            _entity: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn column(&self) -> &'static str {
        self.column
    }
}

impl<E> Clone for Attr<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for Attr<E> {}

impl<E> std::fmt::Debug for Attr<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attr")
            .field("name", &self.name)
            .field("column", &self.column)
            .finish()
    }
}

/// Typed path from entity `E` through one association to a field of `T`.
pub struct JoinAttr<E, T> {
    association: &'static str,
    local_column: &'static str,
    target: Attr<T>,
    _owner: PhantomData<fn() -> E>,
}

impl<E, T> JoinAttr<E, T> {
    pub const fn new(association: &'static str, local_column: &'static str, target: Attr<T>) -> Self {
        Self {
            association,
            local_column,
            target,
            _owner: PhantomData,
        }
    }

    pub fn association(&self) -> &'static str {
        self.association
    }

    pub fn local_column(&self) -> &'static str {
        self.local_column
    }

    pub fn target(&self) -> Attr<T> {
        self.target
    }
}

impl<E, T> Clone for JoinAttr<E, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E, T> Copy for JoinAttr<E, T> {}

/// Row accessor that resolves column names under an optional join prefix.
///
/// Root columns are selected under their own names; columns of a fetched
/// association are selected as `<association>__<column>`.
pub struct EntityRow<'r, 'stmt> {
    row: &'r Row<'stmt>,
    prefix: String,
    fetched: &'r [&'static str],
}

impl<'r, 'stmt> EntityRow<'r, 'stmt> {
    pub fn new(row: &'r Row<'stmt>, fetched: &'r [&'static str]) -> Self {
        Self {
            row,
            prefix: String::new(),
            fetched,
        }
    }

    pub fn get<T: FromSql>(&self, column: &str) -> rusqlite::Result<T> {
        if self.prefix.is_empty() {
            self.row.get(column)
        } else {
            self.row.get(format!("{}{column}", self.prefix).as_str())
        }
    }

    /// Returns whether `association` was loaded in the same statement.
    pub fn is_fetched(&self, association: &str) -> bool {
        self.fetched.contains(&association)
    }

    /// Accessor for the columns of a fetched association.
    pub fn nested(&self, association: &str) -> EntityRow<'r, 'stmt> {
        EntityRow {
            row: self.row,
            prefix: format!("{}{association}__", self.prefix),
            fetched: &[],
        }
    }
}

/// Required-field and consistency failures detected before persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    BlankField {
        entity: &'static str,
        field: &'static str,
    },
    NegativeValue {
        entity: &'static str,
        field: &'static str,
        value: i64,
    },
    /// The association points at an entity that has not been saved yet.
    TransientAssociation {
        entity: &'static str,
        association: &'static str,
    },
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlankField { entity, field } => {
                write!(f, "{entity}.{field} must not be blank")
            }
            Self::NegativeValue {
                entity,
                field,
                value,
            } => write!(f, "{entity}.{field} must be >= 0, got {value}"),
            Self::TransientAssociation {
                entity,
                association,
            } => write!(
                f,
                "{entity}.{association} references an entity that has not been saved"
            ),
        }
    }
}

impl Error for ValidationError {}

/// Persistable record with a stable identity once saved.
pub trait Entity: Clone + Sized {
    fn meta() -> &'static EntityMeta;

    fn id(&self) -> Option<EntityId>;

    /// Records the identity assigned by storage. Called once, on insert.
    fn assign_id(&mut self, id: EntityId);

    fn validate(&self) -> Result<(), ValidationError>;

    /// Column values to write, identity excluded.
    fn write_values(&self) -> Vec<(&'static str, Value)>;

    fn read(row: &EntityRow<'_, '_>) -> RepoResult<Self>;

    fn audit_mut(&mut self) -> Option<&mut AuditMetadata> {
        None
    }

    fn is_persistent(&self) -> bool {
        self.id().is_some()
    }
}
