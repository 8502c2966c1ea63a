//! Deferred loading state for associations.
//!
//! # Invariants
//! - The related identity is always available without a fetch.
//! - `get_or_load` fetches at most once; the value then stays `Loaded`.

use crate::model::entity::{Entity, EntityId};
use crate::repo::{RepoError, RepoResult};
use serde::{Deserialize, Serialize};

/// Anything able to fetch an entity by identity.
pub trait Loader<T> {
    fn load(&self, id: EntityId) -> RepoResult<Option<T>>;
}

/// Loading state of a many-to-one association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Lazy<T> {
    /// Only the foreign key is known.
    NotLoaded(EntityId),
    Loaded(T),
}

impl<T: Entity> Lazy<T> {
    /// Identity of the related entity; `None` only for an unsaved target.
    pub fn id(&self) -> Option<EntityId> {
        match self {
            Self::NotLoaded(id) => Some(*id),
            Self::Loaded(value) => value.id(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    /// Returns the related entity only if it is already loaded.
    pub fn get(&self) -> Option<&T> {
        match self {
            Self::Loaded(value) => Some(value),
            Self::NotLoaded(_) => None,
        }
    }

    /// Returns the related entity, fetching it through `loader` on first
    /// access.
    ///
    /// # Errors
    /// - `StaleEntity` when the referenced row no longer exists.
    pub fn get_or_load<L: Loader<T>>(&mut self, loader: &L) -> RepoResult<&T> {
        if let Self::NotLoaded(id) = *self {
            let value = loader.load(id)?.ok_or(RepoError::StaleEntity {
                entity: T::meta().name,
                id: Some(id),
            })?;
            *self = Self::Loaded(value);
        }

        match self {
            Self::Loaded(value) => Ok(value),
            Self::NotLoaded(id) => Err(RepoError::StaleEntity {
                entity: T::meta().name,
                id: Some(*id),
            }),
        }
    }
}
