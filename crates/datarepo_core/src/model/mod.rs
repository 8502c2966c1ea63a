//! Entity model: metadata contracts, auditing, lazy associations and the
//! `Team`/`Member` entities.
//!
//! # Invariants
//! - Every entity describes itself through a static [`entity::EntityMeta`].
//! - Identity is assigned by storage and never changes afterwards.

pub mod audit;
pub mod entity;
pub mod lazy;
pub mod member;
pub mod team;
