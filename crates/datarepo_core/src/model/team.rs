//! Team entity.

use crate::model::audit::{
    AuditMetadata, CREATED_AT, CREATED_BY, LAST_MODIFIED_AT, LAST_MODIFIED_BY,
};
use crate::model::entity::{
    Attr, Entity, EntityId, EntityMeta, EntityRow, FieldDef, FieldKind, ValidationError,
};
use crate::repo::RepoResult;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

static TEAM_META: EntityMeta = EntityMeta {
    name: "Team",
    table: "team",
    id: FieldDef::new("id", "team_id", FieldKind::Integer).insert_only(),
    fields: &[
        FieldDef::new("name", "name", FieldKind::Text),
        CREATED_AT,
        CREATED_BY,
        LAST_MODIFIED_AT,
        LAST_MODIFIED_BY,
    ],
    associations: &[],
};

pub(crate) fn team_meta() -> &'static EntityMeta {
    &TEAM_META
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    id: Option<EntityId>,
    pub name: String,
    #[serde(default)]
    audit: AuditMetadata,
}

impl Team {
    pub const ID: Attr<Team> = Attr::new("id", "team_id");
    pub const NAME: Attr<Team> = Attr::new("name", "name");

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            audit: AuditMetadata::default(),
        }
    }

    pub fn id(&self) -> Option<EntityId> {
        self.id
    }

    pub fn audit(&self) -> &AuditMetadata {
        &self.audit
    }
}

/// Identity-based once both sides are persistent, reference-based before.
impl PartialEq for Team {
    fn eq(&self, other: &Self) -> bool {
        match (self.id, other.id) {
            (Some(left), Some(right)) => left == right,
            _ => std::ptr::eq(self, other),
        }
    }
}

impl Entity for Team {
    fn meta() -> &'static EntityMeta {
        &TEAM_META
    }

    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        debug_assert!(self.id.is_none(), "team identity is immutable");
        self.id = Some(id);
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::BlankField {
                entity: TEAM_META.name,
                field: "name",
            });
        }
        Ok(())
    }

    fn write_values(&self) -> Vec<(&'static str, Value)> {
        let mut values = vec![("name", Value::Text(self.name.clone()))];
        values.extend(self.audit.write_values());
        values
    }

    fn read(row: &EntityRow<'_, '_>) -> RepoResult<Self> {
        Ok(Self {
            id: Some(row.get(TEAM_META.id.column)?),
            name: row.get("name")?,
            audit: AuditMetadata::read(row)?,
        })
    }

    fn audit_mut(&mut self) -> Option<&mut AuditMetadata> {
        Some(&mut self.audit)
    }
}
