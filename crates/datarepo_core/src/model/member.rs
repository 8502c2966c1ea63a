//! Member entity, the owning side of the member-to-team association.
//!
//! # Invariants
//! - `username` is never blank and `age` is never negative once persisted.
//! - A member may only reference a persistent team.
//! - `team` is `NotLoaded` after a plain read and `Loaded` after a
//!   fetch-join read or an explicit `get_or_load`.

use crate::model::audit::{
    AuditMetadata, CREATED_AT, CREATED_BY, LAST_MODIFIED_AT, LAST_MODIFIED_BY,
};
use crate::model::entity::{
    AssociationDef, Attr, Entity, EntityId, EntityMeta, EntityRow, FieldDef, FieldKind, JoinAttr,
    ValidationError,
};
use crate::model::lazy::Lazy;
use crate::model::team::{team_meta, Team};
use crate::repo::RepoResult;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

const TEAM_ASSOCIATION: &str = "team";
const TEAM_COLUMN: &str = "team_id";

static MEMBER_META: EntityMeta = EntityMeta {
    name: "Member",
    table: "member",
    id: FieldDef::new("id", "member_id", FieldKind::Integer).insert_only(),
    fields: &[
        FieldDef::new("username", "username", FieldKind::Text),
        FieldDef::new("age", "age", FieldKind::Integer),
        CREATED_AT,
        CREATED_BY,
        LAST_MODIFIED_AT,
        LAST_MODIFIED_BY,
    ],
    associations: &[AssociationDef {
        name: TEAM_ASSOCIATION,
        column: TEAM_COLUMN,
        target: team_meta,
    }],
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    id: Option<EntityId>,
    pub username: String,
    pub age: i64,
    team: Option<Lazy<Team>>,
    #[serde(default)]
    audit: AuditMetadata,
}

impl Member {
    pub const ID: Attr<Member> = Attr::new("id", "member_id");
    pub const USERNAME: Attr<Member> = Attr::new("username", "username");
    pub const AGE: Attr<Member> = Attr::new("age", "age");
    pub const CREATED_AT: Attr<Member> = Attr::new("created_at", "created_at");
    pub const LAST_MODIFIED_AT: Attr<Member> = Attr::new("last_modified_at", "last_modified_at");
    pub const TEAM_NAME: JoinAttr<Member, Team> =
        JoinAttr::new(TEAM_ASSOCIATION, TEAM_COLUMN, Team::NAME);

    pub fn new(username: impl Into<String>) -> Self {
        Self::with_age(username, 0)
    }

    pub fn with_age(username: impl Into<String>, age: i64) -> Self {
        Self {
            id: None,
            username: username.into(),
            age,
            team: None,
            audit: AuditMetadata::default(),
        }
    }

    pub fn with_team(username: impl Into<String>, age: i64, team: &Team) -> Self {
        let mut member = Self::with_age(username, age);
        member.change_team(team);
        member
    }

    pub fn id(&self) -> Option<EntityId> {
        self.id
    }

    pub fn team(&self) -> Option<&Lazy<Team>> {
        self.team.as_ref()
    }

    /// Mutable access, used to resolve the association on demand.
    pub fn team_mut(&mut self) -> Option<&mut Lazy<Team>> {
        self.team.as_mut()
    }

    /// Team identity without triggering a fetch.
    pub fn team_id(&self) -> Option<EntityId> {
        self.team.as_ref().and_then(Lazy::id)
    }

    pub fn change_team(&mut self, team: &Team) {
        self.team = Some(Lazy::Loaded(team.clone()));
    }

    pub fn leave_team(&mut self) {
        self.team = None;
    }

    pub fn audit(&self) -> &AuditMetadata {
        &self.audit
    }
}

/// Identity-based once both sides are persistent, reference-based before.
impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        match (self.id, other.id) {
            (Some(left), Some(right)) => left == right,
            _ => std::ptr::eq(self, other),
        }
    }
}

impl Entity for Member {
    fn meta() -> &'static EntityMeta {
        &MEMBER_META
    }

    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        debug_assert!(self.id.is_none(), "member identity is immutable");
        self.id = Some(id);
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.username.trim().is_empty() {
            return Err(ValidationError::BlankField {
                entity: MEMBER_META.name,
                field: "username",
            });
        }
        if self.age < 0 {
            return Err(ValidationError::NegativeValue {
                entity: MEMBER_META.name,
                field: "age",
                value: self.age,
            });
        }
        if let Some(team) = &self.team {
            if team.id().is_none() {
                return Err(ValidationError::TransientAssociation {
                    entity: MEMBER_META.name,
                    association: TEAM_ASSOCIATION,
                });
            }
        }
        Ok(())
    }

    fn write_values(&self) -> Vec<(&'static str, Value)> {
        let mut values = vec![
            ("username", Value::Text(self.username.clone())),
            ("age", Value::Integer(self.age)),
            (TEAM_COLUMN, Value::from(self.team_id())),
        ];
        values.extend(self.audit.write_values());
        values
    }

    fn read(row: &EntityRow<'_, '_>) -> RepoResult<Self> {
        let team_id: Option<EntityId> = row.get(TEAM_COLUMN)?;
        let team = match team_id {
            Some(_) if row.is_fetched(TEAM_ASSOCIATION) => {
                Some(Lazy::Loaded(Team::read(&row.nested(TEAM_ASSOCIATION))?))
            }
            Some(id) => Some(Lazy::NotLoaded(id)),
            None => None,
        };

        Ok(Self {
            id: Some(row.get(MEMBER_META.id.column)?),
            username: row.get("username")?,
            age: row.get("age")?,
            team,
            audit: AuditMetadata::read(row)?,
        })
    }

    fn audit_mut(&mut self) -> Option<&mut AuditMetadata> {
        Some(&mut self.audit)
    }
}
