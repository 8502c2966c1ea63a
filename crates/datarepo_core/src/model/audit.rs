//! Auditing metadata and the collaborators that feed it.
//!
//! # Responsibility
//! - Hold created/modified timestamps and actors for auditable entities.
//! - Apply them through explicit pre-save hooks driven by an
//!   [`AuditContext`] (clock + current actor) supplied by the caller.
//!
//! # Invariants
//! - Creation fields are written once, on first persist.
//! - Modification fields are written on every save, first persist included.
//! - Reads never modify auditing fields.
//! - Timestamps are Unix epoch milliseconds.

use crate::model::entity::{EntityRow, FieldDef, FieldKind};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub const CREATED_AT: FieldDef =
    FieldDef::new("created_at", "created_at", FieldKind::Integer).insert_only();
pub const CREATED_BY: FieldDef =
    FieldDef::new("created_by", "created_by", FieldKind::Text).insert_only();
pub const LAST_MODIFIED_AT: FieldDef =
    FieldDef::new("last_modified_at", "last_modified_at", FieldKind::Integer);
pub const LAST_MODIFIED_BY: FieldDef =
    FieldDef::new("last_modified_by", "last_modified_by", FieldKind::Text);

/// Source of the current time for audit stamps.
pub trait Clock {
    fn now_millis(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

/// Manually driven clock, mostly for tests and replays.
#[derive(Debug, Default)]
pub struct FixedClock {
    now: AtomicI64,
}

impl FixedClock {
    pub fn new(now_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(now_millis),
        }
    }

    pub fn set(&self, now_millis: i64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Supplies the actor responsible for the current change.
pub trait AuditorAware {
    fn current_actor(&self) -> Option<String>;
}

/// No actor is known; actor columns stay null.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuditor;

impl AuditorAware for NoAuditor {
    fn current_actor(&self) -> Option<String> {
        None
    }
}

/// Always reports the same actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedAuditor(pub String);

impl FixedAuditor {
    pub fn new(actor: impl Into<String>) -> Self {
        Self(actor.into())
    }
}

impl AuditorAware for FixedAuditor {
    fn current_actor(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Clock and actor collaborators handed to a repository for one session.
#[derive(Clone)]
pub struct AuditContext {
    clock: Arc<dyn Clock + Send + Sync>,
    auditor: Arc<dyn AuditorAware + Send + Sync>,
}

impl AuditContext {
    pub fn new(
        clock: Arc<dyn Clock + Send + Sync>,
        auditor: Arc<dyn AuditorAware + Send + Sync>,
    ) -> Self {
        Self { clock, auditor }
    }

    /// Wall clock, no actor.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock), Arc::new(NoAuditor))
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    pub fn current_actor(&self) -> Option<String> {
        self.auditor.current_actor()
    }
}

impl Default for AuditContext {
    fn default() -> Self {
        Self::system()
    }
}

impl std::fmt::Debug for AuditContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditContext").finish_non_exhaustive()
    }
}

/// System-managed auditing columns embedded in auditable entities.
///
/// Fields are read-only to callers; only the save hooks write them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditMetadata {
    created_at: Option<i64>,
    created_by: Option<String>,
    last_modified_at: Option<i64>,
    last_modified_by: Option<String>,
}

impl AuditMetadata {
    pub fn created_at(&self) -> Option<i64> {
        self.created_at
    }

    pub fn created_by(&self) -> Option<&str> {
        self.created_by.as_deref()
    }

    pub fn last_modified_at(&self) -> Option<i64> {
        self.last_modified_at
    }

    pub fn last_modified_by(&self) -> Option<&str> {
        self.last_modified_by.as_deref()
    }

    /// Pre-insert hook.
    pub fn on_create(&mut self, ctx: &AuditContext) {
        let now = ctx.now_millis();
        let actor = ctx.current_actor();
        self.created_at = Some(now);
        self.created_by = actor.clone();
        self.last_modified_at = Some(now);
        self.last_modified_by = actor;
    }

    /// Pre-update hook. Creation fields are left untouched.
    pub fn on_update(&mut self, ctx: &AuditContext) {
        self.last_modified_at = Some(ctx.now_millis());
        self.last_modified_by = ctx.current_actor();
    }

    pub(crate) fn write_values(&self) -> [(&'static str, Value); 4] {
        [
            (CREATED_AT.column, Value::from(self.created_at)),
            (CREATED_BY.column, Value::from(self.created_by.clone())),
            (LAST_MODIFIED_AT.column, Value::from(self.last_modified_at)),
            (
                LAST_MODIFIED_BY.column,
                Value::from(self.last_modified_by.clone()),
            ),
        ]
    }

    pub(crate) fn read(row: &EntityRow<'_, '_>) -> rusqlite::Result<Self> {
        Ok(Self {
            created_at: row.get(CREATED_AT.column)?,
            created_by: row.get(CREATED_BY.column)?,
            last_modified_at: row.get(LAST_MODIFIED_AT.column)?,
            last_modified_by: row.get(LAST_MODIFIED_BY.column)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{AuditContext, AuditMetadata, FixedAuditor, FixedClock};
    use std::sync::Arc;

    #[test]
    fn update_keeps_creation_fields() {
        let clock = Arc::new(FixedClock::new(1_000));
        let ctx = AuditContext::new(clock.clone(), Arc::new(FixedAuditor::new("alice")));

        let mut audit = AuditMetadata::default();
        audit.on_create(&ctx);
        clock.advance(500);
        audit.on_update(&ctx);

        assert_eq!(audit.created_at(), Some(1_000));
        assert_eq!(audit.created_by(), Some("alice"));
        assert_eq!(audit.last_modified_at(), Some(1_500));
        assert_eq!(audit.last_modified_by(), Some("alice"));
    }
}
