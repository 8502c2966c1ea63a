use datarepo_core::db::open_db_in_memory;
use datarepo_core::model::entity::{AssociationDef, EntityRow, FieldDef, FieldKind};
use datarepo_core::{
    AuditContext, Entity, EntityId, EntityMeta, FieldUpdate, FixedAuditor, FixedClock, LockMode,
    Member, MemberRepository, QueryArgs, QueryDefinitionError, QueryDescriptor, QueryKind,
    QueryRegistry, RepoError, RepoResult, SqliteRepository, Team, ValidationError,
};
use rusqlite::types::Value;
use std::sync::Arc;

/// Entity whose `team_name` field collides with the `team.name` join path.
#[derive(Debug, Clone)]
struct Player {
    id: Option<EntityId>,
}

fn team_target() -> &'static EntityMeta {
    Team::meta()
}

static PLAYER_META: EntityMeta = EntityMeta {
    name: "Player",
    table: "player",
    id: FieldDef::new("id", "player_id", FieldKind::Integer).insert_only(),
    fields: &[FieldDef::new("team_name", "team_name", FieldKind::Text)],
    associations: &[AssociationDef {
        name: "team",
        column: "team_id",
        target: team_target,
    }],
};

impl Entity for Player {
    fn meta() -> &'static EntityMeta {
        &PLAYER_META
    }

    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }

    fn write_values(&self) -> Vec<(&'static str, Value)> {
        Vec::new()
    }

    fn read(row: &EntityRow<'_, '_>) -> RepoResult<Self> {
        Ok(Self {
            id: Some(row.get("player_id")?),
        })
    }
}

fn build_member_queries(
    descriptors: Vec<QueryDescriptor<Member>>,
) -> Result<QueryRegistry<Member>, QueryDefinitionError> {
    let conn = open_db_in_memory().unwrap();
    QueryRegistry::build(&conn, descriptors)
}

fn seed(members: &MemberRepository<'_>, rows: &[(&str, i64)]) {
    for (name, age) in rows {
        let mut member = Member::with_age(*name, *age);
        members.save(&mut member).unwrap();
    }
}

#[test]
fn derived_finder_combines_equality_and_range() {
    let conn = open_db_in_memory().unwrap();
    let members = MemberRepository::try_new(&conn).unwrap();
    seed(&members, &[("AAA", 10), ("AAA", 20)]);

    let result = members
        .find_by_username_and_age_greater_than("AAA", 15)
        .unwrap();

    assert_eq!(result.len(), 1);
    assert_eq!(result[0].username, "AAA");
    assert_eq!(result[0].age, 20);
}

#[test]
fn declarative_queries_bind_named_parameters() {
    let conn = open_db_in_memory().unwrap();
    let members = MemberRepository::try_new(&conn).unwrap();
    seed(&members, &[("AAA", 10), ("BBB", 20)]);

    assert_eq!(members.find_by_username("AAA").unwrap().len(), 1);
    assert_eq!(members.find_user("AAA", 10).unwrap().len(), 1);
    assert!(members.find_user("AAA", 11).unwrap().is_empty());

    let both = members.find_by_names(&["AAA", "BBB"]).unwrap();
    assert_eq!(both.len(), 2);
    let none = members.find_by_names::<&str>(&[]).unwrap();
    assert!(none.is_empty());
}

#[test]
fn missing_named_argument_is_reported() {
    let conn = open_db_in_memory().unwrap();
    let members = MemberRepository::try_new(&conn).unwrap();

    let err = members
        .execute("find_user", &QueryArgs::new().bind("username", "AAA"))
        .unwrap_err();
    assert!(matches!(err, RepoError::QueryArgument(_)), "{err}");
}

#[test]
fn return_shapes_differ_only_in_cardinality() {
    let conn = open_db_in_memory().unwrap();
    let members = MemberRepository::try_new(&conn).unwrap();
    seed(&members, &[("AAA", 10), ("BBB", 20)]);

    assert_eq!(members.find_list_by_username("AAA").unwrap().len(), 1);
    assert!(members.find_list_by_username("nobody").unwrap().is_empty());
    assert!(members.find_member_by_username("nobody").unwrap().is_none());
    assert_eq!(
        members
            .find_optional_by_username("BBB")
            .unwrap()
            .map(|member| member.age),
        Some(20)
    );

    seed(&members, &[("AAA", 30)]);
    let err = members.find_member_by_username("AAA").unwrap_err();
    assert!(matches!(err, RepoError::NonUniqueResult { count: 2, .. }));
}

#[test]
fn count_and_native_queries() {
    let conn = open_db_in_memory().unwrap();
    let members = MemberRepository::try_new(&conn).unwrap();
    seed(&members, &[("AAA", 10), ("BBB", 20), ("CCC", 30)]);

    assert_eq!(members.count_by_age_greater_than_equal(20).unwrap(), 2);

    let native = members.find_by_native_query("BBB").unwrap().unwrap();
    assert_eq!(native.age, 20);
    assert!(members.find_by_native_query("ZZZ").unwrap().is_none());
}

#[test]
fn subject_words_share_one_resolved_plan() {
    let conn = open_db_in_memory().unwrap();
    let members = MemberRepository::try_new(&conn).unwrap();
    let registry = members.registry();

    let list = registry.plan("find_list_by_username").unwrap();
    let single = registry.plan("find_member_by_username").unwrap();
    let optional = registry.plan("find_optional_by_username").unwrap();
    assert!(Arc::ptr_eq(list, single));
    assert!(Arc::ptr_eq(list, optional));

    let read_only = registry.plan("find_read_only_by_username").unwrap();
    assert!(!Arc::ptr_eq(list, read_only));
    assert!(registry.distinct_plans() < registry.len());
}

#[test]
fn unknown_field_fails_at_registration() {
    let err = build_member_queries(vec![QueryDescriptor::derived("find_by_nickname")])
        .unwrap_err();
    assert!(matches!(
        err,
        QueryDefinitionError::UnknownField { entity: "Member", .. }
    ));

    let conn = open_db_in_memory().unwrap();
    let err = SqliteRepository::<Member>::try_new(&conn)
        .unwrap()
        .with_queries([QueryDescriptor::derived("find_by_usernme")])
        .unwrap_err();
    assert!(matches!(
        err,
        RepoError::QueryDefinition(QueryDefinitionError::UnknownField { .. })
    ));
}

fn audited_members<'c>(
    conn: &'c rusqlite::Connection,
    actor: &str,
) -> SqliteRepository<'c, Member> {
    let audit = AuditContext::new(
        Arc::new(FixedClock::new(1_000)),
        Arc::new(FixedAuditor::new(actor)),
    );
    SqliteRepository::<Member>::with_audit(conn, audit)
        .unwrap()
        .with_queries([
            QueryDescriptor::derived("find_by_created_by_and_age_greater_than"),
            QueryDescriptor::derived("find_by_last_modified_by_and_username"),
        ])
        .unwrap()
}

#[test]
fn clauses_on_fields_ending_in_by_keep_their_filter() {
    let conn = open_db_in_memory().unwrap();
    let alice = audited_members(&conn, "alice");
    let bob = audited_members(&conn, "bob");

    let mut young = Member::with_age("young", 10);
    let mut old = Member::with_age("old", 20);
    let mut other = Member::with_age("other", 30);
    alice.save(&mut young).unwrap();
    alice.save(&mut old).unwrap();
    bob.save(&mut other).unwrap();

    let created = alice
        .execute(
            "find_by_created_by_and_age_greater_than",
            &QueryArgs::new().arg("alice").arg(15),
        )
        .unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].username, "old");

    bob.save(&mut young).unwrap();
    let modified = bob
        .execute(
            "find_by_last_modified_by_and_username",
            &QueryArgs::new().arg("bob").arg("young"),
        )
        .unwrap();
    assert_eq!(modified.len(), 1);
    assert!(alice
        .execute(
            "find_by_last_modified_by_and_username",
            &QueryArgs::new().arg("alice").arg("young"),
        )
        .unwrap()
        .is_empty());
}

#[test]
fn clause_is_never_read_as_subject() {
    let err = build_member_queries(vec![QueryDescriptor::derived(
        "find_by_last_modified_by_username",
    )])
    .unwrap_err();
    assert!(matches!(
        err,
        QueryDefinitionError::UnknownField { ref path, .. } if path == "last_modified_by_username"
    ));
}

#[test]
fn derived_queries_reject_extra_arguments() {
    let conn = open_db_in_memory().unwrap();
    let members = SqliteRepository::<Member>::try_new(&conn)
        .unwrap()
        .with_queries([QueryDescriptor::derived("find_by_team_is_null")])
        .unwrap();
    let mut loner = Member::with_age("loner", 10);
    members.save(&mut loner).unwrap();

    assert_eq!(
        members
            .execute("find_by_team_is_null", &QueryArgs::new())
            .unwrap()
            .len(),
        1
    );
    let err = members
        .execute("find_by_team_is_null", &QueryArgs::new().arg("teamA"))
        .unwrap_err();
    assert!(matches!(err, RepoError::QueryArgument(_)), "{err}");
}

#[test]
fn malformed_names_and_clauses_are_rejected() {
    let err = build_member_queries(vec![QueryDescriptor::derived("load_by_username")])
        .unwrap_err();
    assert!(matches!(err, QueryDefinitionError::MalformedName { .. }));

    let err = build_member_queries(vec![QueryDescriptor::declarative(
        "find_odd",
        "username = :name and",
    )])
    .unwrap_err();
    assert!(matches!(err, QueryDefinitionError::MalformedClause { .. }));
}

#[test]
fn join_path_resolves_through_association() {
    let conn = open_db_in_memory().unwrap();
    let registry = QueryRegistry::<Member>::build(
        &conn,
        [
            QueryDescriptor::derived("find_by_team_name"),
            QueryDescriptor::declarative("find_in_team", "team.name = :name"),
        ],
    )
    .unwrap();
    assert_eq!(registry.len(), 2);

    let err = QueryRegistry::<Member>::build(
        &conn,
        [QueryDescriptor::declarative("find_in_club", "club.name = :name")],
    )
    .unwrap_err();
    assert!(matches!(err, QueryDefinitionError::UnknownAssociation { .. }));
}

#[test]
fn ambiguous_path_lists_every_reading() {
    let conn = open_db_in_memory().unwrap();
    let err = QueryRegistry::<Player>::build(&conn, [QueryDescriptor::derived("find_by_team_name")])
        .unwrap_err();

    match err {
        QueryDefinitionError::AmbiguousPath { readings, .. } => {
            assert_eq!(readings.len(), 2);
            assert!(readings.iter().any(|reading| reading.starts_with("team_name")));
            assert!(readings.iter().any(|reading| reading.starts_with("team.name")));
        }
        other => panic!("unexpected error: {other}"),
    }

    QueryRegistry::<Player>::build(
        &conn,
        [QueryDescriptor::declarative("find_by_joined_name", "team.name = :name")],
    )
    .unwrap();
}

#[test]
fn native_sql_is_checked_at_registration() {
    let err = build_member_queries(vec![QueryDescriptor::native(
        "find_broken",
        "SELECT * FROM membr WHERE username = ?",
    )])
    .unwrap_err();
    assert!(matches!(err, QueryDefinitionError::InvalidNative { .. }));

    let err = build_member_queries(vec![
        QueryDescriptor::native("find_locked_native", "SELECT * FROM member")
            .lock(LockMode::PessimisticWrite),
    ])
    .unwrap_err();
    assert!(matches!(err, QueryDefinitionError::InvalidModifier { .. }));
}

#[test]
fn duplicate_names_and_non_updatable_fields_are_rejected() {
    let err = build_member_queries(vec![
        QueryDescriptor::derived("find_by_username"),
        QueryDescriptor::declarative("find_by_username", "username = :username"),
    ])
    .unwrap_err();
    assert_eq!(
        err,
        QueryDefinitionError::DuplicateName("find_by_username".to_string())
    );

    let err = build_member_queries(vec![QueryDescriptor::declarative("reset_ids", "age > :age")
        .modifying(vec![FieldUpdate::set(Member::ID, 0)])])
    .unwrap_err();
    assert!(matches!(err, QueryDefinitionError::NotUpdatable { field: "id", .. }));
}

#[test]
fn registered_kinds_are_enforced_at_execution() {
    let conn = open_db_in_memory().unwrap();
    let members = MemberRepository::try_new(&conn).unwrap();

    assert_eq!(
        members.registry().plan("bulk_age_plus").unwrap().kind(),
        QueryKind::Update
    );
    let err = members
        .execute("bulk_age_plus", &QueryArgs::new().bind("age", 1))
        .unwrap_err();
    assert!(matches!(err, RepoError::QueryArgument(_)));

    let err = members.execute("find_nothing", &QueryArgs::new()).unwrap_err();
    assert!(matches!(err, RepoError::UnknownQuery(name) if name == "find_nothing"));
}
