use datarepo_core::db::open_db_in_memory;
use datarepo_core::{Lazy, Member, MemberRepository, Predicate, RepoError, Team, TeamRepository};
use rusqlite::Connection;

fn seed(conn: &Connection) -> (Team, Team) {
    let teams = TeamRepository::try_new(conn).unwrap();
    let members = MemberRepository::try_new(conn).unwrap();

    let mut team_a = Team::new("teamA");
    let mut team_b = Team::new("teamB");
    teams.save(&mut team_a).unwrap();
    teams.save(&mut team_b).unwrap();

    let mut member1 = Member::with_team("member1", 10, &team_a);
    let mut member2 = Member::with_team("member2", 10, &team_b);
    members.save(&mut member1).unwrap();
    members.save(&mut member2).unwrap();
    (team_a, team_b)
}

#[test]
fn plain_read_leaves_team_unloaded_until_accessed() {
    let conn = open_db_in_memory().unwrap();
    let (team_a, _) = seed(&conn);
    let members = MemberRepository::try_new(&conn).unwrap();
    let teams = TeamRepository::try_new(&conn).unwrap();

    let mut loaded = members.find_all().unwrap();
    let member1 = &mut loaded[0];
    assert!(!member1.team().unwrap().is_loaded());
    assert_eq!(member1.team_id(), team_a.id());

    let team = member1.team_mut().unwrap().get_or_load(&*teams).unwrap();
    assert_eq!(team.name, "teamA");
    assert!(member1.team().unwrap().is_loaded());
}

#[test]
fn fetch_join_loads_team_in_the_same_statement() {
    let conn = open_db_in_memory().unwrap();
    seed(&conn);
    let members = MemberRepository::try_new(&conn).unwrap();

    for loaded in [
        members.find_member_fetch_join().unwrap(),
        members.find_all_with_team().unwrap(),
        members.find_member_entity_graph().unwrap(),
    ] {
        assert_eq!(loaded.len(), 2);
        let names = loaded
            .iter()
            .map(|member| member.team().and_then(Lazy::get).map(|team| team.name.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(names, [Some("teamA"), Some("teamB")]);
    }
}

#[test]
fn fetch_join_keeps_members_without_team() {
    let conn = open_db_in_memory().unwrap();
    seed(&conn);
    let members = MemberRepository::try_new(&conn).unwrap();
    let mut loner = Member::with_age("loner", 40);
    members.save(&mut loner).unwrap();

    let loaded = members
        .find_all_fetching(&Predicate::eq(Member::USERNAME, "loner"), &["team"])
        .unwrap();
    assert_eq!(loaded.len(), 1);
    assert!(loaded[0].team().is_none());

    let err = members
        .find_all_fetching(&Predicate::always(), &["club"])
        .unwrap_err();
    assert!(matches!(err, RepoError::QueryArgument(_)));
}

#[test]
fn registered_fetch_query_loads_team() {
    let conn = open_db_in_memory().unwrap();
    seed(&conn);
    let members = MemberRepository::try_new(&conn).unwrap();

    let plain = members.find_list_by_username("member1").unwrap();
    assert!(!plain[0].team().unwrap().is_loaded());

    let graph = members.find_entity_graph_by_username("member1").unwrap();
    assert_eq!(graph.len(), 1);
    assert_eq!(
        graph[0].team().and_then(Lazy::get).map(|team| team.name.clone()),
        Some("teamA".to_string())
    );
}

#[test]
fn loading_a_deleted_team_reports_stale_entity() {
    let conn = open_db_in_memory().unwrap();
    let teams = TeamRepository::try_new(&conn).unwrap();
    let mut team = Team::new("gone");
    let team_id = teams.save(&mut team).unwrap();

    let mut dangling: Lazy<Team> = Lazy::NotLoaded(team_id);
    teams.delete(&team).unwrap();

    let reader = TeamRepository::try_new(&conn).unwrap();
    let err = dangling.get_or_load(&*reader).unwrap_err();
    assert!(matches!(
        err,
        RepoError::StaleEntity { entity: "Team", id: Some(id) } if id == team_id
    ));
    assert!(!dangling.is_loaded());
}

#[test]
fn read_only_reads_bypass_the_session() {
    let conn = open_db_in_memory().unwrap();
    seed(&conn);
    let members = MemberRepository::try_new(&conn).unwrap();

    let member = members
        .find_read_only_by_username("member1")
        .unwrap()
        .unwrap();
    assert_eq!(member.username, "member1");
    assert_eq!(members.cached_len(), 0);

    let managed = members.find_optional_by_username("member1").unwrap();
    assert!(managed.is_some());
    assert_eq!(members.cached_len(), 1);
}
