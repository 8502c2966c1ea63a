use datarepo_core::db::open_db_in_memory;
use datarepo_core::repo::member_spec;
use datarepo_core::{Member, MemberRepository, Predicate, RepoError, Team, TeamRepository};
use rusqlite::Connection;

fn seed(conn: &Connection) {
    let teams = TeamRepository::try_new(conn).unwrap();
    let members = MemberRepository::try_new(conn).unwrap();

    let mut team_a = Team::new("teamA");
    let mut team_b = Team::new("teamB");
    teams.save(&mut team_a).unwrap();
    teams.save(&mut team_b).unwrap();

    for (name, age, team) in [
        ("m1", 0, &team_a),
        ("m2", 0, &team_a),
        ("m3", 20, &team_b),
    ] {
        let mut member = Member::with_team(name, age, team);
        members.save(&mut member).unwrap();
    }
    let mut loner = Member::with_age("m4", 30);
    members.save(&mut loner).unwrap();
}

#[test]
fn username_and_team_name_filter_together() {
    let conn = open_db_in_memory().unwrap();
    seed(&conn);
    let members = MemberRepository::try_new(&conn).unwrap();

    let spec = member_spec::username("m1").and(member_spec::team_name(Some("teamA")));
    let result = members.find_all_by_spec(&spec).unwrap();

    assert_eq!(result.len(), 1);
    assert_eq!(result[0].username, "m1");
}

#[test]
fn absent_team_name_does_not_filter() {
    let conn = open_db_in_memory().unwrap();
    seed(&conn);
    let members = MemberRepository::try_new(&conn).unwrap();

    let everyone = members
        .find_all_by_spec(&member_spec::team_name(None))
        .unwrap();
    assert_eq!(everyone.len(), 4);

    let blank = members
        .find_all_by_spec(&member_spec::team_name(Some("  ")))
        .unwrap();
    assert_eq!(blank.len(), 4);
}

#[test]
fn team_name_filter_excludes_members_without_team() {
    let conn = open_db_in_memory().unwrap();
    seed(&conn);
    let members = MemberRepository::try_new(&conn).unwrap();

    let team_a = members
        .find_all_by_spec(&member_spec::team_name(Some("teamA")))
        .unwrap();
    let names = team_a
        .iter()
        .map(|member| member.username.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, ["m1", "m2"]);
}

#[test]
fn predicates_count_and_find_one() {
    let conn = open_db_in_memory().unwrap();
    seed(&conn);
    let members = MemberRepository::try_new(&conn).unwrap();

    let adults = Predicate::ge(Member::AGE, 18);
    assert_eq!(members.count_matching(&adults).unwrap(), 2);

    let m3 = members
        .find_one_matching(&adults.clone().and(Predicate::lt(Member::AGE, 25)))
        .unwrap()
        .unwrap();
    assert_eq!(m3.username, "m3");

    let err = members.find_one_matching(&adults).unwrap_err();
    assert!(matches!(err, RepoError::NonUniqueResult { count: 2, .. }));
}

#[test]
fn null_and_membership_predicates() {
    let conn = open_db_in_memory().unwrap();
    seed(&conn);
    let members = MemberRepository::try_new(&conn).unwrap();

    let none = members
        .find_all_matching(&Predicate::is_in(Member::USERNAME, Vec::<String>::new()))
        .unwrap();
    assert!(none.is_empty());

    let some = members
        .find_all_matching(&Predicate::is_in(Member::USERNAME, ["m2", "m4"]))
        .unwrap();
    assert_eq!(some.len(), 2);

    let stamped = members
        .count_matching(&Predicate::is_not_null(Member::LAST_MODIFIED_AT))
        .unwrap();
    assert_eq!(stamped, 4);
    let unstamped = members
        .count_matching(&Predicate::is_null(Member::CREATED_AT))
        .unwrap();
    assert_eq!(unstamped, 0);
}

#[test]
fn combining_with_always_changes_nothing() {
    let conn = open_db_in_memory().unwrap();
    seed(&conn);
    let members = MemberRepository::try_new(&conn).unwrap();

    let plain = members
        .find_all_matching(&Predicate::le(Member::AGE, 0))
        .unwrap();
    let combined = members
        .find_all_matching(&Predicate::all([
            Predicate::always(),
            Predicate::le(Member::AGE, 0),
            Predicate::always(),
        ]))
        .unwrap();
    assert_eq!(plain, combined);
}
