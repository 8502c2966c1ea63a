use datarepo_core::db::open_db_in_memory;
use datarepo_core::{
    FieldUpdate, Member, MemberRepository, Predicate, RepoError, Sort, SqliteRepository,
};

fn ages(members: &MemberRepository<'_>) -> Vec<i64> {
    members
        .find_all_sorted(&Sort::asc(Member::ID))
        .unwrap()
        .into_iter()
        .map(|member| member.age)
        .collect()
}

#[test]
fn bulk_age_plus_updates_matching_rows_and_clears_session() {
    let conn = open_db_in_memory().unwrap();
    let members = MemberRepository::try_new(&conn).unwrap();
    for (index, age) in [10, 19, 20, 21, 40].into_iter().enumerate() {
        let mut member = Member::with_age(format!("member{}", index + 1), age);
        members.save(&mut member).unwrap();
    }
    assert_eq!(members.cached_len(), 5);

    let affected = members.bulk_age_plus(20).unwrap();

    assert_eq!(affected, 3);
    assert_eq!(members.cached_len(), 0);
    assert_eq!(ages(&members), [10, 19, 21, 22, 41]);

    let member5 = members
        .find_member_by_username("member5")
        .unwrap()
        .unwrap();
    assert_eq!(member5.age, 41);
}

#[test]
fn bulk_update_with_no_match_affects_nothing() {
    let conn = open_db_in_memory().unwrap();
    let members = MemberRepository::try_new(&conn).unwrap();
    let mut member = Member::with_age("member1", 10);
    members.save(&mut member).unwrap();

    assert_eq!(members.bulk_age_plus(100).unwrap(), 0);
    assert_eq!(ages(&members), [10]);
}

#[test]
fn predicate_bulk_update_sets_values() {
    let conn = open_db_in_memory().unwrap();
    let members = SqliteRepository::<Member>::try_new(&conn).unwrap();
    for name in ["a", "b", "c"] {
        let mut member = Member::with_age(name, 1);
        members.save(&mut member).unwrap();
    }

    let affected = members
        .bulk_update_where(
            &Predicate::is_in(Member::USERNAME, ["a", "c"]),
            &[FieldUpdate::set(Member::AGE, 7)],
        )
        .unwrap();

    assert_eq!(affected, 2);
    assert_eq!(members.count_matching(&Predicate::eq(Member::AGE, 7)).unwrap(), 2);
}

#[test]
fn identity_and_creation_fields_cannot_be_bulk_updated() {
    let conn = open_db_in_memory().unwrap();
    let members = SqliteRepository::<Member>::try_new(&conn).unwrap();

    let err = members
        .bulk_update_where(&Predicate::always(), &[FieldUpdate::set(Member::ID, 1)])
        .unwrap_err();
    assert!(matches!(err, RepoError::QueryArgument(_)));

    let err = members
        .bulk_update_where(
            &Predicate::always(),
            &[FieldUpdate::set(Member::CREATED_AT, 0)],
        )
        .unwrap_err();
    assert!(matches!(err, RepoError::QueryArgument(_)));

    let err = members.bulk_update_where(&Predicate::always(), &[]).unwrap_err();
    assert!(matches!(err, RepoError::QueryArgument(_)));
}
