use datarepo_core::db::{open_db, open_db_with, DbOptions};
use datarepo_core::{Member, MemberRepository, Predicate, RepoError};
use std::time::Duration;

fn short_wait() -> DbOptions {
    DbOptions {
        busy_timeout: Duration::from_millis(50),
    }
}

#[test]
fn locking_read_requires_a_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let conn = open_db(dir.path().join("lock.db")).unwrap();
    let members = MemberRepository::try_new(&conn).unwrap();
    let mut member = Member::with_age("member1", 10);
    members.save(&mut member).unwrap();

    let err = members.find_lock_by_username("member1").unwrap_err();
    assert!(matches!(err, RepoError::NoActiveTransaction));

    let err = members
        .find_all_locked(&Predicate::always())
        .unwrap_err();
    assert!(matches!(err, RepoError::NoActiveTransaction));
}

#[test]
fn competing_writer_times_out_while_lock_is_held() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lock.db");

    let holder_conn = open_db(&path).unwrap();
    let holder = MemberRepository::try_new(&holder_conn).unwrap();
    let mut member = Member::with_age("member1", 10);
    holder.save(&mut member).unwrap();

    let other_conn = open_db_with(&path, &short_wait()).unwrap();
    let other = MemberRepository::try_new(&other_conn).unwrap();

    let tx = holder_conn.unchecked_transaction().unwrap();
    let locked = holder.find_lock_by_username("member1").unwrap();
    assert_eq!(locked.len(), 1);
    assert_eq!(locked[0].username, "member1");

    let mut contender = Member::with_age("member2", 20);
    let err = other.save(&mut contender).unwrap_err();
    assert!(
        matches!(
            err,
            RepoError::LockTimeout {
                entity: Some("Member")
            }
        ),
        "{err}"
    );
    assert!(contender.id().is_none());

    tx.rollback().unwrap();
    other.save(&mut contender).unwrap();
    assert_eq!(other.count().unwrap(), 2);
}

#[test]
fn lock_is_released_on_commit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lock.db");

    let holder_conn = open_db(&path).unwrap();
    let holder = MemberRepository::try_new(&holder_conn).unwrap();
    let mut member = Member::with_age("member1", 10);
    holder.save(&mut member).unwrap();

    let other_conn = open_db_with(&path, &short_wait()).unwrap();
    let other = MemberRepository::try_new(&other_conn).unwrap();

    let tx = holder_conn.unchecked_transaction().unwrap();
    let mut locked = holder
        .find_all_locked(&Predicate::eq(Member::USERNAME, "member1"))
        .unwrap();
    locked[0].age = 11;
    holder.save(&mut locked[0]).unwrap();
    tx.commit().unwrap();

    let reloaded = other.find_by_id(member.id().unwrap()).unwrap().unwrap();
    assert_eq!(reloaded.age, 11);
}

#[test]
fn locked_queries_cannot_be_paged() {
    let dir = tempfile::tempdir().unwrap();
    let conn = open_db(dir.path().join("lock.db")).unwrap();
    let members = MemberRepository::try_new(&conn).unwrap();

    let err = members
        .execute_page(
            "find_lock_by_username",
            &datarepo_core::QueryArgs::new().arg("member1"),
            &datarepo_core::PageRequest::of(0, 10).unwrap(),
        )
        .unwrap_err();
    assert!(matches!(err, RepoError::QueryArgument(_)));
}
