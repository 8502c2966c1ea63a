//! Reusable member predicates.

use crate::model::member::Member;
use crate::query::predicate::Predicate;

/// Members of the team named `team_name`; no filter when blank or absent.
pub fn team_name(team_name: Option<&str>) -> Predicate<Member> {
    Predicate::join_eq_if_present(Member::TEAM_NAME, team_name)
}

pub fn username(username: &str) -> Predicate<Member> {
    Predicate::eq(Member::USERNAME, username)
}
