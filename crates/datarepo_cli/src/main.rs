//! CLI smoke entry point.
//!
//! # Responsibility
//! - Verify `datarepo_core` linkage.
//! - Walk the member repository through one deterministic in-memory run.

use datarepo_core::{
    open_db_in_memory, Direction, Member, MemberRepository, PageRequest, RepoError, Sort, Team,
    TeamRepository,
};
use std::process::ExitCode;

fn main() -> ExitCode {
    println!("datarepo_core ping={}", datarepo_core::ping());
    println!("datarepo_core version={}", datarepo_core::core_version());

    match run_demo() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("demo failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run_demo() -> Result<(), RepoError> {
    let conn = open_db_in_memory()?;
    let teams = TeamRepository::try_new(&conn)?;
    let members = MemberRepository::try_new(&conn)?;

    let mut team = Team::new("teamA");
    teams.save(&mut team)?;
    for index in 1..=5 {
        let mut member = Member::with_team(format!("member{index}"), 10, &team);
        members.save(&mut member)?;
    }

    let request = PageRequest::of(0, 3)?.with_sort(Sort::by("username", Direction::Desc));
    let page = members.find_by_age(10, &request)?;
    println!(
        "page number={} size={} total_elements={} total_pages={} has_next={}",
        page.number(),
        page.number_of_elements(),
        page.total_elements(),
        page.total_pages(),
        page.has_next()
    );
    for member in page.content() {
        println!("  {} age={}", member.username, member.age);
    }

    let affected = members.bulk_age_plus(10)?;
    println!(
        "bulk_age_plus affected={affected} adults={}",
        members.count_by_age_greater_than_equal(11)?
    );
    Ok(())
}
