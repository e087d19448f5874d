//! Build version plumbing, standing in for the teacher's
//! `project_git_version!`/`project_build_tag!` macros (only available inside
//! its own monorepo).

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn print_version() {
    println!("ics version {VERSION}");
}
