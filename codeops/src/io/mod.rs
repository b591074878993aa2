//! Side-effecting collaborators: processes, git, Docker, GitHub, the agent.

pub mod apply;
pub mod config;
pub mod docker;
pub mod executor;
pub mod git;
pub mod github;
pub mod inventory;
pub mod loader;
pub mod process;
pub mod prompt;
pub mod schema;
pub mod search;
pub mod workspace;
