//! Requirement → pull request automation.
//!
//! A requirement (YAML) names a repository, a build command, and a change
//! description. The pipeline clones the repository, asks an agent for a plan
//! and file edits, applies them, builds and tests in a container, pushes a
//! feature branch, and optionally opens a pull request.
//!
//! - **[`core`]**: Pure types and rules (requirement model, edit sanitation,
//!   path translation, stage slot table). No I/O.
//! - **[`io`]**: Side effects (git, docker, GitHub, agent process, files).
//! - [`runtime`], [`invoker`], [`stages`], [`pipeline`]: wiring a run
//!   together, tracked by [`observability`].

pub mod core;
pub mod exit_codes;
pub mod invoker;
pub mod io;
pub mod logging;
pub mod observability;
pub mod pipeline;
pub mod runtime;
pub mod stages;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
