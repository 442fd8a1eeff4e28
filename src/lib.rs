//! vitest-explorer - keep an editor test explorer in sync with a vitest
//! process.
//!
//! The [`tree::TestTree`] mirrors folders, files, suites and tests reported by
//! the runner. One [`runner::TestRunner`] per workspace folder turns run
//! requests into commands for the test process and maps the events it emits
//! back onto the tree and onto run updates.

pub mod api;
pub mod config;
pub mod coverage;
pub mod error;
pub mod logging;
pub mod message;
pub mod node;
pub mod protocol;
pub mod runner;
pub mod task;
pub mod tree;
pub mod watch;
pub mod workspace;
