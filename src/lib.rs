//! DataMaster Phone Collector
//!
//! Pulls clients, their projects and the phone numbers recorded on those
//! projects from the DataMaster API into a local SQLite database, with
//! deduplication by canonical E.164 form, a global request rate limit and
//! checkpoints that let an interrupted run continue.

// Module declarations
pub mod cli;
pub mod collector;
pub mod domain;
pub mod infrastructure;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use cli::{Cli, run};
