//! Domain module - Core collection entities and collaborator contracts
//!
//! This module contains the entities the collector moves around and the
//! traits the orchestrators depend on. Concrete implementations live in the
//! infrastructure layer.
//!
//! Modern Rust module organization (Rust 2018+ style):
//! - Each module is its own file in the domain/ directory
//! - Public exports are defined here for convenience

pub mod entities;
pub mod repositories;
pub mod run_stats;

// Re-export commonly used items for convenience
pub use entities::{
    CanonicalPhone, Client, NewPhone, PhoneInsert, Project, ProjectPhoneLink, RawPhoneRecord,
    RunRecord, RunStatus, StoreSummary,
};
pub use repositories::{CollectionStore, PhoneSource, StoreProvider};
pub use run_stats::{RunStats, UnitTally};
