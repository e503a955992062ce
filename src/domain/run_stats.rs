//! Fixed-shape run statistics.
//!
//! `RunStats` is what a run accumulates and what gets written to the run row
//! and the checkpoint. `UnitTally` is what one client's unit of work produces.

use serde::{Deserialize, Serialize};

/// Accumulated statistics of one collection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Valid phone records seen, duplicates included
    pub total_phone_observations: u64,

    /// Canonical phones that did not exist anywhere in the store before
    pub new_phones: u64,

    /// Clients whose processing failed
    pub error_count: u64,

    /// Projects upserted
    pub projects_count: u64,
}

impl RunStats {
    /// Adds one completed unit of work.
    pub fn merge_unit(&mut self, tally: &UnitTally) {
        self.total_phone_observations += tally.phones;
        self.new_phones += tally.new_phones;
        self.projects_count += tally.projects;
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
    }
}

/// Per-client result of a unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTally {
    pub phones: u64,
    pub new_phones: u64,
    pub projects: u64,
}
