//! Domain entities
//!
//! Contains the records pulled from the remote source and the rows the
//! collector persists.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A client account as returned by the remote source. Identity is `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    pub display_name: String,
}

/// A project owned by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub client_id: i64,
}

/// One phone entry on a page, exactly as received. Never persisted directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPhoneRecord {
    pub raw_text: String,
    pub source_timestamp: String,
}

impl RawPhoneRecord {
    pub fn new(raw_text: impl Into<String>, source_timestamp: impl Into<String>) -> Self {
        Self {
            raw_text: raw_text.into(),
            source_timestamp: source_timestamp.into(),
        }
    }
}

/// A stored, deduplicated phone number. `e164` is unique across the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalPhone {
    pub id: i64,
    pub e164: String,
    pub original_text: String,
    pub first_seen_run_id: i64,
}

/// Insert request for a phone that was not found in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPhone<'a> {
    pub e164: &'a str,
    pub original_text: &'a str,
    pub run_id: i64,
}

/// Result of `insert_phone`.
///
/// `created` is false when another writer inserted the same `e164` first;
/// `id` then points at the existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhoneInsert {
    pub id: i64,
    pub created: bool,
}

/// Association between a project and a phone, tagged with the observing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectPhoneLink {
    pub project_id: i64,
    pub phone_id: i64,
    pub run_id: i64,
    pub api_created_at: String,
}

/// Lifecycle status of a collection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Stopped,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    /// Whether this status ends a `collect` invocation.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Whether a checkpoint pointing at a run in this status may be resumed.
    #[must_use]
    pub const fn is_resumable(self) -> bool {
        !matches!(self, Self::Completed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow::anyhow!("unknown run status: {other}")),
        }
    }
}

/// A persisted run row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_phone_observations: u64,
    pub new_phones: u64,
    pub error_count: u64,
}

/// Aggregate counts across the whole store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSummary {
    pub clients: u64,
    pub projects: u64,
    pub phones: u64,
    pub links: u64,
    pub last_run: Option<RunRecord>,
}
