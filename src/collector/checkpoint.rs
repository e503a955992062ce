//! # Collection Checkpoint
//!
//! Durable progress record that lets an interrupted run continue where it
//! stopped. Stored as pretty JSON next to the database; written through a
//! temp file and a rename so a crash mid-write leaves the previous version.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::RunStats;

/// Everything needed to resume a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionCheckpoint {
    pub run_id: i64,
    pub saved_at: DateTime<Utc>,
    pub total_clients_in_scope: usize,
    pub processed_clients: usize,
    pub processed_client_ids: BTreeSet<i64>,
    pub stats: RunStats,
}

impl CollectionCheckpoint {
    pub fn new(
        run_id: i64,
        total_clients_in_scope: usize,
        processed_client_ids: impl IntoIterator<Item = i64>,
        stats: RunStats,
    ) -> Self {
        let processed_client_ids: BTreeSet<i64> = processed_client_ids.into_iter().collect();
        Self {
            run_id,
            saved_at: Utc::now(),
            total_clients_in_scope,
            processed_clients: processed_client_ids.len(),
            processed_client_ids,
            stats,
        }
    }

    #[must_use]
    pub fn is_processed(&self, client_id: i64) -> bool {
        self.processed_client_ids.contains(&client_id)
    }
}

/// File-backed checkpoint location.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the checkpoint. A missing file is `None`; so is a file that no
    /// longer parses, since starting fresh beats refusing to run.
    pub async fn load(&self) -> Option<CollectionCheckpoint> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read checkpoint {}: {}", self.path.display(), e);
                return None;
            }
        };

        match serde_json::from_str::<CollectionCheckpoint>(&content) {
            Ok(checkpoint) => {
                debug!(
                    "Loaded checkpoint for run {} ({} clients processed)",
                    checkpoint.run_id, checkpoint.processed_clients
                );
                Some(checkpoint)
            }
            Err(e) => {
                warn!("Ignoring unreadable checkpoint {}: {}", self.path.display(), e);
                None
            }
        }
    }

    pub async fn save(&self, checkpoint: &CollectionCheckpoint) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create checkpoint directory {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(checkpoint)
            .context("Failed to serialize checkpoint")?;

        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, json)
            .await
            .with_context(|| format!("Failed to write {}", temp_path.display()))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .with_context(|| format!("Failed to move checkpoint into {}", self.path.display()))?;

        debug!(
            "Checkpoint saved: run {} with {}/{} clients",
            checkpoint.run_id, checkpoint.processed_clients, checkpoint.total_clients_in_scope
        );
        Ok(())
    }

    /// Removes the checkpoint. Clearing an absent checkpoint is a no-op.
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Checkpoint cleared: {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }
}
