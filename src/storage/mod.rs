//! Persistence layer.
//!
//! Saves and loads the participant table to/from a JSON file keyed by
//! lowercase address. Writes go to a sibling temp file which is then renamed
//! over the target, so a crash mid-write never leaves a truncated table.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::types::ParticipantBot;

/// Participant state keyed by normalised address.
pub type ParticipantTable = BTreeMap<String, ParticipantBot>;

fn temp_path_for(path: &str) -> PathBuf {
    let mut tmp = PathBuf::from(path).into_os_string();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Save the participant table atomically.
pub fn save_participants(table: &ParticipantTable, path: &str) -> Result<()> {
    let json = serde_json::to_string_pretty(table)
        .context("Failed to serialise participant table")?;

    let tmp = temp_path_for(path);
    std::fs::write(&tmp, &json)
        .with_context(|| format!("Failed to write participants to {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move participant table into {path}"))?;

    debug!(path, participants = table.len(), "Participants saved");
    Ok(())
}

/// Load the participant table.
/// Returns None if the file doesn't exist (fresh start).
pub fn load_participants(path: &str) -> Result<Option<ParticipantTable>> {
    if !Path::new(path).exists() {
        info!(path, "No saved participants found, starting fresh");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read participants from {path}"))?;

    let table: ParticipantTable = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse participants from {path}"))?;

    info!(
        path,
        participants = table.len(),
        active = table.values().filter(|b| b.active).count(),
        "Participants loaded from disk"
    );

    Ok(Some(table))
}

/// Delete the participant file (for testing or reset).
pub fn delete_participants(path: &str) -> Result<()> {
    if Path::new(path).exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to delete participant file {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
