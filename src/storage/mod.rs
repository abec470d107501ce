//! Persistence layer.
//!
//! Saves and loads the engine's adaptive state and book to/from a JSON file.
//! Decision trails go to a separate JSON-lines log (see [`trail`]).

pub mod trail;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::engine::accountant::Book;
use crate::engine::state::EngineSnapshot;

/// Default state file path.
pub const DEFAULT_STATE_FILE: &str = "engine_state.json";

/// Everything that survives a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub snapshot: EngineSnapshot,
    pub book: Book,
    pub saved_at: DateTime<Utc>,
}

impl PersistedState {
    pub fn new(snapshot: EngineSnapshot, book: Book) -> Self {
        Self {
            snapshot,
            book,
            saved_at: Utc::now(),
        }
    }
}

/// Save engine state to a JSON file. Writes a sibling temp file first and
/// renames it over the target.
pub fn save_state(state: &PersistedState, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    let json = serde_json::to_string_pretty(state).context("Failed to serialise engine state")?;

    let tmp = format!("{path}.tmp");
    std::fs::write(&tmp, &json).context(format!("Failed to write state to {tmp}"))?;
    std::fs::rename(&tmp, path).context(format!("Failed to move state into {path}"))?;

    debug!(
        path,
        version = state.snapshot.version,
        bankroll = %state.book.bankroll,
        "State saved"
    );
    Ok(())
}

/// Load engine state from a JSON file.
/// Returns None if the file doesn't exist (fresh start).
pub fn load_state(path: Option<&str>) -> Result<Option<PersistedState>> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);

    if !Path::new(path).exists() {
        info!(path, "No saved state found, starting fresh");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path).context(format!("Failed to read state from {path}"))?;

    let state: PersistedState =
        serde_json::from_str(&json).context(format!("Failed to parse state from {path}"))?;

    info!(
        path,
        version = state.snapshot.version,
        threshold = format!("{:.4}", state.snapshot.threshold()),
        sources = state.snapshot.weights.len(),
        bankroll = %state.book.bankroll,
        "State loaded from disk"
    );

    Ok(Some(state))
}

/// Delete the state file (for testing or reset).
pub fn delete_state(path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    if Path::new(path).exists() {
        std::fs::remove_file(path).context(format!("Failed to delete state file {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::FeedbackState;
    use crate::strategy::controller::ControllerConfig;
    use crate::strategy::weights::WeightConfig;
    use crate::types::{Pick, StakeInstruction};
    use rust_decimal_macros::dec;

    fn temp_path() -> String {
        let mut p = std::env::temp_dir();
        p.push(format!("engine_test_state_{}.json", uuid::Uuid::new_v4()));
        p.to_string_lossy().to_string()
    }

    fn make_state() -> PersistedState {
        let feedback = FeedbackState::new(&WeightConfig::default(), ControllerConfig::default(), 0.55);
        PersistedState::new(feedback.snapshot(), Book::new(dec!(1000)))
    }

    #[test]
    fn test_save_and_load() {
        let path = temp_path();
        let state = make_state();
        save_state(&state, Some(&path)).unwrap();

        let loaded = load_state(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded.book.bankroll, dec!(1000));
        assert_eq!(loaded.snapshot, state.snapshot);

        delete_state(Some(&path)).unwrap();
    }

    #[test]
    fn test_load_nonexistent() {
        let path = "/tmp/engine_nonexistent_state_12345.json";
        let loaded = load_state(Some(path)).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_save_preserves_open_exposure() {
        let path = temp_path();
        let mut state = make_state();
        state.book.open(StakeInstruction {
            round_id: "r1".into(),
            market: Pick::Odd.market(),
            pick: Pick::Odd,
            stake_amount: dec!(5),
            kelly_fraction: 0.05,
            win_probability: 0.602,
            expected_value: dec!(0.1),
            payout_multiple: 1.98,
            risk_check_results: Vec::new(),
        });

        save_state(&state, Some(&path)).unwrap();
        let loaded = load_state(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded.book.open_exposure(), dec!(5));
        assert_eq!(loaded.book.ledger.orders_in_round("r1"), 1);

        delete_state(Some(&path)).unwrap();
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let path = temp_path();
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_state(Some(&path)).is_err());
        delete_state(Some(&path)).unwrap();
    }

    #[test]
    fn test_delete_nonexistent_ok() {
        let result = delete_state(Some("/tmp/engine_does_not_exist_xyz.json"));
        assert!(result.is_ok());
    }
}
