//! SnapshotManager (C8, §4.8): one JSON file per symbol, written atomically
//! after every successful transition; recovered and validated at startup.
//!
//! Grounded on the same write-temp-then-rename idiom as `CoidManager`
//! (`coid.rs`), itself grounded on `core/coid.py`.

use crate::errors::SnapshotError;
use crate::types::{now_ms, CoinState, Phase};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const SNAPSHOT_VERSION: u32 = 1;

/// Restored state older than this is treated as stale and reset to IDLE
/// rather than resumed mid-trade against possibly-rotted context.
const MAX_RESTORABLE_AGE_MS: u64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    phase: Phase,
    timestamp: u64,
    state: CoinState,
}

pub struct SnapshotManager {
    dir: PathBuf,
}

impl SnapshotManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, symbol: &str) -> PathBuf {
        let safe = symbol.replace('/', "-");
        self.dir.join(format!("{safe}.json"))
    }

    /// Atomically persists `state`: write to `<sym>.json.tmp`, rename over
    /// `<sym>.json`.
    pub fn save_snapshot(&self, state: &CoinState) -> Result<(), SnapshotError> {
        fs::create_dir_all(&self.dir).map_err(|e| SnapshotError::Io {
            symbol: state.symbol.clone(),
            source: e,
        })?;
        let file = SnapshotFile {
            version: SNAPSHOT_VERSION,
            phase: state.phase,
            timestamp: now_ms(),
            state: state.clone(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(|e| SnapshotError::Serde {
            symbol: state.symbol.clone(),
            source: e,
        })?;
        let path = self.path_for(&state.symbol);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| SnapshotError::Io {
            symbol: state.symbol.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &path).map_err(|e| SnapshotError::Io {
            symbol: state.symbol.clone(),
            source: e,
        })?;
        Ok(())
    }

    /// Validates CoinState invariants on a restored snapshot. Rejects phase
    /// POSITION-family states with no amount, amount present in a phase
    /// that forbids it, or an entry older than `max_entry_age_ms`.
    fn validate(state: &CoinState, max_entry_age_ms: u64) -> Result<(), String> {
        if !state.invariant_amount_matches_phase() {
            return Err(format!(
                "amount {} inconsistent with phase {:?}",
                state.amount, state.phase
            ));
        }
        if state.phase.requires_position() && state.entry_ts > 0 {
            let age = now_ms().saturating_sub(state.entry_ts);
            if age > max_entry_age_ms {
                return Err(format!("entry_ts is {age}ms old, exceeds {max_entry_age_ms}ms"));
            }
        }
        Ok(())
    }

    /// Loads one symbol's snapshot, if present. A state that fails
    /// validation is reset to IDLE with zeroed position fields rather than
    /// rejected outright, so recovery always makes forward progress.
    pub fn restore_state(&self, symbol: &str) -> Result<Option<CoinState>, SnapshotError> {
        let path = self.path_for(symbol);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|e| SnapshotError::Io {
            symbol: symbol.to_string(),
            source: e,
        })?;
        let file: SnapshotFile = serde_json::from_str(&raw).map_err(|e| SnapshotError::Serde {
            symbol: symbol.to_string(),
            source: e,
        })?;

        let mut state = file.state;
        if let Err(reason) = Self::validate(&state, MAX_RESTORABLE_AGE_MS) {
            tracing::warn!(symbol, reason, "snapshot_validation_failed_resetting_to_idle");
            state.phase = Phase::Idle;
            state.clear_position();
        }
        Ok(Some(state))
    }

    /// Lists all snapshot files under the directory and attempts to restore
    /// each. Called once at startup (AS.8), before the tick loop begins.
    pub fn recover_all_states(&self) -> Result<Vec<CoinState>, SnapshotError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut states = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| SnapshotError::Io {
            symbol: "*".to_string(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| SnapshotError::Io {
                symbol: "*".to_string(),
                source: e,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(symbol) = symbol_from_path(&path) {
                if let Some(state) = self.restore_state(&symbol)? {
                    states.push(state);
                }
            }
        }
        Ok(states)
    }
}

fn symbol_from_path(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.replace('-', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    #[test]
    fn save_and_restore_round_trips() {
        let dir = tempdir().unwrap();
        let mgr = SnapshotManager::new(dir.path());
        let mut state = CoinState::new("BTC/USDT");
        state.phase = Phase::Position;
        state.amount = dec!(1);
        state.entry_price = dec!(100);
        state.entry_ts = now_ms();
        mgr.save_snapshot(&state).unwrap();

        let restored = mgr.restore_state("BTC/USDT").unwrap().unwrap();
        assert_eq!(restored.phase, Phase::Position);
        assert_eq!(restored.amount, dec!(1));
    }

    #[test]
    fn invalid_invariant_resets_to_idle() {
        let dir = tempdir().unwrap();
        let mgr = SnapshotManager::new(dir.path());
        let mut state = CoinState::new("BTC/USDT");
        state.phase = Phase::Position;
        state.amount = rust_decimal::Decimal::ZERO;
        mgr.save_snapshot(&state).unwrap();

        let restored = mgr.restore_state("BTC/USDT").unwrap().unwrap();
        assert_eq!(restored.phase, Phase::Idle);
    }

    #[test]
    fn recover_all_states_reads_every_snapshot() {
        let dir = tempdir().unwrap();
        let mgr = SnapshotManager::new(dir.path());
        mgr.save_snapshot(&CoinState::new("BTC/USDT")).unwrap();
        mgr.save_snapshot(&CoinState::new("ETH/USDT")).unwrap();
        let states = mgr.recover_all_states().unwrap();
        assert_eq!(states.len(), 2);
    }

    #[test]
    fn missing_snapshot_is_none() {
        let dir = tempdir().unwrap();
        let mgr = SnapshotManager::new(dir.path());
        assert!(mgr.restore_state("BTC/USDT").unwrap().is_none());
    }
}
