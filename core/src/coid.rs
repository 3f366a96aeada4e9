//! COIDManager (C2, §4.2): deterministic client-order-ID generation with
//! durable PENDING→TERMINAL state, reuse on retry.
//!
//! Grounded on `core/coid.py`'s `COIDManager`/`COIDEntry`: a single JSON KV
//! file under a manager-wide lock, written atomically (write-temp,
//! rename-over), with `next_client_order_id` as the only legal way to mint a
//! COID and reuse-on-retry keyed by `(decision_id, leg_idx, side)`.

use crate::errors::CoidError;
use crate::exchange::ExchangeWrapper;
use crate::types::{now_ms, Side};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoidStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    Unknown,
}

impl CoidStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CoidStatus::Filled | CoidStatus::Canceled | CoidStatus::Rejected | CoidStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoidEntry {
    pub coid: String,
    pub decision_id: String,
    pub leg_idx: u32,
    pub side: Side,
    pub symbol: String,
    pub status: CoidStatus,
    pub order_id: Option<String>,
    pub created_ts: u64,
    pub updated_ts: u64,
    pub attempt_count: u32,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CoidEntry {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Default, Serialize, Deserialize)]
struct Store {
    entries: HashMap<String, CoidEntry>,
}

/// Owns `client_order_id → COIDEntry`, backed by `state/coid_kv.json`.
///
/// The store is guarded by a single manager-wide lock (§5: "fine since
/// operations are O(1) and infrequent").
pub struct CoidManager {
    path: PathBuf,
    store: Mutex<Store>,
}

impl CoidManager {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, CoidError> {
        let path = path.into();
        let store = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                Store::default()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            Store::default()
        };
        Ok(Self {
            path,
            store: Mutex::new(store),
        })
    }

    fn persist(&self, store: &Store) -> Result<(), CoidError> {
        let tmp = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(store)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn find_pending(&self, store: &Store, decision_id: &str, leg_idx: u32, side: Side) -> Option<String> {
        store
            .entries
            .values()
            .find(|e| {
                e.decision_id == decision_id
                    && e.leg_idx == leg_idx
                    && e.side == side
                    && !e.is_terminal()
            })
            .map(|e| e.coid.clone())
    }

    /// The only legal way to obtain a COID (§4.2). Reuses a non-terminal
    /// match for `(decision_id, leg_idx, side)` unless `force_new`.
    pub fn next_client_order_id(
        &self,
        decision_id: &str,
        leg_idx: u32,
        side: Side,
        symbol: &str,
        force_new: bool,
    ) -> Result<String, CoidError> {
        let mut store = self.store.lock();

        if !force_new {
            if let Some(coid) = self.find_pending(&store, decision_id, leg_idx, side) {
                if let Some(entry) = store.entries.get_mut(&coid) {
                    entry.attempt_count += 1;
                    entry.updated_ts = now_ms();
                }
                self.persist(&store)?;
                return Ok(coid);
            }
        }

        let ts = now_ms();
        let coid = format!("{decision_id}_{leg_idx}_{side}_{ts}");
        let entry = CoidEntry {
            coid: coid.clone(),
            decision_id: decision_id.to_string(),
            leg_idx,
            side,
            symbol: symbol.to_string(),
            status: CoidStatus::Pending,
            order_id: None,
            created_ts: ts,
            updated_ts: ts,
            attempt_count: 1,
            metadata: HashMap::new(),
        };
        store.entries.insert(coid.clone(), entry);
        self.persist(&store)?;
        Ok(coid)
    }

    /// Updates the entry's status and persists. Idempotent for equal
    /// transitions; refuses to move a terminal entry further (I-2).
    pub fn update_status(
        &self,
        coid: &str,
        status: CoidStatus,
        order_id: Option<String>,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<(), CoidError> {
        let mut store = self.store.lock();
        let Some(entry) = store.entries.get_mut(coid) else {
            return Ok(());
        };
        if entry.is_terminal() && entry.status != status {
            return Err(CoidError::AlreadyTerminal(coid.to_string()));
        }
        entry.status = status;
        if order_id.is_some() {
            entry.order_id = order_id;
        }
        if let Some(meta) = metadata {
            entry.metadata.extend(meta);
        }
        entry.updated_ts = now_ms();
        self.persist(&store)
    }

    pub fn get(&self, coid: &str) -> Option<CoidEntry> {
        self.store.lock().entries.get(coid).cloned()
    }

    /// Queries the exchange for every PENDING entry; marks EXPIRED if no
    /// matching order is found. Must run once at startup (§4.2, AS.8) before
    /// accepting new intents.
    pub async fn reconcile_with_exchange(
        &self,
        exchange: &dyn ExchangeWrapper,
    ) -> Result<usize, CoidError> {
        let pending: Vec<CoidEntry> = {
            let store = self.store.lock();
            store
                .entries
                .values()
                .filter(|e| e.status == CoidStatus::Pending)
                .cloned()
                .collect()
        };

        let mut reconciled = 0;
        for entry in pending {
            let mapped = match &entry.order_id {
                Some(order_id) => match exchange.fetch_order(&entry.symbol, order_id).await {
                    Ok(status) => Some(map_exchange_status(status.status)),
                    Err(_) => None,
                },
                None => None,
            };
            let new_status = mapped.unwrap_or(CoidStatus::Expired);
            self.update_status(&entry.coid, new_status, None, None)?;
            reconciled += 1;
        }
        Ok(reconciled)
    }

    /// Deletes terminal entries older than `max_age_days`.
    pub fn cleanup_old_entries(&self, max_age_days: u64) -> Result<usize, CoidError> {
        let cutoff = now_ms().saturating_sub(max_age_days * 24 * 60 * 60 * 1000);
        let mut store = self.store.lock();
        let before = store.entries.len();
        store
            .entries
            .retain(|_, e| !(e.is_terminal() && e.updated_ts < cutoff));
        let removed = before - store.entries.len();
        if removed > 0 {
            self.persist(&store)?;
        }
        Ok(removed)
    }
}

fn map_exchange_status(status: crate::exchange::OrderStatus) -> CoidStatus {
    use crate::exchange::OrderStatus as ES;
    match status {
        ES::Open => CoidStatus::Pending,
        ES::Closed => CoidStatus::Filled,
        ES::Canceled => CoidStatus::Canceled,
        ES::Expired => CoidStatus::Expired,
        ES::Rejected => CoidStatus::Rejected,
    }
}
