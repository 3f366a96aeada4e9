//! Ledger (C9, §4.9): per-trade three-entry double-entry journal.
//!
//! Grounded on the teacher's append-only `AsyncJournal` writer-thread
//! pattern (`execution/journal.rs`), generalized from a single JSON-lines
//! stream of order lifecycle events to a balanced debit/credit ledger with
//! secondary indexes, as the spec requires.

use crate::errors::LedgerError;
use crate::types::{now_ms, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

const BALANCE_TOLERANCE: &str = "0.000001";

fn tolerance() -> Decimal {
    BALANCE_TOLERANCE.parse().expect("valid decimal literal")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub transaction_id: String,
    pub account: String,
    pub debit: Decimal,
    pub credit: Decimal,
    pub balance_after: Decimal,
    pub timestamp: u64,
}

/// A balanced group of entries for one trade (§3: buy debits asset+fee,
/// credits cash; sell debits cash, credits asset+fee).
pub struct Transaction {
    pub transaction_id: String,
    pub entries: Vec<(String, Decimal, Decimal)>, // (account, debit, credit)
}

impl Transaction {
    pub fn for_trade(
        transaction_id: impl Into<String>,
        symbol: &str,
        side: Side,
        notional: Decimal,
        fee: Decimal,
    ) -> Self {
        let asset_account = format!("asset:{symbol}");
        let cash_account = "cash:USDT".to_string();
        let fee_account = "expense:fees".to_string();

        let entries = match side {
            Side::Buy => vec![
                (asset_account, notional, Decimal::ZERO),
                (fee_account, fee, Decimal::ZERO),
                (cash_account, Decimal::ZERO, notional + fee),
            ],
            Side::Sell => vec![
                (cash_account, notional - fee, Decimal::ZERO),
                (fee_account, fee, Decimal::ZERO),
                (asset_account, Decimal::ZERO, notional),
            ],
        };

        Self {
            transaction_id: transaction_id.into(),
            entries,
        }
    }

    fn is_balanced(&self) -> bool {
        let debits: Decimal = self.entries.iter().map(|(_, d, _)| *d).sum();
        let credits: Decimal = self.entries.iter().map(|(_, _, c)| *c).sum();
        (debits - credits).abs() < tolerance()
    }
}

/// Append-only double-entry ledger with in-memory secondary indexes,
/// durably persisted as JSON lines.
pub struct Ledger {
    path: PathBuf,
    balances: Mutex<HashMap<String, Decimal>>,
    by_transaction: Mutex<HashMap<String, Vec<LedgerEntry>>>,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            balances: Mutex::new(HashMap::new()),
            by_transaction: Mutex::new(HashMap::new()),
        }
    }

    /// Records a transaction. Must satisfy `|Σdebits − Σcredits| < 1e-6` or
    /// it is a programming error (§7: "Ledger imbalance... raises and must
    /// crash the transaction").
    pub fn record(&self, tx: Transaction) -> Result<Vec<LedgerEntry>, LedgerError> {
        if !tx.is_balanced() {
            let debits: Decimal = tx.entries.iter().map(|(_, d, _)| *d).sum();
            let credits: Decimal = tx.entries.iter().map(|(_, _, c)| *c).sum();
            return Err(LedgerError::Unbalanced {
                transaction_id: tx.transaction_id,
                debits,
                credits,
            });
        }

        let ts = now_ms();
        let mut balances = self.balances.lock().unwrap();
        let mut entries = Vec::with_capacity(tx.entries.len());
        for (account, debit, credit) in &tx.entries {
            let balance = balances.entry(account.clone()).or_insert(Decimal::ZERO);
            *balance += *debit - *credit;
            entries.push(LedgerEntry {
                transaction_id: tx.transaction_id.clone(),
                account: account.clone(),
                debit: *debit,
                credit: *credit,
                balance_after: *balance,
                timestamp: ts,
            });
        }
        drop(balances);

        self.append_durable(&entries)?;
        self.by_transaction
            .lock()
            .unwrap()
            .insert(tx.transaction_id.clone(), entries.clone());
        Ok(entries)
    }

    fn append_durable(&self, entries: &[LedgerEntry]) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        for entry in entries {
            let json = serde_json::to_string(entry).map_err(|e| {
                LedgerError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })?;
            writeln!(file, "{json}")?;
        }
        Ok(())
    }

    pub fn balance(&self, account: &str) -> Result<Decimal, LedgerError> {
        self.balances
            .lock()
            .unwrap()
            .get(account)
            .copied()
            .ok_or_else(|| LedgerError::UnknownAccount(account.to_string()))
    }

    pub fn verify_balance(&self, account: &str, expected: Decimal, tol: Decimal) -> bool {
        match self.balance(account) {
            Ok(actual) => (actual - expected).abs() <= tol,
            Err(_) => false,
        }
    }

    pub fn entries_for(&self, transaction_id: &str) -> Vec<LedgerEntry> {
        self.by_transaction
            .lock()
            .unwrap()
            .get(transaction_id)
            .cloned()
            .unwrap_or_default()
    }
}
