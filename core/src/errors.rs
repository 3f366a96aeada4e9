//! Domain error types, one enum per component family.
//!
//! Library code returns these; the binary composes them into `anyhow::Error`
//! at the point it reports a fatal startup failure or logs a recoverable one.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortfolioError {
    #[error("notional {notional} below min_notional {min_notional} for {symbol}")]
    BelowMinNotional {
        symbol: String,
        notional: rust_decimal::Decimal,
        min_notional: rust_decimal::Decimal,
    },
    #[error("insufficient free budget for {symbol}: need {needed}, have {available}")]
    InsufficientBudget {
        symbol: String,
        needed: rust_decimal::Decimal,
        available: rust_decimal::Decimal,
    },
    #[error("no reservation found for {symbol} matching the release request")]
    NoMatchingReservation { symbol: String },
    #[error("sell of {qty} would overshoot position {held} for {symbol}")]
    SellExceedsPosition {
        symbol: String,
        qty: rust_decimal::Decimal,
        held: rust_decimal::Decimal,
    },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("transaction {transaction_id} unbalanced: debits {debits} != credits {credits}")]
    Unbalanced {
        transaction_id: String,
        debits: rust_decimal::Decimal,
        credits: rust_decimal::Decimal,
    },
    #[error("account {0} has no balance recorded")]
    UnknownAccount(String),
    #[error("durable write failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CoidError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("attempted to modify terminal COID entry {0}")]
    AlreadyTerminal(String),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error writing snapshot for {symbol}: {source}")]
    Io {
        symbol: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error for {symbol}: {source}")]
    Serde {
        symbol: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("restored state for {symbol} violates invariants: {reason}")]
    InvalidState { symbol: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    #[error("duplicate client_order_id: {0}")]
    DuplicateOrder(String),
    #[error("unknown exchange error: {0}")]
    Unknown(String),
}

/// Classification used by the router to decide retry-vs-abort (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with exponential backoff up to max_retries.
    Transient,
    /// Retry with a longer base backoff, same cap.
    RateLimited,
    /// Abort immediately, no retry; budget released.
    Fatal,
    /// Single retry, then fatal.
    Unknown,
}

impl ExchangeError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            ExchangeError::Network(_) => ErrorClass::Transient,
            ExchangeError::RateLimit(_) => ErrorClass::RateLimited,
            ExchangeError::InsufficientFunds(_)
            | ExchangeError::InvalidOrder(_)
            | ExchangeError::DuplicateOrder(_) => ErrorClass::Fatal,
            ExchangeError::Unknown(_) => ErrorClass::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_network_as_transient() {
        assert_eq!(
            ExchangeError::Network("timeout".into()).classify(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn classifies_insufficient_funds_as_fatal() {
        assert_eq!(
            ExchangeError::InsufficientFunds("no balance".into()).classify(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn classifies_unknown_as_single_retry() {
        assert_eq!(
            ExchangeError::Unknown("???".into()).classify(),
            ErrorClass::Unknown
        );
    }
}
