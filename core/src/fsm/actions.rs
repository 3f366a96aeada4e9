//! Transition actions: small, synchronous bookkeeping run immediately after
//! a `TransitionTable` lookup commits a phase change. Anything that talks to
//! the exchange or router happens in the phase dispatch in `mod.rs`, before
//! the event is looked up here.

use crate::types::{now_ms, CoinState, EventContext};

pub const ENTRY_EVAL_COOLDOWN_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    /// Sets `cooldown_until = now + ENTRY_EVAL_COOLDOWN_SECS` to avoid a
    /// tight re-evaluation loop after guards block or no signal fires.
    SetEntryCooldown,
    /// Sets `cooldown_until = now + symbol_cooldown_minutes * 60s` on trade
    /// completion.
    SetPostTradeCooldown,
    /// Resets retry/error counters on successful recovery paths.
    ResetCounters,
    /// Bumps `retry_count` for a retried leg of the same decision.
    IncrementRetry,
    /// Bumps `error_count` and records `last_error` from the context.
    RecordError,
    /// Zeros position bookkeeping (used leaving ERROR or POST_TRADE→IDLE).
    ClearPosition,
}

/// `symbol_cooldown_minutes` is read from config at FSM construction and
/// passed in here since actions are pure data, not closures.
pub fn apply(action: Action, state: &mut CoinState, ctx: &EventContext, symbol_cooldown_minutes: u64) {
    match action {
        Action::None => {}
        Action::SetEntryCooldown => {
            state.cooldown_until = now_ms() + ENTRY_EVAL_COOLDOWN_SECS * 1000;
        }
        Action::SetPostTradeCooldown => {
            state.cooldown_until = now_ms() + symbol_cooldown_minutes * 60 * 1000;
        }
        Action::ResetCounters => {
            state.error_count = 0;
            state.retry_count = 0;
        }
        Action::IncrementRetry => {
            state.retry_count += 1;
        }
        Action::RecordError => {
            state.error_count += 1;
            state.last_error = ctx.error.clone();
        }
        Action::ClearPosition => {
            state.clear_position();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Phase;

    #[test]
    fn set_entry_cooldown_moves_cooldown_into_the_future() {
        let mut state = CoinState::new("BTC/USDT");
        let ctx = EventContext::new("BTC/USDT");
        apply(Action::SetEntryCooldown, &mut state, &ctx, 60);
        assert!(state.cooldown_until > now_ms());
    }

    #[test]
    fn record_error_increments_and_copies_message() {
        let mut state = CoinState::new("BTC/USDT");
        state.phase = Phase::PlaceBuy;
        let mut ctx = EventContext::new("BTC/USDT");
        ctx.error = Some("boom".into());
        apply(Action::RecordError, &mut state, &ctx, 60);
        assert_eq!(state.error_count, 1);
        assert_eq!(state.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn clear_position_zeroes_amount() {
        let mut state = CoinState::new("BTC/USDT");
        state.amount = rust_decimal::Decimal::ONE;
        let ctx = EventContext::new("BTC/USDT");
        apply(Action::ClearPosition, &mut state, &ctx, 60);
        assert_eq!(state.amount, rust_decimal::Decimal::ZERO);
    }
}
