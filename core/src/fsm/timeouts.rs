//! TimeoutManager (C7, §4.7): pure predicates over `CoinState` and `now`
//! producing zero or more timeout events per tick. Called by the engine
//! before phase dispatch.

use crate::types::{now_ms, CoinState, FSMEvent, Phase};

#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    pub buy_fill_timeout_secs: u64,
    pub sell_fill_timeout_secs: u64,
    pub cooldown_secs: u64,
    pub trade_ttl_min: u64,
    /// Backoff base for ERROR-phase self-recovery (§4.6): `min(300, 10 ×
    /// 2^min(error_count,5))` seconds from phase entry.
    pub error_backoff_base_secs: u64,
    pub error_backoff_cap_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            buy_fill_timeout_secs: 30,
            sell_fill_timeout_secs: 30,
            cooldown_secs: 300,
            trade_ttl_min: 240,
            error_backoff_base_secs: 10,
            error_backoff_cap_secs: 300,
        }
    }
}

/// `backoff = min(cap, base × 2^min(error_count, 5))`, applied from the
/// timestamp the symbol entered ERROR.
fn error_backoff_secs(config: &TimeoutConfig, error_count: u32) -> u64 {
    let exponent = error_count.min(5);
    let scaled = config.error_backoff_base_secs.saturating_mul(1u64 << exponent);
    scaled.min(config.error_backoff_cap_secs)
}

pub struct TimeoutManager {
    config: TimeoutConfig,
}

impl TimeoutManager {
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    pub fn check_all_timeouts(&self, state: &CoinState) -> Vec<FSMEvent> {
        let now = now_ms();
        let mut events = Vec::new();

        match state.phase {
            Phase::WaitFill => {
                if now.saturating_sub(state.order_placed_ts) > self.config.buy_fill_timeout_secs * 1000 {
                    events.push(FSMEvent::BuyOrderTimeout);
                }
            }
            Phase::WaitSellFill => {
                if now.saturating_sub(state.order_placed_ts) > self.config.sell_fill_timeout_secs * 1000 {
                    events.push(FSMEvent::SellOrderTimeout);
                }
            }
            Phase::Cooldown => {
                if now >= state.cooldown_until {
                    events.push(FSMEvent::CooldownExpired);
                }
            }
            Phase::Position => {
                let held_min = now.saturating_sub(state.entry_ts) / 1000 / 60;
                if held_min > self.config.trade_ttl_min {
                    events.push(FSMEvent::ExitSignalTimeout);
                }
            }
            Phase::Error => {
                let backoff = error_backoff_secs(&self.config, state.error_count);
                if now.saturating_sub(state.phase_entered_ts) > backoff * 1000 {
                    events.push(FSMEvent::ErrorBackoffExpired);
                }
            }
            _ => {}
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_fill_times_out_after_threshold() {
        let mgr = TimeoutManager::new(TimeoutConfig {
            buy_fill_timeout_secs: 0,
            ..Default::default()
        });
        let mut state = CoinState::new("BTC/USDT");
        state.phase = Phase::WaitFill;
        state.order_placed_ts = now_ms() - 1000;
        assert_eq!(mgr.check_all_timeouts(&state), vec![FSMEvent::BuyOrderTimeout]);
    }

    #[test]
    fn cooldown_expires_when_deadline_passed() {
        let mgr = TimeoutManager::new(TimeoutConfig::default());
        let mut state = CoinState::new("BTC/USDT");
        state.phase = Phase::Cooldown;
        state.cooldown_until = now_ms() - 1;
        assert_eq!(mgr.check_all_timeouts(&state), vec![FSMEvent::CooldownExpired]);
    }

    #[test]
    fn error_backoff_grows_with_error_count_and_caps() {
        let config = TimeoutConfig::default();
        assert_eq!(error_backoff_secs(&config, 0), 10);
        assert_eq!(error_backoff_secs(&config, 1), 20);
        assert_eq!(error_backoff_secs(&config, 5), 300);
        assert_eq!(error_backoff_secs(&config, 10), 300);
    }

    #[test]
    fn error_phase_emits_backoff_expired_once_elapsed() {
        let mgr = TimeoutManager::new(TimeoutConfig::default());
        let mut state = CoinState::new("BTC/USDT");
        state.phase = Phase::Error;
        state.error_count = 0;
        state.phase_entered_ts = now_ms() - 11_000;
        assert_eq!(mgr.check_all_timeouts(&state), vec![FSMEvent::ErrorBackoffExpired]);
    }

    #[test]
    fn idle_phase_has_no_timeouts() {
        let mgr = TimeoutManager::new(TimeoutConfig::default());
        let state = CoinState::new("BTC/USDT");
        assert!(mgr.check_all_timeouts(&state).is_empty());
    }
}
