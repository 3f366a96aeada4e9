//! ExitEngine: the four prioritized exit rules evaluated in EXIT_EVAL
//! (§4.6). First match wins; SL dominates TP; trailing never overrides a
//! hard stop-loss.

use crate::portfolio::Position;
use crate::types::FSMEvent;
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy)]
pub struct ExitConfig {
    pub sl_pct: Decimal,
    pub tp_pct: Decimal,
    pub trailing_enabled: bool,
    pub trail_pct: Decimal,
    pub max_hold_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitRule {
    HardSl,
    HardTp,
    TrailSl,
    TimeExit,
}

impl ExitRule {
    pub fn strength(self) -> f64 {
        match self {
            ExitRule::HardSl => 1.0,
            ExitRule::HardTp => 0.9,
            ExitRule::TrailSl => 0.8,
            ExitRule::TimeExit => 0.5,
        }
    }

    pub fn event(self) -> FSMEvent {
        match self {
            ExitRule::HardSl => FSMEvent::ExitSignalSl,
            ExitRule::HardTp => FSMEvent::ExitSignalTp,
            ExitRule::TrailSl => FSMEvent::ExitSignalTrailing,
            ExitRule::TimeExit => FSMEvent::ExitSignalTimeout,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExitSignal {
    pub rule: ExitRule,
    pub limit_price: Option<Decimal>,
}

pub struct ExitEngine {
    config: ExitConfig,
}

impl ExitEngine {
    pub fn new(config: ExitConfig) -> Self {
        Self { config }
    }

    /// Evaluates the four rules in fixed priority order against the current
    /// price, the position's entry price, its peak price (for trailing),
    /// and how long it has been held.
    pub fn evaluate(
        &self,
        position: &Position,
        current_price: Decimal,
        peak_price: Decimal,
        opened_ts: u64,
        now_ms: u64,
    ) -> Option<ExitSignal> {
        if position.avg_price <= Decimal::ZERO {
            return None;
        }
        let pnl_pct = (current_price - position.avg_price) / position.avg_price;

        if pnl_pct <= -self.config.sl_pct.abs() {
            return Some(ExitSignal {
                rule: ExitRule::HardSl,
                limit_price: Some(current_price),
            });
        }
        if pnl_pct >= self.config.tp_pct.abs() {
            return Some(ExitSignal {
                rule: ExitRule::HardTp,
                limit_price: Some(current_price),
            });
        }
        if self.config.trailing_enabled && peak_price > Decimal::ZERO {
            let drawdown = (peak_price - current_price) / peak_price;
            if drawdown >= self.config.trail_pct {
                return Some(ExitSignal {
                    rule: ExitRule::TrailSl,
                    limit_price: Some(current_price),
                });
            }
        }
        let held_secs = now_ms.saturating_sub(opened_ts) / 1000;
        if held_secs >= self.config.max_hold_secs {
            return Some(ExitSignal {
                rule: ExitRule::TimeExit,
                limit_price: None,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portfolio::PositionState;
    use rust_decimal_macros::dec;

    fn config() -> ExitConfig {
        ExitConfig {
            sl_pct: dec!(0.02),
            tp_pct: dec!(0.03),
            trailing_enabled: true,
            trail_pct: dec!(0.01),
            max_hold_secs: 3600,
        }
    }

    fn position(avg_price: Decimal) -> Position {
        Position {
            symbol: "BTC/USDT".into(),
            qty: dec!(1),
            avg_price,
            realized_pnl: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
            opened_ts: 0,
            state: PositionState::Open,
        }
    }

    #[test]
    fn hard_sl_fires_below_threshold() {
        let engine = ExitEngine::new(config());
        let pos = position(dec!(100));
        let signal = engine.evaluate(&pos, dec!(97), dec!(100), 0, 1000).unwrap();
        assert_eq!(signal.rule, ExitRule::HardSl);
    }

    #[test]
    fn hard_tp_fires_above_threshold() {
        let engine = ExitEngine::new(config());
        let pos = position(dec!(100));
        let signal = engine.evaluate(&pos, dec!(104), dec!(104), 0, 1000).unwrap();
        assert_eq!(signal.rule, ExitRule::HardTp);
    }

    #[test]
    fn sl_dominates_tp_when_both_could_fire() {
        // below avg price so pnl_pct negative: cannot trigger tp, only sl path exercised
        let engine = ExitEngine::new(config());
        let pos = position(dec!(100));
        let signal = engine.evaluate(&pos, dec!(90), dec!(100), 0, 1000).unwrap();
        assert_eq!(signal.rule, ExitRule::HardSl);
    }

    #[test]
    fn trailing_fires_on_drawdown_from_peak() {
        let engine = ExitEngine::new(config());
        let pos = position(dec!(100));
        // +1.5% from entry but 1.47% down from peak of 105
        let signal = engine.evaluate(&pos, dec!(103.5), dec!(105), 0, 1000).unwrap();
        assert_eq!(signal.rule, ExitRule::TrailSl);
    }

    #[test]
    fn time_exit_fires_after_max_hold() {
        let engine = ExitEngine::new(config());
        let pos = position(dec!(100));
        let signal = engine.evaluate(&pos, dec!(100.5), dec!(100.5), 0, 3_601_000).unwrap();
        assert_eq!(signal.rule, ExitRule::TimeExit);
    }

    #[test]
    fn no_signal_when_nothing_triggers() {
        let engine = ExitEngine::new(config());
        let pos = position(dec!(100));
        let signal = engine.evaluate(&pos, dec!(100.2), dec!(100.2), 0, 1000);
        assert!(signal.is_none());
    }
}
