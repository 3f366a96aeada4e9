//! TransitionTable: the single source of truth for `(Phase, FSMEvent) →
//! (Phase', Action)`. Missing pairs are invalid transitions (logged, no
//! state change); duplicate entries at construction are a fatal startup
//! error.
//!
//! Grounded on `examples/original_source/core/fsm/transitions.py`'s literal
//! table, with `Action::SetEntryCooldown`/`SetPostTradeCooldown` standing in
//! for the Python actions that mutate `cooldown_until`.

use crate::fsm::actions::Action;
use crate::types::{FSMEvent, Phase};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum TransitionTableError {
    #[error("duplicate transition entry for ({0:?}, {1:?})")]
    Duplicate(Phase, FSMEvent),
}

pub struct TransitionTable {
    table: HashMap<(Phase, FSMEvent), (Phase, Action)>,
}

impl TransitionTable {
    pub fn build() -> Result<Self, TransitionTableError> {
        use Action::*;
        use FSMEvent::*;
        use Phase::*;

        let entries: Vec<(Phase, FSMEvent, Phase, Action)> = vec![
            (Warmup, WarmupCompleted, Idle, None),
            (Idle, SlotAvailable, EntryEval, None),
            (EntryEval, GuardsBlocked, Idle, SetEntryCooldown),
            (EntryEval, NoSignal, Idle, SetEntryCooldown),
            (EntryEval, GuardsPassed, EntryEval, None),
            (EntryEval, SignalDetected, PlaceBuy, None),
            (PlaceBuy, BuyOrderPlaced, WaitFill, None),
            (PlaceBuy, OrderPlacementFailed, Idle, SetEntryCooldown),
            (PlaceBuy, ErrorOccurred, Error, RecordError),
            (WaitFill, BuyOrderFilled, Position, ResetCounters),
            (WaitFill, BuyOrderPartial, WaitFill, None),
            (WaitFill, BuyOrderTimeout, Idle, SetEntryCooldown),
            (WaitFill, BuyOrderRejected, Idle, SetEntryCooldown),
            (WaitFill, BuyAborted, Idle, SetEntryCooldown),
            (WaitFill, OrderCanceled, Idle, SetEntryCooldown),
            (Position, TickReceived, ExitEval, None),
            (Position, PositionUpdated, Position, None),
            (ExitEval, ExitSignalTp, PlaceSell, None),
            (ExitEval, ExitSignalSl, PlaceSell, None),
            (ExitEval, ExitSignalTrailing, PlaceSell, None),
            (ExitEval, ExitSignalTimeout, PlaceSell, None),
            (ExitEval, NoExitSignal, Position, None),
            (ExitEval, TickReceived, Position, None),
            (PlaceSell, SellOrderPlaced, WaitSellFill, None),
            (PlaceSell, OrderPlacementFailed, Position, None),
            (PlaceSell, ErrorOccurred, Error, RecordError),
            (WaitSellFill, SellOrderFilled, PostTrade, None),
            (WaitSellFill, SellOrderPartial, WaitSellFill, None),
            (WaitSellFill, SellOrderTimeout, Position, None),
            (WaitSellFill, SellOrderRejected, Position, None),
            (WaitSellFill, SellAborted, Position, None),
            (PostTrade, TradeComplete, Cooldown, SetPostTradeCooldown),
            (Cooldown, CooldownExpired, Idle, ResetCounters),
            (Error, ErrorBackoffExpired, Idle, ClearPosition),
            (Error, ManualHalt, Error, None),
        ];

        let mut table = HashMap::with_capacity(entries.len());
        for (from, event, to, action) in entries {
            let key = (from, event);
            if table.insert(key, (to, action)).is_some() {
                return Err(TransitionTableError::Duplicate(from, event));
            }
        }
        Ok(Self { table })
    }

    /// Looks up the transition for `(phase, event)`. `None` means the pair
    /// is not in the table: the caller logs `fsm_invalid_transition` and
    /// leaves the phase unchanged.
    pub fn lookup(&self, phase: Phase, event: FSMEvent) -> Option<(Phase, Action)> {
        self.table.get(&(phase, event)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_without_duplicates() {
        assert!(TransitionTable::build().is_ok());
    }

    #[test]
    fn idle_slot_available_enters_entry_eval() {
        let table = TransitionTable::build().unwrap();
        let (to, action) = table.lookup(Phase::Idle, FSMEvent::SlotAvailable).unwrap();
        assert_eq!(to, Phase::EntryEval);
        assert_eq!(action, Action::None);
    }

    #[test]
    fn guards_blocked_sets_cooldown_action() {
        let table = TransitionTable::build().unwrap();
        let (to, action) = table.lookup(Phase::EntryEval, FSMEvent::GuardsBlocked).unwrap();
        assert_eq!(to, Phase::Idle);
        assert_eq!(action, Action::SetEntryCooldown);
    }

    #[test]
    fn missing_pair_is_none() {
        let table = TransitionTable::build().unwrap();
        assert!(table.lookup(Phase::Idle, FSMEvent::BuyOrderFilled).is_none());
    }

    #[test]
    fn error_state_self_recovers_on_backoff_expiry() {
        let table = TransitionTable::build().unwrap();
        let (to, action) = table.lookup(Phase::Error, FSMEvent::ErrorBackoffExpired).unwrap();
        assert_eq!(to, Phase::Idle);
        assert_eq!(action, Action::ClearPosition);
    }

    use proptest::prelude::*;

    /// `lookup` is a total function over every `(Phase, FSMEvent)` pair — it
    /// never panics and is deterministic — across any phase/event
    /// combination proptest picks from the full enum space.
    #[test]
    fn prop_lookup_is_total_and_deterministic() {
        proptest!(|(phase_idx in 0..Phase::ALL.len(), event_idx in 0..FSMEvent::ALL.len())| {
            let table = TransitionTable::build().unwrap();
            let phase = Phase::ALL[phase_idx];
            let event = FSMEvent::ALL[event_idx];
            let first = table.lookup(phase, event);
            let second = table.lookup(phase, event);
            prop_assert_eq!(first, second);
        });
    }
}
