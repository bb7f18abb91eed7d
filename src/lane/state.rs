// =============================================================================
// Lane State — per (lane, symbol) setup phase and open position
// =============================================================================
//
// Life-cycle:
//   Idle -> ImpulseDetected -> PullbackTracking -> Armed -> InPosition -> Idle
//
// Any window expiry, invalidation or cost veto drops straight back to Idle.
// `LaneSlot` is the only way to open or close a position and keeps the
// invariant `phase == InPosition <=> position.is_some()`.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::setup::EntryTrigger;
use super::LaneKind;
use crate::types::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LanePhase {
    #[default]
    Idle,
    ImpulseDetected,
    PullbackTracking,
    Armed,
    InPosition,
}

impl std::fmt::Display for LanePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::ImpulseDetected => write!(f, "impulse_detected"),
            Self::PullbackTracking => write!(f, "pullback_tracking"),
            Self::Armed => write!(f, "armed"),
            Self::InPosition => write!(f, "in_position"),
        }
    }
}

/// Setup-tracking state for one (lane, symbol).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LaneState {
    pub phase: LanePhase,
    pub impulse_at: Option<DateTime<Utc>>,
    pub impulse_strength: f64,
    pub impulse_direction: Direction,
    /// Close at which the impulse was confirmed; follows further extension.
    pub break_level: f64,
    /// Deepest retrace seen: lowest close for longs, highest for shorts.
    pub pullback_extreme: f64,
    pub pullback_at: Option<DateTime<Utc>>,
    pub trigger: Option<EntryTrigger>,
    pub max_wait_bars: u32,
    /// RSI(7) from the previous tick, for the 50-line cross.
    pub last_rsi: Option<f64>,
}

impl LaneState {
    /// Back to Idle. The RSI memory survives; it is indicator history, not
    /// setup state.
    fn reset(&mut self) {
        *self = Self {
            last_rsi: self.last_rsi,
            ..Self::default()
        };
    }

    /// Whole bars elapsed since the impulse, or `None` when idle.
    ///
    /// A non-positive bar length counts every elapsed second as a bar, so a
    /// broken bar length can only shorten the window.
    pub fn bars_since_impulse(&self, now: DateTime<Utc>, bar_secs: i64) -> Option<u32> {
        let at = self.impulse_at?;
        let bar_secs = bar_secs.max(1);
        let elapsed = (now - at).num_seconds().max(0);
        Some(u32::try_from(elapsed / bar_secs).unwrap_or(u32::MAX))
    }
}

/// An open position owned by one (lane, symbol) slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Deterministic id derived from lane, symbol and open time.
    pub id: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub atr_at_entry: f64,
    /// Pullback extreme of the setup that produced the entry.
    pub pullback_extreme: f64,
    pub tp1_hit: bool,
    pub trailing_stop: Option<f64>,
    pub bars_open: u32,
    pub regime: String,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lane: LaneKind,
        symbol: &str,
        opened_at: DateTime<Utc>,
        direction: Direction,
        entry_price: f64,
        atr_at_entry: f64,
        pullback_extreme: f64,
        regime: &str,
    ) -> Self {
        let name = format!("{lane}:{symbol}:{}", opened_at.timestamp_millis());
        Self {
            id: Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string(),
            direction,
            entry_price,
            atr_at_entry,
            pullback_extreme,
            tp1_hit: false,
            trailing_stop: None,
            bars_open: 0,
            regime: regime.to_string(),
            opened_at,
        }
    }

    /// Direction-adjusted fractional return at `price`.
    pub fn unrealized_return(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.direction.sign() * (price - self.entry_price) / self.entry_price
    }
}

/// Arena cell for one (lane, symbol): setup state plus optional position.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LaneSlot {
    state: LaneState,
    position: Option<Position>,
    last_tick_at: Option<DateTime<Utc>>,
}

impl LaneSlot {
    pub fn state(&self) -> &LaneState {
        &self.state
    }

    pub fn phase(&self) -> LanePhase {
        self.state.phase
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn last_tick_at(&self) -> Option<DateTime<Utc>> {
        self.last_tick_at
    }

    /// `phase == InPosition` exactly when a position exists.
    pub fn is_consistent(&self) -> bool {
        (self.state.phase == LanePhase::InPosition) == self.position.is_some()
    }

    pub(crate) fn state_mut(&mut self) -> &mut LaneState {
        &mut self.state
    }

    pub(crate) fn position_mut(&mut self) -> Option<&mut Position> {
        self.position.as_mut()
    }

    pub(crate) fn open(&mut self, position: Position) {
        self.position = Some(position);
        self.state.phase = LanePhase::InPosition;
    }

    /// Drop the position and reset the setup to Idle.
    pub(crate) fn close(&mut self) -> Option<Position> {
        let closed = self.position.take();
        self.state.reset();
        closed
    }

    /// Abandon the current setup. Never touches an open position.
    pub(crate) fn reset_setup(&mut self) {
        if self.position.is_none() {
            self.state.reset();
        }
    }

    pub(crate) fn mark_tick(&mut self, at: DateTime<Utc>) {
        self.last_tick_at = Some(at);
    }
}
