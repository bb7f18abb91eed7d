// =============================================================================
// Setup Detection — impulse strength, retrace depth, re-acceleration, costs
// =============================================================================
//
// Small pure helpers used by the expansion lane's state machine. All of them
// degrade to "nothing detected" on unusable market data.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{Direction, SignalSnapshot};

/// Which confirmation fired the re-acceleration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryTrigger {
    Ema9Cross,
    Rsi50Cross,
    BarReturnAtr,
}

impl std::fmt::Display for EntryTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ema9Cross => write!(f, "ema9_cross"),
            Self::Rsi50Cross => write!(f, "rsi50_cross"),
            Self::BarReturnAtr => write!(f, "bar_return_atr"),
        }
    }
}

/// Impulse strength in ATR units and the direction of the move.
///
/// Strength is the larger of the upstream expansion strength (when the
/// expansion flag is set) and `|close - close[-lookback]| / ATR`.
pub fn impulse_strength(snap: &SignalSnapshot, lookback: usize) -> (f64, Direction) {
    if !snap.is_usable() {
        return (0.0, Direction::Flat);
    }

    let (move_strength, move_dir) = match snap.close_back(lookback) {
        Some(base) => {
            let delta = snap.close - base;
            (delta.abs() / snap.atr, Direction::of_move(delta))
        }
        None => (0.0, Direction::Flat),
    };

    let event_strength = if snap.expansion_event && snap.expansion_strength.is_finite() {
        snap.expansion_strength.max(0.0)
    } else {
        0.0
    };

    let direction = if move_dir.is_flat() { snap.direction } else { move_dir };
    (move_strength.max(event_strength), direction)
}

/// How far `price` has retraced from `break_level`, in ATR units.
///
/// Positive means a pullback against `direction`; negative means price has
/// extended beyond the break level.
pub fn retrace_depth_atr(direction: Direction, break_level: f64, price: f64, atr: f64) -> f64 {
    if atr <= 0.0 || !atr.is_finite() {
        return 0.0;
    }
    direction.sign() * (break_level - price) / atr
}

/// First re-acceleration trigger that fires this tick, if any.
///
/// Checked in order: EMA(9) cross, RSI(7) 50-line cross, bar return.
pub fn detect_reaccel(
    snap: &SignalSnapshot,
    direction: Direction,
    last_rsi: Option<f64>,
    bar_return_atr_min: f64,
) -> Option<EntryTrigger> {
    if direction.is_flat() || !snap.is_usable() {
        return None;
    }
    let s = direction.sign();
    let prev = snap.prev_close();

    if let Some(prev) = prev {
        if snap.ema9.is_finite() && snap.ema9 > 0.0 {
            let was_behind = s * (prev - snap.ema9) <= 0.0;
            let now_ahead = s * (snap.close - snap.ema9) > 0.0;
            if was_behind && now_ahead {
                return Some(EntryTrigger::Ema9Cross);
            }
        }
    }

    if let Some(last) = last_rsi {
        let rsi = snap.rsi7;
        if rsi.is_finite() && (0.0..=100.0).contains(&rsi) {
            let crossed = match direction {
                Direction::Long => last < 50.0 && rsi >= 50.0,
                Direction::Short => last > 50.0 && rsi <= 50.0,
                Direction::Flat => false,
            };
            if crossed {
                return Some(EntryTrigger::Rsi50Cross);
            }
        }
    }

    if let Some(prev) = prev {
        if s * (snap.close - prev) / snap.atr > bar_return_atr_min {
            return Some(EntryTrigger::BarReturnAtr);
        }
    }

    None
}

/// `n` consecutive closes moving against `direction`.
pub fn closes_against(snap: &SignalSnapshot, direction: Direction, n: usize) -> bool {
    let closes = &snap.recent_closes;
    if direction.is_flat() || n == 0 || closes.len() < n + 1 {
        return false;
    }
    let s = direction.sign();
    closes[closes.len() - n - 1..]
        .windows(2)
        .all(|w| s * (w[1] - w[0]) < 0.0)
}

// =============================================================================
// Cost sanity
// =============================================================================

fn default_fee_bps() -> f64 {
    4.0
}

fn default_slippage_bps() -> f64 {
    2.0
}

fn default_spread_bps() -> f64 {
    1.0
}

/// Fixed per-side trading costs in basis points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    #[serde(default = "default_fee_bps")]
    pub fee_bps: f64,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: f64,
    /// Paid once per round trip.
    #[serde(default = "default_spread_bps")]
    pub spread_bps: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            fee_bps: default_fee_bps(),
            slippage_bps: default_slippage_bps(),
            spread_bps: default_spread_bps(),
        }
    }
}

impl CostModel {
    /// Round-trip cost as a percentage of price.
    pub fn round_trip_pct(&self) -> f64 {
        (2.0 * self.fee_bps + 2.0 * self.slippage_bps + self.spread_bps) / 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CostCheck {
    pub expected_move_pct: f64,
    pub cost_pct: f64,
    pub required_pct: f64,
    pub passed: bool,
}

/// Does an `expected_move_atr × ATR` move clear `buffer ×` round-trip costs?
pub fn cost_sanity(
    close: f64,
    atr: f64,
    expected_move_atr: f64,
    buffer: f64,
    costs: &CostModel,
) -> CostCheck {
    let expected_move_pct = if close > 0.0 && close.is_finite() && atr.is_finite() {
        expected_move_atr * atr / close * 100.0
    } else {
        0.0
    };
    let cost_pct = costs.round_trip_pct();
    let required_pct = buffer * cost_pct;
    CostCheck {
        expected_move_pct,
        cost_pct,
        required_pct,
        passed: expected_move_pct >= required_pct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(closes: &[f64], atr: f64) -> SignalSnapshot {
        SignalSnapshot {
            symbol: "BTC".into(),
            timeframe: "1h".into(),
            regime: "trending".into(),
            micro_regime: String::new(),
            direction: Direction::Flat,
            confidence: 0.5,
            close: *closes.last().unwrap(),
            atr,
            ema9: 0.0,
            rsi7: 50.0,
            recent_closes: closes.to_vec(),
            expansion_event: false,
            expansion_strength: 0.0,
        }
    }

    #[test]
    fn impulse_from_price_move() {
        let s = snap(&[100.0, 101.0, 102.0, 104.0], 2.0);
        let (strength, dir) = impulse_strength(&s, 3);
        assert!((strength - 2.0).abs() < 1e-12);
        assert_eq!(dir, Direction::Long);
    }

    #[test]
    fn impulse_from_expansion_event() {
        let mut s = snap(&[100.0, 100.0], 2.0);
        s.expansion_event = true;
        s.expansion_strength = 2.5;
        s.direction = Direction::Short;
        assert_eq!(impulse_strength(&s, 3), (2.5, Direction::Short));
        s.expansion_event = false;
        assert_eq!(impulse_strength(&s, 3).0, 0.0);
    }

    #[test]
    fn impulse_zero_on_bad_data() {
        let mut s = snap(&[100.0, 110.0, 120.0, 130.0], 0.0);
        assert_eq!(impulse_strength(&s, 3), (0.0, Direction::Flat));
        s.atr = 2.0;
        s.close = f64::NAN;
        assert_eq!(impulse_strength(&s, 3).0, 0.0);
    }

    #[test]
    fn retrace_depth_sign() {
        assert!((retrace_depth_atr(Direction::Long, 110.0, 108.0, 2.0) - 1.0).abs() < 1e-12);
        assert!(retrace_depth_atr(Direction::Long, 110.0, 112.0, 2.0) < 0.0);
        assert!((retrace_depth_atr(Direction::Short, 90.0, 91.0, 2.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn ema_cross_fires_first() {
        let mut s = snap(&[100.0, 99.0, 101.0], 2.0);
        s.ema9 = 100.0;
        assert_eq!(detect_reaccel(&s, Direction::Long, Some(40.0), 0.25), Some(EntryTrigger::Ema9Cross));
    }

    #[test]
    fn rsi_cross_needs_previous_reading() {
        let mut s = snap(&[100.0, 100.0, 100.1], 2.0);
        s.rsi7 = 55.0;
        assert_eq!(detect_reaccel(&s, Direction::Long, None, 0.25), None);
        assert_eq!(detect_reaccel(&s, Direction::Long, Some(45.0), 0.25), Some(EntryTrigger::Rsi50Cross));
        s.rsi7 = 45.0;
        assert_eq!(detect_reaccel(&s, Direction::Short, Some(55.0), 0.25), Some(EntryTrigger::Rsi50Cross));
    }

    #[test]
    fn bar_return_trigger() {
        let s = snap(&[100.0, 100.0, 100.6], 2.0);
        assert_eq!(detect_reaccel(&s, Direction::Long, Some(60.0), 0.25), Some(EntryTrigger::BarReturnAtr));
        assert_eq!(detect_reaccel(&s, Direction::Short, Some(40.0), 0.25), None);
    }

    #[test]
    fn consecutive_adverse_closes() {
        let s = snap(&[100.0, 103.0, 102.0, 101.0], 2.0);
        assert!(closes_against(&s, Direction::Long, 2));
        assert!(!closes_against(&s, Direction::Long, 3));
        assert!(!closes_against(&s, Direction::Short, 2));
    }

    #[test]
    fn cost_veto_math() {
        let costs = CostModel::default();
        assert!((costs.round_trip_pct() - 0.13).abs() < 1e-12);
        // 1.5 × 1000 / 50000 = 3% — clears 3 × 0.13%.
        assert!(cost_sanity(50_000.0, 1_000.0, 1.5, 3.0, &costs).passed);
        // 1.5 × 10 / 50000 = 0.03% — does not.
        let check = cost_sanity(50_000.0, 10.0, 1.5, 3.0, &costs);
        assert!(!check.passed);
        assert!(check.expected_move_pct < check.required_pct);
    }
}
