// =============================================================================
// Exit Evaluator — regime-aware close/hold decision
// =============================================================================
//
// Pure function shared by every lane. Check order (first match wins):
//
//   1. Min hold      — bars_open < min_hold_bars           → hold
//   2. Max hold      — bars_open >= max_hold_bars (if > 0) → "decay"
//   3. TP / SL       — return and confidence thresholds
//   4. Scratch       — neither fired, stale and flat        → "drop"
//   5. Both fired    — stop-loss wins
//
// Invalid prices never force an exit: the evaluator returns `None` and the
// caller holds.
// =============================================================================

use serde::Serialize;

use super::rules::{ExitParams, ExitRuleTable};
use super::ExitReason;
use crate::types::Direction;

/// Everything the evaluator needs to know about one open position this tick.
#[derive(Debug, Clone, Copy)]
pub struct ExitInput {
    pub bars_open: u32,
    pub direction: Direction,
    pub entry_price: f64,
    pub last_price: f64,
    pub final_conf: f64,
    /// Confidence reading for the stop-loss side; `final_conf` when absent.
    pub sl_conf: Option<f64>,
    /// Confidence reading for the take-profit side; `final_conf` when absent.
    pub tp_conf: Option<f64>,
}

/// A fired exit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExitSignal {
    pub reason: ExitReason,
    pub signed_return: f64,
    /// Confidence that satisfied the winning check.
    pub conf: f64,
}

/// Direction-adjusted fractional return, or `None` for unusable prices.
pub fn signed_return(direction: Direction, entry_price: f64, last_price: f64) -> Option<f64> {
    let valid = |p: f64| p.is_finite() && p > 0.0;
    if !valid(entry_price) || !valid(last_price) {
        return None;
    }
    Some(direction.sign() * (last_price - entry_price) / entry_price)
}

/// Decide whether a position should close under `params`.
pub fn evaluate_exit(params: &ExitParams, input: &ExitInput) -> Option<ExitSignal> {
    let r = signed_return(input.direction, input.entry_price, input.last_price)?;

    if input.bars_open < params.min_hold_bars {
        return None;
    }

    if params.max_hold_bars > 0 && input.bars_open >= params.max_hold_bars {
        return Some(ExitSignal {
            reason: ExitReason::Decay,
            signed_return: r,
            conf: input.final_conf,
        });
    }

    let tp_conf = input.tp_conf.unwrap_or(input.final_conf);
    let sl_conf = input.sl_conf.unwrap_or(input.final_conf);
    let tp_ok = r >= params.tp_return_min && tp_conf >= params.tp_conf_min;
    let sl_ok = r <= params.sl_return && sl_conf >= params.sl_conf_min;

    match (sl_ok, tp_ok) {
        (true, _) => Some(ExitSignal {
            reason: ExitReason::StopLoss,
            signed_return: r,
            conf: sl_conf,
        }),
        (false, true) => Some(ExitSignal {
            reason: ExitReason::TakeProfit,
            signed_return: r,
            conf: tp_conf,
        }),
        (false, false) => {
            if input.bars_open >= params.decay_bars && r.abs() <= params.drop_return_max {
                Some(ExitSignal {
                    reason: ExitReason::Drop,
                    signed_return: r,
                    conf: input.final_conf,
                })
            } else {
                None
            }
        }
    }
}

impl ExitRuleTable {
    /// Evaluate with the params for `regime` (or `default`).
    pub fn evaluate(&self, regime: &str, input: &ExitInput) -> Option<ExitSignal> {
        evaluate_exit(self.params(regime), input)
    }
}
