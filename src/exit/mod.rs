// =============================================================================
// Exit Management Module
// =============================================================================
//
// Regime-keyed exit parameters, the pure exit evaluator shared by every lane,
// and the ATR trailing-stop ratchet used once a lane has banked TP1.

pub mod evaluator;
pub mod rules;
pub mod trail;

pub use evaluator::{evaluate_exit, ExitInput, ExitSignal};
pub use rules::{ExitParams, ExitRuleTable};

use serde::{Deserialize, Serialize};

/// Why a position was (fully or partially) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    /// Regime stop-loss return reached.
    #[serde(rename = "sl")]
    StopLoss,
    /// Regime take-profit return reached.
    #[serde(rename = "tp")]
    TakeProfit,
    /// `max_hold_bars` elapsed.
    #[serde(rename = "decay")]
    Decay,
    /// Scratch exit: stale position going nowhere.
    #[serde(rename = "drop")]
    Drop,
    #[serde(rename = "invalidation_sl")]
    InvalidationStop,
    /// First ATR target; partial close.
    #[serde(rename = "tp1")]
    TakeProfit1,
    #[serde(rename = "atr_trail")]
    AtrTrail,
    #[serde(rename = "momentum_decay")]
    MomentumDecay,
    #[serde(rename = "time_stop")]
    TimeStop,
}

impl ExitReason {
    /// Partial exits leave the position open.
    pub fn is_partial(self) -> bool {
        self == Self::TakeProfit1
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StopLoss => "sl",
            Self::TakeProfit => "tp",
            Self::Decay => "decay",
            Self::Drop => "drop",
            Self::InvalidationStop => "invalidation_sl",
            Self::TakeProfit1 => "tp1",
            Self::AtrTrail => "atr_trail",
            Self::MomentumDecay => "momentum_decay",
            Self::TimeStop => "time_stop",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_wire_name() {
        for reason in [
            ExitReason::StopLoss,
            ExitReason::TakeProfit,
            ExitReason::Decay,
            ExitReason::Drop,
            ExitReason::InvalidationStop,
            ExitReason::TakeProfit1,
            ExitReason::AtrTrail,
            ExitReason::MomentumDecay,
            ExitReason::TimeStop,
        ] {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason));
        }
        assert!(ExitReason::TakeProfit1.is_partial());
        assert!(!ExitReason::AtrTrail.is_partial());
    }
}
