// =============================================================================
// Guardrails — time and count limits per (symbol, lane)
// =============================================================================
//
// Checks, in order (first failure wins):
//   1. Min hold        — minutes since the last trade >= min_hold_minutes
//   2. Cooldown        — minutes since the last trade >= cooldown_minutes
//   3. Max positions   — open positions for (symbol, lane) < cap
//
// The checker itself is stateless. Its only input besides the limits is the
// ledger, which the external bookkeeping collaborator mutates on fills while
// lanes read it; interior mutability lets both sides share one `Arc`.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::lane::{Decision, LaneKind, LaneResult};

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

fn default_min_hold_minutes() -> f64 {
    5.0
}

fn default_cooldown_minutes() -> f64 {
    30.0
}

fn default_max_positions_per_symbol() -> u32 {
    1
}

/// Guardrail limits applied to one lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailLimits {
    #[serde(default = "default_min_hold_minutes")]
    pub min_hold_minutes: f64,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: f64,
    #[serde(default = "default_max_positions_per_symbol")]
    pub max_positions_per_symbol: u32,
}

impl Default for GuardrailLimits {
    fn default() -> Self {
        Self {
            min_hold_minutes: default_min_hold_minutes(),
            cooldown_minutes: default_cooldown_minutes(),
            max_positions_per_symbol: default_max_positions_per_symbol(),
        }
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Stable machine-readable key of the guardrail that blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailKey {
    MinHold,
    Cooldown,
    MaxPositions,
}

impl GuardrailKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MinHold => "min_hold",
            Self::Cooldown => "cooldown",
            Self::MaxPositions => "max_positions",
        }
    }
}

impl std::fmt::Display for GuardrailKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardrailVerdict {
    pub allowed: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_key: Option<GuardrailKey>,
}

impl GuardrailVerdict {
    fn pass() -> Self {
        Self {
            allowed: true,
            reason: "ok".to_string(),
            reason_key: None,
        }
    }

    fn block(key: GuardrailKey, reason: String) -> Self {
        Self {
            allowed: false,
            reason,
            reason_key: Some(key),
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Trade bookkeeping for one (symbol, lane).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub last_trade_at: Option<DateTime<Utc>>,
    pub open_positions: u32,
}

/// Shared, append-mostly trade ledger read by every lane.
#[derive(Debug, Default)]
pub struct GuardrailLedger {
    entries: RwLock<HashMap<(String, LaneKind), LedgerEntry>>,
}

impl GuardrailLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, symbol: &str, lane: LaneKind) -> Option<LedgerEntry> {
        self.entries.read().get(&(symbol.to_string(), lane)).copied()
    }

    /// A position opened: stamps the trade time and bumps the open count.
    pub fn record_open(&self, symbol: &str, lane: LaneKind, at: DateTime<Utc>) {
        let mut entries = self.entries.write();
        let e = entries.entry((symbol.to_string(), lane)).or_default();
        e.last_trade_at = Some(at);
        e.open_positions += 1;
        debug!(symbol, lane = %lane, open = e.open_positions, "ledger: open recorded");
    }

    /// A position fully closed.
    pub fn record_close(&self, symbol: &str, lane: LaneKind, at: DateTime<Utc>) {
        let mut entries = self.entries.write();
        let e = entries.entry((symbol.to_string(), lane)).or_default();
        e.last_trade_at = Some(at);
        e.open_positions = e.open_positions.saturating_sub(1);
        debug!(symbol, lane = %lane, open = e.open_positions, "ledger: close recorded");
    }

    /// A fill that does not change the open count (e.g. a partial close).
    pub fn record_trade(&self, symbol: &str, lane: LaneKind, at: DateTime<Utc>) {
        let mut entries = self.entries.write();
        entries.entry((symbol.to_string(), lane)).or_default().last_trade_at = Some(at);
    }

    /// Book a lane result the way an execution collaborator would after a
    /// successful fill. HOLD and SKIP are ignored.
    pub fn apply(&self, result: &LaneResult) {
        match result.decision {
            Decision::Open => self.record_open(&result.symbol, result.lane, result.at),
            Decision::Close if result.is_partial() => {
                self.record_trade(&result.symbol, result.lane, result.at)
            }
            Decision::Close => self.record_close(&result.symbol, result.lane, result.at),
            Decision::Hold | Decision::Skip => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Checker
// ---------------------------------------------------------------------------

/// Evaluate all guardrails for an entry on (symbol, lane) at `now`.
pub fn check_guardrails(
    symbol: &str,
    lane: LaneKind,
    now: DateTime<Utc>,
    ledger: &GuardrailLedger,
    limits: &GuardrailLimits,
) -> GuardrailVerdict {
    let entry = ledger.entry(symbol, lane).unwrap_or_default();

    if let Some(last) = entry.last_trade_at {
        // Clock skew (last trade "in the future") counts as zero elapsed.
        let elapsed = ((now - last).num_seconds() as f64 / 60.0).max(0.0);

        if elapsed < limits.min_hold_minutes {
            return GuardrailVerdict::block(
                GuardrailKey::MinHold,
                format!(
                    "min hold: {:.1}m since last trade < {:.1}m",
                    elapsed, limits.min_hold_minutes
                ),
            );
        }

        if elapsed < limits.cooldown_minutes {
            return GuardrailVerdict::block(
                GuardrailKey::Cooldown,
                format!(
                    "cooldown: {:.1}m remaining of {:.1}m",
                    limits.cooldown_minutes - elapsed,
                    limits.cooldown_minutes
                ),
            );
        }
    }

    if entry.open_positions >= limits.max_positions_per_symbol {
        return GuardrailVerdict::block(
            GuardrailKey::MaxPositions,
            format!(
                "max positions: {} open >= {} allowed",
                entry.open_positions, limits.max_positions_per_symbol
            ),
        );
    }

    GuardrailVerdict::pass()
}
