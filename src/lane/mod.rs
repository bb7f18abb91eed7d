// =============================================================================
// Lanes — independent per-symbol strategies sharing one snapshot stream
// =============================================================================
//
// Every lane exposes the same contract:
//   is_allowed(symbol, policy)   — permission + quarantine, no side effects
//   execute_tick(slot, ctx)      — advance one (lane, symbol) by one tick
//   get_risk_profile()           — sizing relative to the baseline core risk
//
// Lanes never hold per-symbol state themselves; the dispatcher owns one
// `LaneSlot` per (lane, symbol) and hands it in on every tick. Entry gates
// (permission, quarantine, guardrails) apply only while flat; an open
// position always runs its exit logic.
// =============================================================================

pub mod expansion;
pub mod result;
pub mod setup;
pub mod signal;
pub mod state;

pub use expansion::{ExpansionLane, ExpansionParams};
pub use result::{Decision, LaneResult};
pub use setup::{CostModel, EntryTrigger};
pub use signal::{SignalLane, SignalLaneParams};
pub use state::{LanePhase, LaneSlot, LaneState, Position};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::guardrails::{check_guardrails, GuardrailLedger, GuardrailLimits};
use crate::types::{PolicyState, SignalSnapshot};

// =============================================================================
// Lane identity
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneKind {
    Core,
    Expansion,
    Scalp,
    Exploration,
    Recovery,
}

impl LaneKind {
    pub const ALL: [LaneKind; 5] = [
        LaneKind::Core,
        LaneKind::Expansion,
        LaneKind::Scalp,
        LaneKind::Exploration,
        LaneKind::Recovery,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Expansion => "expansion",
            Self::Scalp => "scalp",
            Self::Exploration => "exploration",
            Self::Recovery => "recovery",
        }
    }

    /// Policy flag that must be explicitly `true` before the lane may enter.
    /// The core lane needs none.
    pub fn permission_flag(self) -> Option<&'static str> {
        match self {
            Self::Core => None,
            Self::Expansion => Some("allow_expansion"),
            Self::Scalp => Some("allow_scalp"),
            Self::Exploration => Some("allow_exploration"),
            Self::Recovery => Some("allow_recovery"),
        }
    }

    pub fn quarantine_policy(self) -> QuarantinePolicy {
        match self {
            Self::Core | Self::Scalp => QuarantinePolicy::Block,
            Self::Expansion | Self::Exploration => QuarantinePolicy::Allow,
            Self::Recovery => QuarantinePolicy::Require,
        }
    }
}

impl std::fmt::Display for LaneKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a lane treats quarantined symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantinePolicy {
    /// Never trade a quarantined symbol.
    Block,
    /// Trade regardless (earn-back path).
    Allow,
    /// Trade only quarantined symbols.
    Require,
}

// =============================================================================
// Entry gate
// =============================================================================

/// Why an entry was refused before any setup logic ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blocked {
    pub reason: String,
    pub reason_key: String,
}

impl Blocked {
    fn new(reason: impl Into<String>, reason_key: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            reason_key: reason_key.into(),
        }
    }

    pub fn into_result(self, lane: LaneKind, symbol: &str, at: DateTime<Utc>) -> LaneResult {
        LaneResult::skip(lane, symbol, at, self.reason, self.reason_key).with_tag("blocked")
    }
}

/// Permission and quarantine checks only.
pub fn check_access(lane: LaneKind, symbol: &str, policy: &PolicyState) -> Result<(), Blocked> {
    if let Some(flag) = lane.permission_flag() {
        if !policy.allows(flag) {
            return Err(Blocked::new("requires_explicit_allow_permission", "permission"));
        }
    }

    let quarantined = policy.is_quarantined(symbol);
    match lane.quarantine_policy() {
        QuarantinePolicy::Block if quarantined => Err(Blocked::new("symbol_quarantined", "quarantine")),
        QuarantinePolicy::Require if !quarantined => {
            Err(Blocked::new("requires_quarantined_symbol", "quarantine"))
        }
        _ => Ok(()),
    }
}

/// Full entry gate: permission, quarantine, then guardrails.
pub fn gate_entry(
    lane: LaneKind,
    limits: &GuardrailLimits,
    symbol: &str,
    policy: &PolicyState,
    ledger: &GuardrailLedger,
    now: DateTime<Utc>,
) -> Result<(), Blocked> {
    check_access(lane, symbol, policy)?;

    let verdict = check_guardrails(symbol, lane, now, ledger, limits);
    if !verdict.allowed {
        let key = verdict.reason_key.map(|k| k.as_str()).unwrap_or("guardrail");
        return Err(Blocked::new(verdict.reason, key));
    }
    Ok(())
}

// =============================================================================
// Tick context & risk profile
// =============================================================================

/// Read-only inputs for one (lane, symbol) tick.
#[derive(Debug, Clone, Copy)]
pub struct TickContext<'a> {
    pub snapshot: &'a SignalSnapshot,
    pub policy: &'a PolicyState,
    pub ledger: &'a GuardrailLedger,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskProfile {
    pub lane: LaneKind,
    /// Fraction of the baseline core risk.
    pub risk_multiplier: f64,
    pub baseline_risk_pct: f64,
    pub effective_risk_pct: f64,
    pub max_positions_per_symbol: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_flag: Option<&'static str>,
    pub quarantine_policy: QuarantinePolicy,
}

impl RiskProfile {
    pub fn new(lane: LaneKind, risk_multiplier: f64, baseline_risk_pct: f64, max_positions_per_symbol: u32) -> Self {
        Self {
            lane,
            risk_multiplier,
            baseline_risk_pct,
            effective_risk_pct: risk_multiplier * baseline_risk_pct,
            max_positions_per_symbol,
            permission_flag: lane.permission_flag(),
            quarantine_policy: lane.quarantine_policy(),
        }
    }
}

// =============================================================================
// Lane
// =============================================================================

/// Closed set of lane implementations.
#[derive(Debug, Clone)]
pub enum Lane {
    Expansion(ExpansionLane),
    Signal(SignalLane),
}

impl Lane {
    pub fn kind(&self) -> LaneKind {
        match self {
            Self::Expansion(_) => LaneKind::Expansion,
            Self::Signal(lane) => lane.kind(),
        }
    }

    /// Whether the lane may open a new position on `symbol` under `policy`.
    /// Guardrails are time-dependent and are checked in `execute_tick`.
    pub fn is_allowed(&self, symbol: &str, policy: &PolicyState) -> bool {
        check_access(self.kind(), symbol, policy).is_ok()
    }

    pub fn execute_tick(&self, slot: &mut LaneSlot, ctx: &TickContext<'_>) -> LaneResult {
        match self {
            Self::Expansion(lane) => lane.execute_tick(slot, ctx),
            Self::Signal(lane) => lane.execute_tick(slot, ctx),
        }
    }

    pub fn get_risk_profile(&self) -> RiskProfile {
        match self {
            Self::Expansion(lane) => lane.risk_profile(),
            Self::Signal(lane) => lane.risk_profile(),
        }
    }
}
