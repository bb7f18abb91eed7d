// =============================================================================
// Lane Result — auditable record of every per-tick lane decision
// =============================================================================
//
// One `LaneResult` is produced per tick per (lane, symbol). Control flow is
// carried by typed fields (`decision`, `exit_reason`, `entry_trigger`); the
// tag set and metadata map are free-form audit detail only. Both use ordered
// collections so that replays serialise byte-for-byte identically.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::setup::EntryTrigger;
use super::LaneKind;
use crate::exit::ExitReason;

/// Final per-tick decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Open,
    Close,
    Hold,
    Skip,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Close => write!(f, "CLOSE"),
            Self::Hold => write!(f, "HOLD"),
            Self::Skip => write!(f, "SKIP"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaneResult {
    pub lane: LaneKind,
    pub symbol: String,
    /// Tick timestamp supplied by the caller.
    pub at: DateTime<Utc>,
    pub decision: Decision,
    /// Human-readable reason.
    pub reason: String,
    /// Stable machine key for blocks (`cooldown`, `permission`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<ExitReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_trigger: Option<EntryTrigger>,
    /// Fraction of the baseline unit risk; non-zero only on OPEN.
    pub risk_multiplier: f64,
    pub tags: BTreeSet<String>,
    pub metadata: BTreeMap<String, Value>,
}

impl LaneResult {
    pub fn new(
        lane: LaneKind,
        symbol: impl Into<String>,
        at: DateTime<Utc>,
        decision: Decision,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            lane,
            symbol: symbol.into(),
            at,
            decision,
            reason: reason.into(),
            reason_key: None,
            exit_reason: None,
            entry_trigger: None,
            risk_multiplier: 0.0,
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn hold(lane: LaneKind, symbol: &str, at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self::new(lane, symbol, at, Decision::Hold, reason)
    }

    pub fn skip(
        lane: LaneKind,
        symbol: &str,
        at: DateTime<Utc>,
        reason: impl Into<String>,
        reason_key: impl Into<String>,
    ) -> Self {
        Self::new(lane, symbol, at, Decision::Skip, reason).with_key(reason_key)
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.reason_key = Some(key.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_risk(mut self, multiplier: f64) -> Self {
        self.risk_multiplier = multiplier;
        self
    }

    pub fn with_exit(mut self, reason: ExitReason) -> Self {
        self.exit_reason = Some(reason);
        self.tags.insert(reason.to_string());
        self
    }

    pub fn with_trigger(mut self, trigger: EntryTrigger) -> Self {
        self.entry_trigger = Some(trigger);
        self.tags.insert(trigger.to_string());
        self
    }

    /// Partial close; the position stays open afterwards.
    pub fn is_partial(&self) -> bool {
        self.decision == Decision::Close && self.exit_reason.is_some_and(ExitReason::is_partial)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}
