// =============================================================================
// Lane Dispatcher — lanes × symbols, once per tick
// =============================================================================
//
// Owns the slot arena: one `LaneSlot` per (lane, symbol), created lazily the
// first time a symbol shows up for a lane. Each tick walks the enabled lanes
// in configuration order and, within a lane, the snapshots in input order.
//
// A tick whose timestamp is not strictly after the slot's last applied tick
// is answered with SKIP "stale_tick" and leaves the slot untouched, so a
// replayed or duplicated snapshot can never advance a state machine twice.
//
// The dispatcher never writes to the guardrail ledger. Fills are booked by
// whoever executes the results (see `GuardrailLedger::apply`).
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::exit::ExitRuleTable;
use crate::guardrails::GuardrailLedger;
use crate::lane::{
    ExpansionLane, Lane, LaneKind, LaneResult, LaneSlot, Position, RiskProfile, SignalLane,
    TickContext,
};
use crate::runtime_config::RuntimeConfig;
use crate::types::{PolicyState, SignalSnapshot};

type SlotKey = (LaneKind, String);

pub struct LaneDispatcher {
    lanes: Vec<Lane>,
    slots: HashMap<SlotKey, LaneSlot>,
    ledger: Arc<GuardrailLedger>,
}

impl LaneDispatcher {
    pub fn new(lanes: Vec<Lane>, ledger: Arc<GuardrailLedger>) -> Self {
        Self {
            lanes,
            slots: HashMap::new(),
            ledger,
        }
    }

    /// Build the enabled lanes from `config`. A lane listed twice runs once.
    pub fn from_config(
        config: &RuntimeConfig,
        exit_rules: Arc<ExitRuleTable>,
        ledger: Arc<GuardrailLedger>,
    ) -> Self {
        let mut seen = BTreeSet::new();
        let mut lanes = Vec::with_capacity(config.enabled_lanes.len());

        for &kind in &config.enabled_lanes {
            if !seen.insert(kind) {
                warn!(lane = %kind, "lane listed twice in config, ignoring duplicate");
                continue;
            }
            let limits = config.guardrails_for(kind);
            let lane = match config.signal_params(kind) {
                Some(params) => Lane::Signal(SignalLane::new(
                    kind,
                    params.clone(),
                    limits,
                    Arc::clone(&exit_rules),
                    config.baseline_risk_pct,
                )),
                None => Lane::Expansion(ExpansionLane::new(
                    config.expansion.clone(),
                    limits,
                    config.baseline_risk_pct,
                )),
            };
            lanes.push(lane);
        }

        info!(
            lanes = ?lanes.iter().map(Lane::kind).collect::<Vec<_>>(),
            baseline_risk_pct = config.baseline_risk_pct,
            "lane dispatcher ready"
        );
        Self::new(lanes, ledger)
    }

    pub fn ledger(&self) -> &Arc<GuardrailLedger> {
        &self.ledger
    }

    pub fn lanes(&self) -> &[Lane] {
        &self.lanes
    }

    /// Run every enabled lane over every snapshot. Returns one result per
    /// (lane, snapshot), lanes outer, snapshots inner.
    pub fn tick(
        &mut self,
        now: DateTime<Utc>,
        snapshots: &[SignalSnapshot],
        policy: &PolicyState,
    ) -> Vec<LaneResult> {
        let mut results = Vec::with_capacity(self.lanes.len() * snapshots.len());

        for lane in &self.lanes {
            let kind = lane.kind();
            for snap in snapshots {
                let slot = self
                    .slots
                    .entry((kind, snap.symbol.clone()))
                    .or_default();

                if let Some(last) = slot.last_tick_at() {
                    if now <= last {
                        debug!(lane = %kind, symbol = %snap.symbol, %now, %last, "stale tick");
                        results.push(
                            LaneResult::skip(kind, &snap.symbol, now, "stale_tick", "stale_tick")
                                .with_meta("last_tick_at", last.to_rfc3339()),
                        );
                        continue;
                    }
                }

                let ctx = TickContext {
                    snapshot: snap,
                    policy,
                    ledger: &self.ledger,
                    now,
                };
                let result = lane.execute_tick(slot, &ctx);
                slot.mark_tick(now);
                results.push(result);
            }
        }

        results
    }

    pub fn slot(&self, lane: LaneKind, symbol: &str) -> Option<&LaneSlot> {
        self.slots.get(&(lane, symbol.to_string()))
    }

    /// Every open position, ordered by (lane, symbol).
    pub fn open_positions(&self) -> Vec<(LaneKind, &str, &Position)> {
        let mut out: Vec<_> = self
            .slots
            .iter()
            .filter_map(|((lane, symbol), slot)| slot.position().map(|p| (*lane, symbol.as_str(), p)))
            .collect();
        out.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        out
    }

    pub fn risk_profiles(&self) -> Vec<RiskProfile> {
        self.lanes.iter().map(Lane::get_risk_profile).collect()
    }

    /// Symbols with at least one slot, sorted.
    pub fn tracked_symbols(&self) -> Vec<&str> {
        let set: BTreeSet<&str> = self.slots.keys().map(|(_, s)| s.as_str()).collect();
        set.into_iter().collect()
    }

    /// Drop every slot for `symbol`. Refuses (and returns `false`) while any
    /// lane still holds a position on it.
    pub fn untrack_symbol(&mut self, symbol: &str) -> bool {
        let holding = self
            .slots
            .iter()
            .any(|((_, s), slot)| s == symbol && slot.position().is_some());
        if holding {
            warn!(symbol, "untrack refused: position still open");
            return false;
        }
        self.slots.retain(|(_, s), _| s != symbol);
        info!(symbol, "symbol untracked");
        true
    }
}

impl std::fmt::Debug for LaneDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaneDispatcher")
            .field("lanes", &self.lanes.iter().map(Lane::kind).collect::<Vec<_>>())
            .field("slots", &self.slots.len())
            .finish()
    }
}
