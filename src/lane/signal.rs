// =============================================================================
// Signal Lanes — core / scalp / exploration / recovery
// =============================================================================
//
// Follow the upstream directional signal. While flat a lane opens in the
// signal direction once confidence clears its floor; while in position it
// delegates to the regime exit rule table, evaluated with the regime of the
// current snapshot.
//
// The four lanes share this code and differ only in permission flag,
// quarantine policy, confidence floor and risk multiplier.
// =============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::result::{Decision, LaneResult};
use super::state::{LaneSlot, Position};
use super::{gate_entry, LaneKind, RiskProfile, TickContext};
use crate::exit::{ExitInput, ExitRuleTable};
use crate::guardrails::GuardrailLimits;

fn default_entry_conf_min() -> f64 {
    0.60
}

fn default_risk_multiplier() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalLaneParams {
    /// Minimum upstream confidence for an entry.
    #[serde(default = "default_entry_conf_min")]
    pub entry_conf_min: f64,
    #[serde(default = "default_risk_multiplier")]
    pub risk_multiplier: f64,
}

impl Default for SignalLaneParams {
    fn default() -> Self {
        Self {
            entry_conf_min: default_entry_conf_min(),
            risk_multiplier: default_risk_multiplier(),
        }
    }
}

impl SignalLaneParams {
    /// Stock parameters for each signal-following lane.
    pub fn for_kind(kind: LaneKind) -> Self {
        let (entry_conf_min, risk_multiplier) = match kind {
            LaneKind::Core => (0.60, 1.0),
            LaneKind::Scalp => (0.70, 0.5),
            LaneKind::Exploration => (0.50, 0.15),
            LaneKind::Recovery => (0.65, 0.10),
            // Not a signal lane; core numbers keep the call total.
            LaneKind::Expansion => (0.60, 1.0),
        };
        Self {
            entry_conf_min,
            risk_multiplier,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalLane {
    kind: LaneKind,
    params: SignalLaneParams,
    limits: GuardrailLimits,
    exit_rules: Arc<ExitRuleTable>,
    baseline_risk_pct: f64,
}

impl SignalLane {
    pub fn new(
        kind: LaneKind,
        params: SignalLaneParams,
        limits: GuardrailLimits,
        exit_rules: Arc<ExitRuleTable>,
        baseline_risk_pct: f64,
    ) -> Self {
        Self {
            kind,
            params,
            limits,
            exit_rules,
            baseline_risk_pct,
        }
    }

    pub fn kind(&self) -> LaneKind {
        self.kind
    }

    pub fn params(&self) -> &SignalLaneParams {
        &self.params
    }

    pub fn risk_profile(&self) -> RiskProfile {
        RiskProfile::new(
            self.kind,
            self.params.risk_multiplier,
            self.baseline_risk_pct,
            self.limits.max_positions_per_symbol,
        )
    }

    pub fn execute_tick(&self, slot: &mut LaneSlot, ctx: &TickContext<'_>) -> LaneResult {
        let result = if slot.position().is_some() {
            self.manage_position(slot, ctx)
        } else {
            self.try_enter(slot, ctx)
        };
        debug!(
            lane = %self.kind,
            symbol = %ctx.snapshot.symbol,
            decision = %result.decision,
            reason = %result.reason,
            "signal lane tick"
        );
        result
    }

    fn try_enter(&self, slot: &mut LaneSlot, ctx: &TickContext<'_>) -> LaneResult {
        let snap = ctx.snapshot;
        let symbol = snap.symbol.as_str();

        if let Err(blocked) = gate_entry(self.kind, &self.limits, symbol, ctx.policy, ctx.ledger, ctx.now) {
            return blocked.into_result(self.kind, symbol, ctx.now);
        }
        if !snap.is_usable() {
            return LaneResult::hold(self.kind, symbol, ctx.now, "insufficient_data");
        }
        if snap.is_dead_chop() {
            return LaneResult::hold(self.kind, symbol, ctx.now, "dead_chop");
        }
        if snap.direction.is_flat() {
            return LaneResult::hold(self.kind, symbol, ctx.now, "no_signal");
        }
        if snap.confidence.is_nan() || snap.confidence < self.params.entry_conf_min {
            return LaneResult::hold(self.kind, symbol, ctx.now, "low_confidence")
                .with_meta("confidence", snap.confidence)
                .with_meta("entry_conf_min", self.params.entry_conf_min);
        }

        let position = Position::new(
            self.kind,
            symbol,
            ctx.now,
            snap.direction,
            snap.close,
            snap.atr,
            snap.close,
            &snap.regime,
        );
        let position_id = position.id.clone();
        slot.open(position);

        info!(
            lane = %self.kind,
            symbol,
            direction = %snap.direction,
            entry = snap.close,
            confidence = format!("{:.3}", snap.confidence),
            regime = %snap.regime,
            "signal entry"
        );

        let mut result = LaneResult::new(self.kind, symbol, ctx.now, Decision::Open, "signal_entry")
            .with_risk(self.params.risk_multiplier)
            .with_tag(self.kind.as_str())
            .with_meta("position_id", position_id)
            .with_meta("direction", i8::from(snap.direction))
            .with_meta("confidence", snap.confidence)
            .with_meta("regime", snap.regime.clone());
        if ctx.policy.is_quarantined(symbol) {
            result = result.with_tag("earn_back");
        }
        result
    }

    fn manage_position(&self, slot: &mut LaneSlot, ctx: &TickContext<'_>) -> LaneResult {
        let snap = ctx.snapshot;
        let symbol = snap.symbol.as_str();
        if !(snap.close.is_finite() && snap.close > 0.0) {
            return LaneResult::hold(self.kind, symbol, ctx.now, "insufficient_data").with_tag("in_position");
        }

        let Some(pos) = slot.position_mut() else {
            return LaneResult::hold(self.kind, symbol, ctx.now, "no_position");
        };
        pos.bars_open = pos.bars_open.saturating_add(1);
        let input = ExitInput {
            bars_open: pos.bars_open,
            direction: pos.direction,
            entry_price: pos.entry_price,
            last_price: snap.close,
            final_conf: snap.confidence,
            sl_conf: None,
            tp_conf: None,
        };
        let bars_open = pos.bars_open;
        let unrealized = pos.unrealized_return(snap.close);

        let Some(signal) = self.exit_rules.evaluate(&snap.regime, &input) else {
            return LaneResult::hold(self.kind, symbol, ctx.now, "holding")
                .with_tag("in_position")
                .with_meta("bars_open", bars_open)
                .with_meta("unrealized_return", unrealized);
        };

        let closed = slot.close();
        info!(
            lane = %self.kind,
            symbol,
            reason = %signal.reason,
            bars_open,
            signed_return = format!("{:.5}", signal.signed_return),
            "signal exit"
        );

        let mut result = LaneResult::new(self.kind, symbol, ctx.now, Decision::Close, signal.reason.as_str())
            .with_exit(signal.reason)
            .with_meta("bars_open", bars_open)
            .with_meta("exit_price", snap.close)
            .with_meta("realized_return", signal.signed_return)
            .with_meta("exit_conf", signal.conf)
            .with_meta("regime", snap.regime.clone());
        if let Some(pos) = closed {
            result = result.with_meta("position_id", pos.id);
        }
        result
    }
}
