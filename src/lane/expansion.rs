// =============================================================================
// Expansion Lane — impulse / pullback / re-acceleration state machine
// =============================================================================
//
// Entry pipeline (one step per tick):
//   1. Idle             — impulse strength >= threshold, micro-regime not
//                          dead_chop                        → ImpulseDetected
//   2. ImpulseDetected  — retrace into [min, max] ATR from the break level
//                                                            → PullbackTracking
//   3. PullbackTracking — re-acceleration trigger inside the bar window,
//                          then the cost-sanity veto        → Armed
//   4. Armed            — entry execution                   → InPosition
//
// Window expiry, a pullback deeper than the band, or a failed cost check
// reset the setup to Idle. Entry is gated every tick by the explicit
// `allow_expansion` permission and the guardrails; quarantined symbols may
// still trade here (earn-back path).
//
// Exit ladder while in position (first match wins):
//   1. Invalidation stop   min(pullback_low - 0.2 ATRe, entry - 0.9 ATRe)
//   2. TP1                 partial close, arms the ATR trail
//   3. ATR trail           after TP1
//   4. Momentum decay      after TP1: 2 adverse closes or ATR contraction
//   5. Time stop           bars_open >= time_stop_bars
//   6. Hold                tighten the trail after TP1
//
// Sizing is a fixed fraction of the baseline core risk.
// =============================================================================

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::result::{Decision, LaneResult};
use super::setup::{
    closes_against, cost_sanity, detect_reaccel, impulse_strength, retrace_depth_atr, CostModel,
};
use super::state::{LanePhase, LaneSlot, Position};
use super::{gate_entry, LaneKind, RiskProfile, TickContext};
use crate::exit::trail::{is_breached, ratchet, trail_level};
use crate::exit::ExitReason;
use crate::guardrails::GuardrailLimits;
use crate::types::{Direction, SignalSnapshot};

// =============================================================================
// Parameters
// =============================================================================

fn default_impulse_threshold() -> f64 {
    1.5
}
fn default_impulse_lookback_bars() -> usize {
    3
}
fn default_pullback_atr_min() -> f64 {
    0.3
}
fn default_pullback_atr_max() -> f64 {
    1.2
}
fn default_reaccel_window_bars() -> u32 {
    8
}
fn default_reaccel_bar_return_atr() -> f64 {
    0.25
}
fn default_expected_move_atr_multiplier() -> f64 {
    1.5
}
fn default_cost_buffer_multiplier() -> f64 {
    3.0
}
fn default_invalidation_pullback_atr() -> f64 {
    0.2
}
fn default_invalidation_entry_atr() -> f64 {
    0.9
}
fn default_tp1_atr_multiplier() -> f64 {
    1.0
}
fn default_tp1_close_fraction() -> f64 {
    0.5
}
fn default_atr_trail_multiplier() -> f64 {
    1.0
}
fn default_atr_decay_ratio() -> f64 {
    0.6
}
fn default_time_stop_bars() -> u32 {
    24
}
fn default_risk_multiplier() -> f64 {
    0.25
}
fn default_bar_minutes() -> i64 {
    60
}

/// Tunables for the expansion lane. All of them are lane-local.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpansionParams {
    /// Minimum impulse strength, in ATR units.
    #[serde(default = "default_impulse_threshold")]
    pub impulse_threshold: f64,
    #[serde(default = "default_impulse_lookback_bars")]
    pub impulse_lookback_bars: usize,
    #[serde(default = "default_pullback_atr_min")]
    pub pullback_atr_min: f64,
    /// Retrace deeper than this invalidates the impulse.
    #[serde(default = "default_pullback_atr_max")]
    pub pullback_atr_max: f64,
    /// Bars after the impulse within which re-acceleration must fire.
    #[serde(default = "default_reaccel_window_bars")]
    pub reaccel_window_bars: u32,
    #[serde(default = "default_reaccel_bar_return_atr")]
    pub reaccel_bar_return_atr: f64,
    #[serde(default = "default_expected_move_atr_multiplier")]
    pub expected_move_atr_multiplier: f64,
    #[serde(default = "default_cost_buffer_multiplier")]
    pub cost_buffer_multiplier: f64,
    #[serde(default)]
    pub costs: CostModel,
    #[serde(default = "default_invalidation_pullback_atr")]
    pub invalidation_pullback_atr: f64,
    #[serde(default = "default_invalidation_entry_atr")]
    pub invalidation_entry_atr: f64,
    #[serde(default = "default_tp1_atr_multiplier")]
    pub tp1_atr_multiplier: f64,
    /// Share of the position closed at TP1 (audit only; execution sizes it).
    #[serde(default = "default_tp1_close_fraction")]
    pub tp1_close_fraction: f64,
    #[serde(default = "default_atr_trail_multiplier")]
    pub atr_trail_multiplier: f64,
    #[serde(default = "default_atr_decay_ratio")]
    pub atr_decay_ratio: f64,
    #[serde(default = "default_time_stop_bars")]
    pub time_stop_bars: u32,
    /// Fraction of the baseline core risk used for entries.
    #[serde(default = "default_risk_multiplier")]
    pub risk_multiplier: f64,
    /// Bar length when the snapshot timeframe is not recognised.
    #[serde(default = "default_bar_minutes")]
    pub default_bar_minutes: i64,
}

impl Default for ExpansionParams {
    fn default() -> Self {
        Self {
            impulse_threshold: default_impulse_threshold(),
            impulse_lookback_bars: default_impulse_lookback_bars(),
            pullback_atr_min: default_pullback_atr_min(),
            pullback_atr_max: default_pullback_atr_max(),
            reaccel_window_bars: default_reaccel_window_bars(),
            reaccel_bar_return_atr: default_reaccel_bar_return_atr(),
            expected_move_atr_multiplier: default_expected_move_atr_multiplier(),
            cost_buffer_multiplier: default_cost_buffer_multiplier(),
            costs: CostModel::default(),
            invalidation_pullback_atr: default_invalidation_pullback_atr(),
            invalidation_entry_atr: default_invalidation_entry_atr(),
            tp1_atr_multiplier: default_tp1_atr_multiplier(),
            tp1_close_fraction: default_tp1_close_fraction(),
            atr_trail_multiplier: default_atr_trail_multiplier(),
            atr_decay_ratio: default_atr_decay_ratio(),
            time_stop_bars: default_time_stop_bars(),
            risk_multiplier: default_risk_multiplier(),
            default_bar_minutes: default_bar_minutes(),
        }
    }
}

/// `value` if it passes `valid`, else `fallback` with a warning.
fn checked(name: &str, value: f64, fallback: f64, valid: impl Fn(f64) -> bool) -> f64 {
    if value.is_finite() && valid(value) {
        value
    } else {
        warn!(param = name, value, fallback, "invalid expansion param, using default");
        fallback
    }
}

impl ExpansionParams {
    /// Replace out-of-range values with their defaults. A bad value never
    /// disables a check: the bar length stays positive and the pullback band
    /// stays ordered.
    pub fn sanitized(mut self) -> Self {
        if self.default_bar_minutes <= 0 {
            warn!(value = self.default_bar_minutes, "default_bar_minutes must be positive, using default");
            self.default_bar_minutes = default_bar_minutes();
        }
        if self.impulse_lookback_bars == 0 {
            warn!("impulse_lookback_bars must be positive, using default");
            self.impulse_lookback_bars = default_impulse_lookback_bars();
        }

        let positive = |v: f64| v > 0.0;
        let non_negative = |v: f64| v >= 0.0;
        self.impulse_threshold = checked("impulse_threshold", self.impulse_threshold, default_impulse_threshold(), positive);
        self.pullback_atr_min = checked("pullback_atr_min", self.pullback_atr_min, default_pullback_atr_min(), non_negative);
        self.pullback_atr_max = checked("pullback_atr_max", self.pullback_atr_max, default_pullback_atr_max(), positive);
        if self.pullback_atr_min > self.pullback_atr_max {
            warn!(
                min = self.pullback_atr_min,
                max = self.pullback_atr_max,
                "pullback band inverted, using default band"
            );
            self.pullback_atr_min = default_pullback_atr_min();
            self.pullback_atr_max = default_pullback_atr_max();
        }
        self.reaccel_bar_return_atr = checked("reaccel_bar_return_atr", self.reaccel_bar_return_atr, default_reaccel_bar_return_atr(), non_negative);
        self.expected_move_atr_multiplier = checked("expected_move_atr_multiplier", self.expected_move_atr_multiplier, default_expected_move_atr_multiplier(), positive);
        self.cost_buffer_multiplier = checked("cost_buffer_multiplier", self.cost_buffer_multiplier, default_cost_buffer_multiplier(), non_negative);
        self.invalidation_pullback_atr = checked("invalidation_pullback_atr", self.invalidation_pullback_atr, default_invalidation_pullback_atr(), non_negative);
        self.invalidation_entry_atr = checked("invalidation_entry_atr", self.invalidation_entry_atr, default_invalidation_entry_atr(), non_negative);
        self.tp1_atr_multiplier = checked("tp1_atr_multiplier", self.tp1_atr_multiplier, default_tp1_atr_multiplier(), positive);
        self.tp1_close_fraction = checked("tp1_close_fraction", self.tp1_close_fraction, default_tp1_close_fraction(), |v| v > 0.0 && v <= 1.0);
        self.atr_trail_multiplier = checked("atr_trail_multiplier", self.atr_trail_multiplier, default_atr_trail_multiplier(), positive);
        self.atr_decay_ratio = checked("atr_decay_ratio", self.atr_decay_ratio, default_atr_decay_ratio(), non_negative);
        self.risk_multiplier = checked("risk_multiplier", self.risk_multiplier, default_risk_multiplier(), non_negative);
        self
    }
}

// =============================================================================
// Exit ladder
// =============================================================================

/// Invalidation stop for `pos`: the farther of the pullback-based and the
/// entry-based levels.
pub fn invalidation_stop(pos: &Position, p: &ExpansionParams) -> f64 {
    let atr = pos.atr_at_entry;
    match pos.direction {
        Direction::Short => (pos.pullback_extreme + p.invalidation_pullback_atr * atr)
            .max(pos.entry_price + p.invalidation_entry_atr * atr),
        _ => (pos.pullback_extreme - p.invalidation_pullback_atr * atr)
            .min(pos.entry_price - p.invalidation_entry_atr * atr),
    }
}

pub fn tp1_level(pos: &Position, p: &ExpansionParams) -> f64 {
    pos.entry_price + pos.direction.sign() * p.tp1_atr_multiplier * pos.atr_at_entry
}

/// Run one tick of the exit ladder against `pos`.
///
/// Mutates the position: bumps `bars_open`, flips `tp1_hit` and moves the
/// trailing stop. Returns the exit that fired, if any. The caller must have
/// checked that `snap.close` is usable.
pub fn run_exit_ladder(
    pos: &mut Position,
    snap: &SignalSnapshot,
    p: &ExpansionParams,
) -> Option<ExitReason> {
    let price = snap.close;
    let dir = pos.direction;
    let s = dir.sign();
    let atr_now = (snap.atr.is_finite() && snap.atr > 0.0).then_some(snap.atr);

    pos.bars_open = pos.bars_open.saturating_add(1);

    // 1. Invalidation stop
    if is_breached(dir, price, invalidation_stop(pos, p)) {
        return Some(ExitReason::InvalidationStop);
    }

    // 2. TP1 (once)
    if !pos.tp1_hit && s * (price - tp1_level(pos, p)) >= 0.0 {
        pos.tp1_hit = true;
        let trail_atr = atr_now.unwrap_or(pos.atr_at_entry);
        if let Some(level) = trail_level(dir, price, trail_atr, p.atr_trail_multiplier) {
            pos.trailing_stop = Some(ratchet(dir, pos.trailing_stop, level));
        }
        return Some(ExitReason::TakeProfit1);
    }

    if pos.tp1_hit {
        // 3. ATR trail
        if let Some(level) = pos.trailing_stop {
            if is_breached(dir, price, level) {
                return Some(ExitReason::AtrTrail);
            }
        }

        // 4. Momentum decay
        let atr_contracted = atr_now.is_some_and(|atr| atr < p.atr_decay_ratio * pos.atr_at_entry);
        if closes_against(snap, dir, 2) || atr_contracted {
            return Some(ExitReason::MomentumDecay);
        }
    }

    // 5. Time stop
    if pos.bars_open >= p.time_stop_bars {
        return Some(ExitReason::TimeStop);
    }

    // 6. Hold; ratchet the trail toward price.
    if pos.tp1_hit {
        if let Some(level) = atr_now.and_then(|atr| trail_level(dir, price, atr, p.atr_trail_multiplier)) {
            pos.trailing_stop = Some(ratchet(dir, pos.trailing_stop, level));
        }
    }
    None
}

// =============================================================================
// ExpansionLane
// =============================================================================

#[derive(Debug, Clone)]
pub struct ExpansionLane {
    params: ExpansionParams,
    limits: GuardrailLimits,
    baseline_risk_pct: f64,
}

impl ExpansionLane {
    pub fn new(params: ExpansionParams, limits: GuardrailLimits, baseline_risk_pct: f64) -> Self {
        Self {
            params: params.sanitized(),
            limits,
            baseline_risk_pct,
        }
    }

    pub fn params(&self) -> &ExpansionParams {
        &self.params
    }

    pub fn limits(&self) -> &GuardrailLimits {
        &self.limits
    }

    pub fn risk_profile(&self) -> RiskProfile {
        RiskProfile::new(
            LaneKind::Expansion,
            self.params.risk_multiplier,
            self.baseline_risk_pct,
            self.limits.max_positions_per_symbol,
        )
    }

    /// Advance the state machine for one symbol by one tick.
    pub fn execute_tick(&self, slot: &mut LaneSlot, ctx: &TickContext<'_>) -> LaneResult {
        let result = if slot.position().is_some() {
            self.manage_position(slot, ctx)
        } else {
            self.advance_setup(slot, ctx)
        };

        let rsi = ctx.snapshot.rsi7;
        if rsi.is_finite() && (0.0..=100.0).contains(&rsi) {
            slot.state_mut().last_rsi = Some(rsi);
        }

        debug!(
            symbol = %ctx.snapshot.symbol,
            decision = %result.decision,
            reason = %result.reason,
            phase = %slot.phase(),
            "expansion tick"
        );
        result
    }

    // -------------------------------------------------------------------------
    // Entry side
    // -------------------------------------------------------------------------

    fn advance_setup(&self, slot: &mut LaneSlot, ctx: &TickContext<'_>) -> LaneResult {
        let snap = ctx.snapshot;
        let symbol = snap.symbol.as_str();

        if let Err(blocked) = gate_entry(
            LaneKind::Expansion,
            &self.limits,
            symbol,
            ctx.policy,
            ctx.ledger,
            ctx.now,
        ) {
            return blocked
                .into_result(LaneKind::Expansion, symbol, ctx.now)
                .with_meta("phase", slot.phase().to_string());
        }

        if !snap.is_usable() {
            return self.hold(ctx, "insufficient_data").with_meta("phase", slot.phase().to_string());
        }

        if slot.phase() != LanePhase::Idle {
            let bar = snap.bar_duration(Duration::minutes(self.params.default_bar_minutes));
            let window = slot.state().max_wait_bars;
            if let Some(bars) = slot.state().bars_since_impulse(ctx.now, bar.num_seconds()) {
                if bars > window {
                    debug!(symbol, bars, window, "re-acceleration window expired");
                    slot.reset_setup();
                    return self
                        .hold(ctx, "reaccel_window_expired")
                        .with_tag("reset")
                        .with_meta("bars_since_impulse", bars);
                }
            }
        }

        match slot.phase() {
            LanePhase::Idle => self.detect_impulse(slot, ctx),
            LanePhase::ImpulseDetected => self.track_retrace(slot, ctx),
            LanePhase::PullbackTracking => self.await_reaccel(slot, ctx),
            LanePhase::Armed => self.enter(slot, ctx),
            // Only reachable from a hand-built slot; repair it.
            LanePhase::InPosition => {
                slot.reset_setup();
                self.hold(ctx, "state_repaired").with_tag("reset")
            }
        }
    }

    fn detect_impulse(&self, slot: &mut LaneSlot, ctx: &TickContext<'_>) -> LaneResult {
        let snap = ctx.snapshot;
        if snap.is_dead_chop() {
            return self.hold(ctx, "dead_chop");
        }

        let (strength, direction) = impulse_strength(snap, self.params.impulse_lookback_bars);
        if strength < self.params.impulse_threshold || direction.is_flat() {
            return self.hold(ctx, "no_impulse").with_meta("impulse_strength", strength);
        }

        let state = slot.state_mut();
        state.phase = LanePhase::ImpulseDetected;
        state.impulse_at = Some(ctx.now);
        state.impulse_strength = strength;
        state.impulse_direction = direction;
        state.break_level = snap.close;
        state.pullback_extreme = snap.close;
        state.pullback_at = None;
        state.trigger = None;
        state.max_wait_bars = self.params.reaccel_window_bars;

        info!(
            symbol = %snap.symbol,
            direction = %direction,
            strength = format!("{:.3}", strength),
            break_level = snap.close,
            "impulse detected"
        );

        self.hold(ctx, "impulse_detected")
            .with_tag("impulse")
            .with_meta("impulse_strength", strength)
            .with_meta("break_level", snap.close)
            .with_meta("direction", i8::from(direction))
    }

    fn track_retrace(&self, slot: &mut LaneSlot, ctx: &TickContext<'_>) -> LaneResult {
        let snap = ctx.snapshot;
        let p = &self.params;
        let state = slot.state_mut();
        let depth = retrace_depth_atr(state.impulse_direction, state.break_level, snap.close, snap.atr);

        if depth < 0.0 {
            state.break_level = snap.close;
            state.pullback_extreme = snap.close;
            return self
                .hold(ctx, "impulse_extending")
                .with_meta("break_level", snap.close);
        }

        if depth > p.pullback_atr_max {
            slot.reset_setup();
            return self
                .hold(ctx, "pullback_invalidated")
                .with_tag("reset")
                .with_meta("pullback_depth_atr", depth);
        }

        if depth >= p.pullback_atr_min {
            state.phase = LanePhase::PullbackTracking;
            state.pullback_extreme = snap.close;
            state.pullback_at = Some(ctx.now);
            debug!(symbol = %snap.symbol, depth, "pullback in band");
            return self
                .hold(ctx, "pullback_tracking")
                .with_meta("pullback_depth_atr", depth);
        }

        self.hold(ctx, "awaiting_pullback").with_meta("pullback_depth_atr", depth)
    }

    fn await_reaccel(&self, slot: &mut LaneSlot, ctx: &TickContext<'_>) -> LaneResult {
        let snap = ctx.snapshot;
        let p = &self.params;
        let state = slot.state_mut();
        let dir = state.impulse_direction;

        // Deepen the recorded pullback if price went further against us.
        if retrace_depth_atr(dir, state.pullback_extreme, snap.close, snap.atr) > 0.0 {
            state.pullback_extreme = snap.close;
            state.pullback_at = Some(ctx.now);
        }
        let depth = retrace_depth_atr(dir, state.break_level, state.pullback_extreme, snap.atr);
        if depth > p.pullback_atr_max {
            slot.reset_setup();
            return self
                .hold(ctx, "pullback_invalidated")
                .with_tag("reset")
                .with_meta("pullback_depth_atr", depth);
        }

        let Some(trigger) = detect_reaccel(snap, dir, state.last_rsi, p.reaccel_bar_return_atr) else {
            return self
                .hold(ctx, "awaiting_reacceleration")
                .with_meta("pullback_depth_atr", depth);
        };

        let cost = cost_sanity(
            snap.close,
            snap.atr,
            p.expected_move_atr_multiplier,
            p.cost_buffer_multiplier,
            &p.costs,
        );
        if !cost.passed {
            info!(
                symbol = %snap.symbol,
                trigger = %trigger,
                expected_move_pct = format!("{:.4}", cost.expected_move_pct),
                required_pct = format!("{:.4}", cost.required_pct),
                "cost sanity veto, setup abandoned"
            );
            slot.reset_setup();
            return LaneResult::skip(LaneKind::Expansion, &snap.symbol, ctx.now, "cost_sanity_failed", "cost_sanity")
                .with_tag("reset")
                .with_tag("cost_veto")
                .with_meta("expected_move_pct", cost.expected_move_pct)
                .with_meta("cost_pct", cost.cost_pct)
                .with_meta("required_pct", cost.required_pct);
        }

        state.trigger = Some(trigger);
        state.phase = LanePhase::Armed;
        debug!(symbol = %snap.symbol, trigger = %trigger, "armed");

        self.enter(slot, ctx)
            .with_meta("pullback_depth_atr", depth)
            .with_meta("expected_move_pct", cost.expected_move_pct)
            .with_meta("cost_pct", cost.cost_pct)
    }

    /// Armed → InPosition.
    fn enter(&self, slot: &mut LaneSlot, ctx: &TickContext<'_>) -> LaneResult {
        let snap = ctx.snapshot;
        let state = slot.state().clone();
        let position = Position::new(
            LaneKind::Expansion,
            &snap.symbol,
            ctx.now,
            state.impulse_direction,
            snap.close,
            snap.atr,
            state.pullback_extreme,
            &snap.regime,
        );
        let stop = invalidation_stop(&position, &self.params);
        let tp1 = tp1_level(&position, &self.params);
        let position_id = position.id.clone();
        slot.open(position);

        info!(
            symbol = %snap.symbol,
            direction = %state.impulse_direction,
            entry = snap.close,
            atr = snap.atr,
            invalidation_stop = format!("{:.4}", stop),
            tp1 = format!("{:.4}", tp1),
            risk_multiplier = self.params.risk_multiplier,
            "expansion entry"
        );

        let mut result = LaneResult::new(LaneKind::Expansion, &snap.symbol, ctx.now, Decision::Open, "expansion_entry")
            .with_risk(self.params.risk_multiplier)
            .with_tag("expansion")
            .with_meta("position_id", position_id)
            .with_meta("direction", i8::from(state.impulse_direction))
            .with_meta("impulse_strength", state.impulse_strength)
            .with_meta("break_level", state.break_level)
            .with_meta("pullback_extreme", state.pullback_extreme)
            .with_meta("invalidation_stop", stop)
            .with_meta("tp1_level", tp1);
        if let Some(trigger) = state.trigger {
            result = result.with_trigger(trigger);
        }
        if ctx.policy.is_quarantined(&snap.symbol) {
            result = result.with_tag("earn_back");
        }
        result
    }

    // -------------------------------------------------------------------------
    // Exit side
    // -------------------------------------------------------------------------

    fn manage_position(&self, slot: &mut LaneSlot, ctx: &TickContext<'_>) -> LaneResult {
        let snap = ctx.snapshot;
        if !(snap.close.is_finite() && snap.close > 0.0) {
            return self.hold(ctx, "insufficient_data").with_tag("in_position");
        }

        let Some(pos) = slot.position_mut() else {
            return self.hold(ctx, "no_position");
        };
        let fired = run_exit_ladder(pos, snap, &self.params);
        let bars_open = pos.bars_open;
        let unrealized = pos.unrealized_return(snap.close);
        let trailing = pos.trailing_stop;

        match fired {
            None => {
                let mut result = self
                    .hold(ctx, "holding")
                    .with_tag("in_position")
                    .with_meta("bars_open", bars_open)
                    .with_meta("unrealized_return", unrealized);
                if let Some(level) = trailing {
                    result = result.with_tag("tp1_hit").with_meta("trailing_stop", level);
                }
                result
            }
            Some(reason) if reason.is_partial() => {
                info!(
                    symbol = %snap.symbol,
                    price = snap.close,
                    trailing_stop = ?trailing,
                    "tp1 partial close, trail armed"
                );
                let mut result = self
                    .close_result(ctx, reason, bars_open, unrealized)
                    .with_tag("partial")
                    .with_tag("tp1_hit")
                    .with_meta("close_fraction", self.params.tp1_close_fraction);
                if let Some(level) = trailing {
                    result = result.with_meta("trailing_stop", level);
                }
                result
            }
            Some(reason) => {
                let closed = slot.close();
                info!(
                    symbol = %snap.symbol,
                    reason = %reason,
                    price = snap.close,
                    bars_open,
                    unrealized_return = format!("{:.5}", unrealized),
                    "expansion exit"
                );
                let mut result = self.close_result(ctx, reason, bars_open, unrealized);
                if let Some(pos) = closed {
                    result = result.with_meta("position_id", pos.id);
                }
                result
            }
        }
    }

    fn close_result(
        &self,
        ctx: &TickContext<'_>,
        reason: ExitReason,
        bars_open: u32,
        unrealized: f64,
    ) -> LaneResult {
        LaneResult::new(LaneKind::Expansion, &ctx.snapshot.symbol, ctx.now, Decision::Close, reason.as_str())
            .with_exit(reason)
            .with_meta("bars_open", bars_open)
            .with_meta("exit_price", ctx.snapshot.close)
            .with_meta("realized_return", unrealized)
    }

    fn hold(&self, ctx: &TickContext<'_>, reason: &str) -> LaneResult {
        LaneResult::hold(LaneKind::Expansion, &ctx.snapshot.symbol, ctx.now, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardrails::GuardrailLedger;
    use crate::lane::EntryTrigger;
    use crate::types::PolicyState;
    use chrono::{DateTime, TimeZone, Utc};

    fn t(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + Duration::hours(hours)
    }

    fn lane() -> ExpansionLane {
        let limits = GuardrailLimits {
            min_hold_minutes: 0.0,
            cooldown_minutes: 0.0,
            max_positions_per_symbol: 1,
        };
        ExpansionLane::new(ExpansionParams::default(), limits, 1.0)
    }

    fn allow() -> PolicyState {
        PolicyState::default().with_flag("allow_expansion", true)
    }

    /// Snapshot with a 1000-ATR BTC-like series ending at `closes.last()`.
    fn snap(closes: &[f64]) -> SignalSnapshot {
        SignalSnapshot {
            symbol: "BTC".into(),
            timeframe: "1h".into(),
            regime: "trending".into(),
            micro_regime: "active".into(),
            direction: Direction::Flat,
            confidence: 0.6,
            close: *closes.last().unwrap(),
            atr: 1_000.0,
            // Far above price: never crossed by a long.
            ema9: 1_000_000.0,
            rsi7: 45.0,
            recent_closes: closes.to_vec(),
            expansion_event: false,
            expansion_strength: 0.0,
        }
    }

    fn step(
        lane: &ExpansionLane,
        slot: &mut LaneSlot,
        snap: &SignalSnapshot,
        policy: &PolicyState,
        ledger: &GuardrailLedger,
        at: DateTime<Utc>,
    ) -> LaneResult {
        let ctx = TickContext {
            snapshot: snap,
            policy,
            ledger,
            now: at,
        };
        let r = lane.execute_tick(slot, &ctx);
        assert!(slot.is_consistent(), "phase/position invariant broken: {:?}", slot);
        r
    }

    /// Drive a long setup up to PullbackTracking; returns the next hour.
    fn arm_pullback(lane: &ExpansionLane, slot: &mut LaneSlot, ledger: &GuardrailLedger) -> i64 {
        let policy = allow();
        // Impulse: +2000 over 3 bars → strength 2.0.
        let r = step(lane, slot, &snap(&[48_000.0, 48_500.0, 49_200.0, 50_000.0]), &policy, ledger, t(0));
        assert_eq!(r.reason, "impulse_detected");
        assert_eq!(slot.phase(), LanePhase::ImpulseDetected);
        // Retrace 500 = 0.5 ATR.
        let r = step(lane, slot, &snap(&[49_200.0, 50_000.0, 49_500.0]), &policy, ledger, t(1));
        assert_eq!(r.reason, "pullback_tracking");
        assert_eq!(slot.phase(), LanePhase::PullbackTracking);
        2
    }

    #[test]
    fn missing_permission_skips_without_transition() {
        let lane = lane();
        let ledger = GuardrailLedger::new();
        let mut slot = LaneSlot::default();
        let s = snap(&[48_000.0, 48_500.0, 49_200.0, 50_000.0]);
        let r = step(&lane, &mut slot, &s, &PolicyState::default(), &ledger, t(0));
        assert_eq!(r.decision, Decision::Skip);
        assert_eq!(r.reason, "requires_explicit_allow_permission");
        assert_eq!(slot.phase(), LanePhase::Idle);
    }

    #[test]
    fn dead_chop_blocks_impulse() {
        let lane = lane();
        let ledger = GuardrailLedger::new();
        let mut slot = LaneSlot::default();
        let mut s = snap(&[48_000.0, 48_500.0, 49_200.0, 50_000.0]);
        s.micro_regime = "dead_chop".into();
        let r = step(&lane, &mut slot, &s, &allow(), &ledger, t(0));
        assert_eq!(r.reason, "dead_chop");
        assert_eq!(slot.phase(), LanePhase::Idle);
    }

    #[test]
    fn full_setup_opens_quarter_risk_position() {
        let lane = lane();
        let ledger = GuardrailLedger::new();
        let mut slot = LaneSlot::default();
        let h = arm_pullback(&lane, &mut slot, &ledger);

        // +400 bar = 0.4 ATR > 0.25 → bar_return_atr trigger.
        let r = step(&lane, &mut slot, &snap(&[50_000.0, 49_500.0, 49_900.0]), &allow(), &ledger, t(h));
        assert_eq!(r.decision, Decision::Open);
        assert_eq!(r.entry_trigger, Some(EntryTrigger::BarReturnAtr));
        assert!((r.risk_multiplier - 0.25).abs() < f64::EPSILON);
        assert_eq!(slot.phase(), LanePhase::InPosition);

        let pos = slot.position().unwrap();
        assert_eq!(pos.direction, Direction::Long);
        assert_eq!(pos.pullback_extreme, 49_500.0);
        // min(49500 - 200, 49900 - 900) = 49000
        assert!((r.metadata["invalidation_stop"].as_f64().unwrap() - 49_000.0).abs() < 1e-9);
    }

    #[test]
    fn window_expiry_resets_to_idle() {
        let lane = lane();
        let ledger = GuardrailLedger::new();
        let mut slot = LaneSlot::default();
        let policy = allow();
        step(&lane, &mut slot, &snap(&[48_000.0, 48_500.0, 49_200.0, 50_000.0]), &policy, &ledger, t(0));
        assert_eq!(slot.state().max_wait_bars, 8);

        // Shallow, flat drift: never reaches the band, never triggers.
        for h in 1..=8 {
            step(&lane, &mut slot, &snap(&[49_900.0, 49_900.0]), &policy, &ledger, t(h));
            assert_eq!(slot.phase(), LanePhase::ImpulseDetected, "hour {h}");
        }
        let r = step(&lane, &mut slot, &snap(&[49_900.0, 49_900.0]), &policy, &ledger, t(9));
        assert_eq!(r.reason, "reaccel_window_expired");
        assert_eq!(slot.phase(), LanePhase::Idle);
    }

    #[test]
    fn window_expiry_from_pullback_tracking() {
        let lane = lane();
        let ledger = GuardrailLedger::new();
        let mut slot = LaneSlot::default();
        arm_pullback(&lane, &mut slot, &ledger);
        for h in 2..=8 {
            step(&lane, &mut slot, &snap(&[49_500.0, 49_500.0]), &allow(), &ledger, t(h));
            assert_eq!(slot.phase(), LanePhase::PullbackTracking);
        }
        step(&lane, &mut slot, &snap(&[49_500.0, 49_500.0]), &allow(), &ledger, t(9));
        assert_eq!(slot.phase(), LanePhase::Idle);
    }

    #[test]
    fn deep_pullback_invalidates() {
        let lane = lane();
        let ledger = GuardrailLedger::new();
        let mut slot = LaneSlot::default();
        arm_pullback(&lane, &mut slot, &ledger);
        // 1500 below break = 1.5 ATR > 1.2.
        let r = step(&lane, &mut slot, &snap(&[49_500.0, 48_500.0]), &allow(), &ledger, t(2));
        assert_eq!(r.reason, "pullback_invalidated");
        assert_eq!(slot.phase(), LanePhase::Idle);
    }

    #[test]
    fn cost_veto_resets_instead_of_arming() {
        let params = ExpansionParams {
            cost_buffer_multiplier: 1_000.0,
            ..ExpansionParams::default()
        };
        let lane = ExpansionLane::new(params, lane().limits().clone(), 1.0);
        let ledger = GuardrailLedger::new();
        let mut slot = LaneSlot::default();
        arm_pullback(&lane, &mut slot, &ledger);

        let r = step(&lane, &mut slot, &snap(&[50_000.0, 49_500.0, 49_900.0]), &allow(), &ledger, t(2));
        assert_eq!(r.decision, Decision::Skip);
        assert_eq!(r.reason, "cost_sanity_failed");
        assert!(r.has_tag("cost_veto"));
        assert_eq!(slot.phase(), LanePhase::Idle);
        assert!(slot.position().is_none());
    }

    #[test]
    fn guardrail_block_keeps_setup() {
        let lane = ExpansionLane::new(ExpansionParams::default(), GuardrailLimits::default(), 1.0);
        let ledger = GuardrailLedger::new();
        let mut slot = LaneSlot::default();
        let policy = allow();
        step(&lane, &mut slot, &snap(&[48_000.0, 48_500.0, 49_200.0, 50_000.0]), &policy, &ledger, t(0));
        ledger.record_trade("BTC", LaneKind::Expansion, t(1));

        let r = step(&lane, &mut slot, &snap(&[49_200.0, 50_000.0, 49_500.0]), &policy, &ledger, t(1) + Duration::minutes(1));
        assert_eq!(r.decision, Decision::Skip);
        assert_eq!(r.reason_key.as_deref(), Some("min_hold"));
        assert_eq!(slot.phase(), LanePhase::ImpulseDetected);
    }

    #[test]
    fn quarantined_symbol_is_tagged_earn_back() {
        let lane = lane();
        let ledger = GuardrailLedger::new();
        let mut slot = LaneSlot::default();
        arm_pullback(&lane, &mut slot, &ledger);
        let policy = allow().with_quarantined("BTC");
        let r = step(&lane, &mut slot, &snap(&[50_000.0, 49_500.0, 49_900.0]), &policy, &ledger, t(2));
        assert_eq!(r.decision, Decision::Open);
        assert!(r.has_tag("earn_back"));
    }

    fn long_at_50k() -> Position {
        Position::new(LaneKind::Expansion, "BTC", t(0), Direction::Long, 50_000.0, 1_000.0, 49_500.0, "trending")
    }

    #[test]
    fn tp1_partial_then_trail() {
        let p = ExpansionParams::default();
        let mut pos = long_at_50k();
        let s = snap(&[50_500.0, 51_000.0]);
        assert_eq!(run_exit_ladder(&mut pos, &s, &p), Some(ExitReason::TakeProfit1));
        assert!(pos.tp1_hit);
        let trail = pos.trailing_stop.unwrap();
        assert!(trail < 51_000.0);
        assert!((trail - 50_000.0).abs() < 1e-9);

        // Higher close ratchets the trail up.
        let s = snap(&[51_000.0, 51_800.0]);
        assert_eq!(run_exit_ladder(&mut pos, &s, &p), None);
        assert!((pos.trailing_stop.unwrap() - 50_800.0).abs() < 1e-9);

        // Pullback through the trail closes.
        let s = snap(&[51_800.0, 50_700.0]);
        assert_eq!(run_exit_ladder(&mut pos, &s, &p), Some(ExitReason::AtrTrail));
    }

    #[test]
    fn tp1_through_lane_keeps_position_open() {
        let lane = lane();
        let ledger = GuardrailLedger::new();
        let mut slot = LaneSlot::default();
        slot.open(long_at_50k());
        let r = step(&lane, &mut slot, &snap(&[50_500.0, 51_000.0]), &allow(), &ledger, t(1));
        assert_eq!(r.decision, Decision::Close);
        assert!(r.reason.contains("tp1"));
        assert!(r.is_partial());
        assert!(slot.position().unwrap().tp1_hit);
        assert_eq!(slot.phase(), LanePhase::InPosition);
        assert!(r.metadata["trailing_stop"].as_f64().unwrap() < 51_000.0);
    }

    #[test]
    fn invalidation_stop_first() {
        let p = ExpansionParams::default();
        let mut pos = long_at_50k();
        // Stop = min(49300, 49100) = 49100.
        let s = snap(&[49_500.0, 49_050.0]);
        assert_eq!(run_exit_ladder(&mut pos, &s, &p), Some(ExitReason::InvalidationStop));
    }

    #[test]
    fn short_invalidation_is_mirrored() {
        let p = ExpansionParams::default();
        let mut pos = Position::new(LaneKind::Expansion, "BTC", t(0), Direction::Short, 50_000.0, 1_000.0, 50_500.0, "trending");
        // Stop = max(50700, 50900) = 50900.
        assert!((invalidation_stop(&pos, &p) - 50_900.0).abs() < 1e-9);
        let s = snap(&[50_500.0, 50_800.0]);
        assert_eq!(run_exit_ladder(&mut pos, &s, &p), None);
        let s = snap(&[50_800.0, 50_950.0]);
        assert_eq!(run_exit_ladder(&mut pos, &s, &p), Some(ExitReason::InvalidationStop));
    }

    #[test]
    fn momentum_decay_after_tp1() {
        let p = ExpansionParams::default();
        let mut pos = long_at_50k();
        pos.tp1_hit = true;
        pos.trailing_stop = Some(50_000.0);
        let s = snap(&[51_500.0, 51_400.0, 51_300.0]);
        assert_eq!(run_exit_ladder(&mut pos, &s, &p), Some(ExitReason::MomentumDecay));

        let mut pos = long_at_50k();
        pos.tp1_hit = true;
        pos.trailing_stop = Some(50_000.0);
        let mut s = snap(&[51_300.0, 51_400.0]);
        s.atr = 500.0;
        assert_eq!(run_exit_ladder(&mut pos, &s, &p), Some(ExitReason::MomentumDecay));
    }

    #[test]
    fn momentum_decay_inactive_before_tp1() {
        let p = ExpansionParams::default();
        let mut pos = long_at_50k();
        let s = snap(&[50_400.0, 50_300.0, 50_200.0]);
        assert_eq!(run_exit_ladder(&mut pos, &s, &p), None);
    }

    #[test]
    fn time_stop_on_flat_position() {
        let lane = lane();
        let ledger = GuardrailLedger::new();
        let mut slot = LaneSlot::default();
        let mut pos = long_at_50k();
        pos.bars_open = 23;
        slot.open(pos);
        let r = step(&lane, &mut slot, &snap(&[50_000.0, 50_000.0]), &allow(), &ledger, t(24));
        assert_eq!(r.decision, Decision::Close);
        assert_eq!(r.exit_reason, Some(ExitReason::TimeStop));
        assert_eq!(r.reason, "time_stop");
        assert_eq!(slot.phase(), LanePhase::Idle);
        assert!(slot.position().is_none());
    }

    #[test]
    fn open_position_ignores_permission_and_bad_ticks() {
        let lane = lane();
        let ledger = GuardrailLedger::new();
        let mut slot = LaneSlot::default();
        slot.open(long_at_50k());

        let mut bad = snap(&[50_000.0, 50_100.0]);
        bad.close = -1.0;
        let r = step(&lane, &mut slot, &bad, &PolicyState::default(), &ledger, t(1));
        assert_eq!(r.reason, "insufficient_data");
        assert_eq!(slot.position().unwrap().bars_open, 0);

        let r = step(&lane, &mut slot, &snap(&[50_000.0, 50_100.0]), &PolicyState::default(), &ledger, t(2));
        assert_eq!(r.decision, Decision::Hold);
        assert_eq!(slot.position().unwrap().bars_open, 1);
    }

    #[test]
    fn short_setup_mirrors_long_and_bad_tick_holds() {
        let lane = lane();
        let ledger = GuardrailLedger::new();
        let mut slot = LaneSlot::default();
        let policy = allow();

        // -2000 over 3 bars: short impulse, break level 50000.
        let r = step(&lane, &mut slot, &snap(&[52_000.0, 51_500.0, 50_800.0, 50_000.0]), &policy, &ledger, t(0));
        assert_eq!(r.reason, "impulse_detected");
        assert_eq!(slot.state().impulse_direction, Direction::Short);
        let before = slot.state().clone();

        let mut bad = snap(&[50_000.0, 50_200.0]);
        bad.atr = f64::NAN;
        let r = step(&lane, &mut slot, &bad, &policy, &ledger, t(1));
        assert_eq!(r.decision, Decision::Hold);
        assert_eq!(r.reason, "insufficient_data");
        assert_eq!(slot.state(), &before);

        // Bounce of 0.5 ATR against the short.
        let r = step(&lane, &mut slot, &snap(&[50_000.0, 50_500.0]), &policy, &ledger, t(2));
        assert_eq!(r.reason, "pullback_tracking");
        assert_eq!(slot.state().pullback_extreme, 50_500.0);

        // -400 bar = 0.4 ATR in trade direction.
        let r = step(&lane, &mut slot, &snap(&[50_500.0, 50_100.0]), &policy, &ledger, t(3));
        assert_eq!(r.decision, Decision::Open);
        assert_eq!(r.entry_trigger, Some(EntryTrigger::BarReturnAtr));
        assert_eq!(r.metadata["direction"], -1);
        // max(50500 + 200, 50100 + 900) = 51000
        assert!((r.metadata["invalidation_stop"].as_f64().unwrap() - 51_000.0).abs() < 1e-9);
        // 50100 - 1000
        assert!((r.metadata["tp1_level"].as_f64().unwrap() - 49_100.0).abs() < 1e-9);
        assert_eq!(slot.position().unwrap().direction, Direction::Short);
    }

    #[test]
    fn ema9_cross_drives_entry() {
        let lane = lane();
        let ledger = GuardrailLedger::new();
        let mut slot = LaneSlot::default();
        let h = arm_pullback(&lane, &mut slot, &ledger);

        let mut s = snap(&[49_500.0, 49_800.0]);
        s.ema9 = 49_700.0;
        let r = step(&lane, &mut slot, &s, &allow(), &ledger, t(h));
        assert_eq!(r.decision, Decision::Open);
        assert_eq!(r.entry_trigger, Some(EntryTrigger::Ema9Cross));
        assert!(r.has_tag("ema9_cross"));
    }

    #[test]
    fn rsi50_cross_drives_entry() {
        let lane = lane();
        let ledger = GuardrailLedger::new();
        let mut slot = LaneSlot::default();
        let h = arm_pullback(&lane, &mut slot, &ledger);
        assert_eq!(slot.state().last_rsi, Some(45.0));

        // +50 bar is far below the bar-return threshold; only RSI crosses.
        let mut s = snap(&[49_500.0, 49_550.0]);
        s.rsi7 = 55.0;
        let r = step(&lane, &mut slot, &s, &allow(), &ledger, t(h));
        assert_eq!(r.decision, Decision::Open);
        assert_eq!(r.entry_trigger, Some(EntryTrigger::Rsi50Cross));
    }

    #[test]
    fn unknown_multibyte_timeframe_falls_back_to_default_bar() {
        let lane = lane();
        let ledger = GuardrailLedger::new();
        let mut slot = LaneSlot::default();
        let policy = allow();
        step(&lane, &mut slot, &snap(&[48_000.0, 48_500.0, 49_200.0, 50_000.0]), &policy, &ledger, t(0));

        let mut s = snap(&[49_200.0, 50_000.0, 49_500.0]);
        s.timeframe = "5分".into();
        let r = step(&lane, &mut slot, &s, &policy, &ledger, t(1));
        assert_eq!(r.reason, "pullback_tracking");

        s.recent_closes = vec![49_500.0, 49_500.0];
        s.close = 49_500.0;
        let r = step(&lane, &mut slot, &s, &policy, &ledger, t(9));
        assert_eq!(r.reason, "reaccel_window_expired");
        assert_eq!(slot.phase(), LanePhase::Idle);
    }

    #[test]
    fn invalid_params_fall_back_to_defaults() {
        let params: ExpansionParams = serde_json::from_str(
            r#"{ "default_bar_minutes": 0, "impulse_lookback_bars": 0,
                 "pullback_atr_min": 2.0, "pullback_atr_max": 1.0, "tp1_close_fraction": 1.5 }"#,
        )
        .unwrap();
        let lane = ExpansionLane::new(params, lane().limits().clone(), 1.0);
        let p = lane.params();
        assert_eq!(p.default_bar_minutes, 60);
        assert_eq!(p.impulse_lookback_bars, 3);
        assert_eq!((p.pullback_atr_min, p.pullback_atr_max), (0.3, 1.2));
        assert_eq!(p.tp1_close_fraction, 0.5);
        assert_eq!(ExpansionParams::default().sanitized(), ExpansionParams::default());
    }

    #[test]
    fn zero_bar_length_config_still_expires_window() {
        let params: ExpansionParams = serde_json::from_str(r#"{ "default_bar_minutes": 0 }"#).unwrap();
        let lane = ExpansionLane::new(params, lane().limits().clone(), 1.0);
        let ledger = GuardrailLedger::new();
        let mut slot = LaneSlot::default();
        let policy = allow();

        let mut s = snap(&[48_000.0, 48_500.0, 49_200.0, 50_000.0]);
        s.timeframe = "tick".into();
        step(&lane, &mut slot, &s, &policy, &ledger, t(0));
        assert_eq!(slot.phase(), LanePhase::ImpulseDetected);

        let mut s = snap(&[49_900.0, 49_900.0]);
        s.timeframe = "tick".into();
        let r = step(&lane, &mut slot, &s, &policy, &ledger, t(24 * 30));
        assert_eq!(r.reason, "reaccel_window_expired");
        assert_eq!(slot.phase(), LanePhase::Idle);
    }
}
