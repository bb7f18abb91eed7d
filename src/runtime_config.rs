// =============================================================================
// Runtime Configuration — lane engine settings
// =============================================================================
//
// Everything the dispatcher needs to build its lanes: the symbol universe,
// which lanes run, the baseline core risk, per-lane tunables and the
// guardrail limits (a shared default plus optional per-lane overrides).
//
// All fields carry serde defaults so that adding new fields never breaks
// loading an older config file. Values the lanes cannot run with (a
// non-positive baseline risk, negative guardrail windows) are replaced by
// their defaults with a warning instead of failing the load.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::guardrails::GuardrailLimits;
use crate::lane::{ExpansionParams, LaneKind, SignalLaneParams};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_baseline_risk_pct() -> f64 {
    1.0
}

fn default_enabled_lanes() -> Vec<LaneKind> {
    LaneKind::ALL.to_vec()
}

fn default_core() -> SignalLaneParams {
    SignalLaneParams::for_kind(LaneKind::Core)
}

fn default_scalp() -> SignalLaneParams {
    SignalLaneParams::for_kind(LaneKind::Scalp)
}

fn default_exploration() -> SignalLaneParams {
    SignalLaneParams::for_kind(LaneKind::Exploration)
}

fn default_recovery() -> SignalLaneParams {
    SignalLaneParams::for_kind(LaneKind::Recovery)
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Symbols the replay driver expects; informational for the dispatcher,
    /// which tracks whatever symbols its snapshots carry.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Risk of one full-size core position, in percent of equity.
    #[serde(default = "default_baseline_risk_pct")]
    pub baseline_risk_pct: f64,

    /// Lanes to run, in dispatch order.
    #[serde(default = "default_enabled_lanes")]
    pub enabled_lanes: Vec<LaneKind>,

    /// Guardrail limits for any lane without an override.
    #[serde(default)]
    pub guardrails: GuardrailLimits,

    #[serde(default)]
    pub lane_guardrails: BTreeMap<LaneKind, GuardrailLimits>,

    #[serde(default)]
    pub expansion: ExpansionParams,

    #[serde(default = "default_core")]
    pub core: SignalLaneParams,

    #[serde(default = "default_scalp")]
    pub scalp: SignalLaneParams,

    #[serde(default = "default_exploration")]
    pub exploration: SignalLaneParams,

    #[serde(default = "default_recovery")]
    pub recovery: SignalLaneParams,

    /// Exit rule table file; the `EXIT_RULES` env var takes precedence.
    #[serde(default)]
    pub exit_rules_path: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            baseline_risk_pct: default_baseline_risk_pct(),
            enabled_lanes: default_enabled_lanes(),
            guardrails: GuardrailLimits::default(),
            lane_guardrails: BTreeMap::new(),
            expansion: ExpansionParams::default(),
            core: default_core(),
            scalp: default_scalp(),
            exploration: default_exploration(),
            recovery: default_recovery(),
            exit_rules_path: None,
        }
    }
}

impl RuntimeConfig {
    /// Guardrail limits for `lane`: its override, else the shared default.
    pub fn guardrails_for(&self, lane: LaneKind) -> GuardrailLimits {
        self.lane_guardrails
            .get(&lane)
            .cloned()
            .unwrap_or_else(|| self.guardrails.clone())
    }

    /// Tunables of a signal-following lane. `None` for the expansion lane.
    pub fn signal_params(&self, lane: LaneKind) -> Option<&SignalLaneParams> {
        match lane {
            LaneKind::Core => Some(&self.core),
            LaneKind::Scalp => Some(&self.scalp),
            LaneKind::Exploration => Some(&self.exploration),
            LaneKind::Recovery => Some(&self.recovery),
            LaneKind::Expansion => None,
        }
    }

    /// Parse a config document and repair values the lanes cannot run with.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("invalid lane config JSON")?;
        Ok(config.validated())
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read lane config from {}", path.display()))?;

        let config = Self::from_json_str(&content)
            .with_context(|| format!("failed to parse lane config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            lanes = ?config.enabled_lanes,
            baseline_risk_pct = config.baseline_risk_pct,
            "lane config loaded"
        );

        Ok(config)
    }

    fn validated(mut self) -> Self {
        if !(self.baseline_risk_pct.is_finite() && self.baseline_risk_pct > 0.0) {
            warn!(
                value = self.baseline_risk_pct,
                "baseline_risk_pct must be positive, using {}",
                default_baseline_risk_pct()
            );
            self.baseline_risk_pct = default_baseline_risk_pct();
        }

        let mut seen = Vec::with_capacity(self.enabled_lanes.len());
        self.enabled_lanes.retain(|lane| {
            if seen.contains(lane) {
                warn!(lane = %lane, "lane listed twice in enabled_lanes, keeping the first");
                false
            } else {
                seen.push(*lane);
                true
            }
        });
        if self.enabled_lanes.is_empty() {
            warn!("enabled_lanes is empty, no lane will run");
        }

        self.guardrails = sanitize_limits("default", self.guardrails);
        for (lane, limits) in self.lane_guardrails.iter_mut() {
            *limits = sanitize_limits(&lane.to_string(), limits.clone());
        }
        self
    }
}

fn sanitize_limits(scope: &str, mut limits: GuardrailLimits) -> GuardrailLimits {
    let defaults = GuardrailLimits::default();
    if !(limits.min_hold_minutes.is_finite() && limits.min_hold_minutes >= 0.0) {
        warn!(scope, value = limits.min_hold_minutes, "invalid min_hold_minutes, using default");
        limits.min_hold_minutes = defaults.min_hold_minutes;
    }
    if !(limits.cooldown_minutes.is_finite() && limits.cooldown_minutes >= 0.0) {
        warn!(scope, value = limits.cooldown_minutes, "invalid cooldown_minutes, using default");
        limits.cooldown_minutes = defaults.cooldown_minutes;
    }
    limits
}
