// =============================================================================
// Shared types used across the lane engine
// =============================================================================
//
// Everything here is plain data handed to the engine by upstream producers:
// the per-tick signal snapshot and the policy flags that gate each lane.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Micro-regime label that blocks every new setup.
pub const MICRO_REGIME_DEAD_CHOP: &str = "dead_chop";

// =============================================================================
// Direction
// =============================================================================

/// Trade or signal direction, encoded on the wire as -1 / 0 / +1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum Direction {
    Short,
    Flat,
    Long,
}

impl Direction {
    /// Numeric sign used in signed-return arithmetic.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
            Self::Flat => 0.0,
        }
    }

    pub fn is_flat(self) -> bool {
        self == Self::Flat
    }

    /// Direction of a price move; zero moves (and NaN) map to `Flat`.
    pub fn of_move(delta: f64) -> Self {
        if delta > 0.0 {
            Self::Long
        } else if delta < 0.0 {
            Self::Short
        } else {
            Self::Flat
        }
    }
}

impl Default for Direction {
    fn default() -> Self {
        Self::Flat
    }
}

impl TryFrom<i8> for Direction {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Long),
            0 => Ok(Self::Flat),
            -1 => Ok(Self::Short),
            other => Err(format!("direction must be -1, 0 or 1 (got {other})")),
        }
    }
}

impl From<Direction> for i8 {
    fn from(d: Direction) -> i8 {
        match d {
            Direction::Long => 1,
            Direction::Flat => 0,
            Direction::Short => -1,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Flat => write!(f, "FLAT"),
        }
    }
}

// =============================================================================
// SignalSnapshot
// =============================================================================

/// Market signal snapshot for one symbol at one tick.
///
/// Produced upstream and consumed read-only. `recent_closes` runs oldest to
/// newest and its last element is expected to equal `close`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSnapshot {
    pub symbol: String,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    #[serde(default = "default_regime")]
    pub regime: String,
    #[serde(default)]
    pub micro_regime: String,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub confidence: f64,
    pub close: f64,
    #[serde(default)]
    pub atr: f64,
    #[serde(default)]
    pub ema9: f64,
    #[serde(default)]
    pub rsi7: f64,
    #[serde(default)]
    pub recent_closes: Vec<f64>,
    #[serde(default)]
    pub expansion_event: bool,
    #[serde(default)]
    pub expansion_strength: f64,
}

fn default_timeframe() -> String {
    "1h".to_string()
}

fn default_regime() -> String {
    "default".to_string()
}

impl SignalSnapshot {
    /// Price and ATR are both finite and strictly positive.
    pub fn is_usable(&self) -> bool {
        self.close.is_finite() && self.close > 0.0 && self.atr.is_finite() && self.atr > 0.0
    }

    /// Close immediately before the current one, if the history has it.
    pub fn prev_close(&self) -> Option<f64> {
        let n = self.recent_closes.len();
        if n < 2 {
            return None;
        }
        let prev = self.recent_closes[n - 2];
        (prev.is_finite() && prev > 0.0).then_some(prev)
    }

    /// Close `k` bars back from the newest element of `recent_closes`.
    pub fn close_back(&self, k: usize) -> Option<f64> {
        let n = self.recent_closes.len();
        if k == 0 || n <= k {
            return None;
        }
        let c = self.recent_closes[n - 1 - k];
        (c.is_finite() && c > 0.0).then_some(c)
    }

    pub fn is_dead_chop(&self) -> bool {
        self.micro_regime.eq_ignore_ascii_case(MICRO_REGIME_DEAD_CHOP)
    }

    /// Bar length for this snapshot's timeframe, or `fallback` if unknown.
    pub fn bar_duration(&self, fallback: Duration) -> Duration {
        timeframe_duration(&self.timeframe).unwrap_or(fallback)
    }
}

/// Parse a timeframe label such as `5m`, `1h` or `1d`.
pub fn timeframe_duration(tf: &str) -> Option<Duration> {
    let tf = tf.trim().to_ascii_lowercase();
    let unit = tf.chars().last()?;
    let num = &tf[..tf.len() - unit.len_utf8()];
    let n: i64 = num.parse().ok().filter(|n| *n > 0)?;
    match unit {
        'm' => Some(Duration::minutes(n)),
        'h' => Some(Duration::hours(n)),
        'd' => Some(Duration::days(n)),
        _ => None,
    }
}

// =============================================================================
// PolicyState
// =============================================================================

/// Permission flags and quarantine list supplied by the external policy
/// collaborator on every tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyState {
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
    #[serde(default)]
    pub quarantined: BTreeSet<String>,
}

impl PolicyState {
    pub fn with_flag(mut self, flag: impl Into<String>, value: bool) -> Self {
        self.flags.insert(flag.into(), value);
        self
    }

    pub fn with_quarantined(mut self, symbol: impl Into<String>) -> Self {
        self.quarantined.insert(symbol.into());
        self
    }

    /// A flag counts as granted only when present and `true`.
    pub fn allows(&self, flag: &str) -> bool {
        self.flags.get(flag).copied().unwrap_or(false)
    }

    pub fn is_quarantined(&self, symbol: &str) -> bool {
        self.quarantined.contains(symbol)
    }
}
