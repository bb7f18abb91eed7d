// =============================================================================
// Exit Rule Table — regime-keyed exit parameter sets
// =============================================================================
//
// One `ExitParams` record per regime label. The table always carries a
// `default` entry which is used for any regime it does not know.
//
// Loading is lenient: the table file is a JSON object keyed by regime, each
// entry is overlaid on the built-in parameters for that regime, and an entry
// that fails to parse or validate is replaced by the built-in parameters with
// a warning. A bad entry never fails the whole load.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

/// Key of the mandatory fallback entry.
pub const DEFAULT_REGIME: &str = "default";

// =============================================================================
// ExitParams
// =============================================================================

/// Exit contract for positions opened under one regime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitParams {
    /// No exit of any kind before this many bars.
    pub min_hold_bars: u32,
    /// Forced exit at this many bars; 0 means unbounded.
    pub max_hold_bars: u32,
    /// Direction-adjusted fractional return that counts as a take-profit.
    pub tp_return_min: f64,
    /// Direction-adjusted fractional return (<= 0) that counts as a stop.
    pub sl_return: f64,
    pub tp_conf_min: f64,
    pub sl_conf_min: f64,
    /// Bars after which a flat position is scratched.
    pub decay_bars: u32,
    /// Largest absolute return still considered "flat" for a scratch exit.
    pub drop_return_max: f64,
}

impl Default for ExitParams {
    fn default() -> Self {
        builtin_params(DEFAULT_REGIME)
    }
}

impl ExitParams {
    fn validate(&self) -> Result<()> {
        let floats = [
            self.tp_return_min,
            self.sl_return,
            self.tp_conf_min,
            self.sl_conf_min,
            self.drop_return_max,
        ];
        if floats.iter().any(|v| !v.is_finite()) {
            bail!("non-finite threshold");
        }
        if self.sl_return > 0.0 {
            bail!("sl_return must be <= 0 (got {})", self.sl_return);
        }
        if self.tp_return_min < 0.0 {
            bail!("tp_return_min must be >= 0 (got {})", self.tp_return_min);
        }
        if self.drop_return_max < 0.0 {
            bail!("drop_return_max must be >= 0 (got {})", self.drop_return_max);
        }
        for conf in [self.tp_conf_min, self.sl_conf_min] {
            if !(0.0..=1.0).contains(&conf) {
                bail!("confidence threshold {} outside [0, 1]", conf);
            }
        }
        Ok(())
    }
}

/// Hard-coded parameters per regime.
///
/// Unknown regimes get the `default` set.
fn builtin_params(regime: &str) -> ExitParams {
    match regime {
        // Let trends run; wider stop, larger target, longer leash.
        "trending" => ExitParams {
            min_hold_bars: 3,
            max_hold_bars: 72,
            tp_return_min: 0.030,
            sl_return: -0.012,
            tp_conf_min: 0.50,
            sl_conf_min: 0.0,
            decay_bars: 18,
            drop_return_max: 0.003,
        },
        // Chop: take small wins quickly, scratch early.
        "choppy" => ExitParams {
            min_hold_bars: 1,
            max_hold_bars: 24,
            tp_return_min: 0.012,
            sl_return: -0.008,
            tp_conf_min: 0.60,
            sl_conf_min: 0.0,
            decay_bars: 6,
            drop_return_max: 0.0015,
        },
        "high_vol" => ExitParams {
            min_hold_bars: 1,
            max_hold_bars: 24,
            tp_return_min: 0.035,
            sl_return: -0.020,
            tp_conf_min: 0.60,
            sl_conf_min: 0.0,
            decay_bars: 8,
            drop_return_max: 0.004,
        },
        _ => ExitParams {
            min_hold_bars: 2,
            max_hold_bars: 48,
            tp_return_min: 0.020,
            sl_return: -0.010,
            tp_conf_min: 0.55,
            sl_conf_min: 0.0,
            decay_bars: 12,
            drop_return_max: 0.002,
        },
    }
}

fn normalize(regime: &str) -> String {
    regime.trim().to_ascii_lowercase()
}

// =============================================================================
// ExitRuleTable
// =============================================================================

/// Immutable regime → `ExitParams` lookup with a guaranteed `default` entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitRuleTable {
    entries: BTreeMap<String, ExitParams>,
    /// Mirror of the `default` entry.
    #[serde(skip)]
    fallback: ExitParams,
}

impl Default for ExitRuleTable {
    fn default() -> Self {
        let entries = [DEFAULT_REGIME, "trending", "choppy", "high_vol"]
            .into_iter()
            .map(|r| (r.to_string(), builtin_params(r)))
            .collect();
        Self {
            entries,
            fallback: builtin_params(DEFAULT_REGIME),
        }
    }
}

impl ExitRuleTable {
    /// Parameters for `regime`, falling back to the `default` entry.
    pub fn params(&self, regime: &str) -> &ExitParams {
        self.entries.get(&normalize(regime)).unwrap_or(&self.fallback)
    }

    pub fn contains(&self, regime: &str) -> bool {
        self.entries.contains_key(&normalize(regime))
    }

    pub fn regimes(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Replace or add one regime entry. Invalid params are rejected.
    pub fn insert(&mut self, regime: &str, params: ExitParams) -> Result<()> {
        params
            .validate()
            .with_context(|| format!("invalid exit params for regime '{regime}'"))?;
        self.put(normalize(regime), params);
        Ok(())
    }

    fn put(&mut self, key: String, params: ExitParams) {
        if key == DEFAULT_REGIME {
            self.fallback = params.clone();
        }
        self.entries.insert(key, params);
    }

    /// Parse a table from a JSON object keyed by regime.
    ///
    /// Only a top-level document that is not a JSON object is an error; bad
    /// individual entries are replaced by built-ins.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let doc: Value = serde_json::from_str(json).context("exit rule table is not valid JSON")?;
        let Value::Object(map) = doc else {
            bail!("exit rule table must be a JSON object keyed by regime");
        };

        let mut table = Self::default();
        for (raw_key, raw_entry) in map {
            let key = normalize(&raw_key);
            let params = match parse_entry(&key, raw_entry) {
                Ok(p) => p,
                Err(e) => {
                    warn!(regime = %key, error = %e, "malformed exit rule entry, using built-in defaults");
                    builtin_params(&key)
                }
            };
            table.put(key, params);
        }

        info!(regimes = table.entries.len(), "exit rule table parsed");
        Ok(table)
    }

    /// Load a table from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read exit rule table from {}", path.display()))?;
        Self::from_json_str(&content)
            .with_context(|| format!("failed to parse exit rule table from {}", path.display()))
    }
}

/// Overlay a (possibly partial) entry on the built-in params for `regime`.
fn parse_entry(regime: &str, entry: Value) -> Result<ExitParams> {
    let Value::Object(overrides) = entry else {
        bail!("entry is not an object");
    };
    let mut base = match serde_json::to_value(builtin_params(regime))? {
        Value::Object(m) => m,
        _ => bail!("built-in params did not serialise to an object"),
    };
    for (k, v) in overrides {
        base.insert(k, v);
    }
    let params: ExitParams = serde_json::from_value(Value::Object(base))?;
    params.validate()?;
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_has_fallback() {
        let table = ExitRuleTable::default();
        assert!(table.contains(DEFAULT_REGIME));
        assert_eq!(table.params("no_such_regime"), table.params(DEFAULT_REGIME));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let table = ExitRuleTable::default();
        assert_eq!(table.params("TRENDING").max_hold_bars, 72);
        assert_eq!(table.params(" Choppy ").decay_bars, 6);
    }

    #[test]
    fn partial_entry_keeps_builtin_fields() {
        let table = ExitRuleTable::from_json_str(r#"{ "trending": { "max_hold_bars": 10 } }"#).unwrap();
        let p = table.params("trending");
        assert_eq!(p.max_hold_bars, 10);
        assert_eq!(p.min_hold_bars, 3);
        assert!((p.tp_return_min - 0.030).abs() < f64::EPSILON);
    }

    #[test]
    fn malformed_entry_falls_back_without_failing_load() {
        let json = r#"{
            "choppy": { "sl_return": "very negative" },
            "high_vol": { "sl_return": 0.05 },
            "meme": 42,
            "squeeze": { "min_hold_bars": 4 }
        }"#;
        let table = ExitRuleTable::from_json_str(json).unwrap();
        assert_eq!(table.params("choppy"), &builtin_params("choppy"));
        assert_eq!(table.params("high_vol"), &builtin_params("high_vol"));
        assert_eq!(table.params("meme"), &builtin_params(DEFAULT_REGIME));
        // Unknown regimes overlay the default set.
        assert_eq!(table.params("squeeze").min_hold_bars, 4);
        assert_eq!(table.params("squeeze").max_hold_bars, 48);
    }

    #[test]
    fn overriding_default_entry_changes_fallback() {
        let table = ExitRuleTable::from_json_str(r#"{ "default": { "decay_bars": 3 } }"#).unwrap();
        assert_eq!(table.params("unknown").decay_bars, 3);
    }

    #[test]
    fn non_object_document_is_an_error() {
        assert!(ExitRuleTable::from_json_str("[1, 2, 3]").is_err());
        assert!(ExitRuleTable::from_json_str("not json").is_err());
    }

    #[test]
    fn insert_rejects_positive_stop() {
        let mut table = ExitRuleTable::default();
        let bad = ExitParams {
            sl_return: 0.01,
            ..ExitParams::default()
        };
        assert!(table.insert("trending", bad).is_err());
        assert_eq!(table.params("trending").max_hold_bars, 72);
    }

    #[test]
    fn params_deserialise_with_struct_defaults() {
        let p: ExitParams = serde_json::from_str(r#"{ "decay_bars": 5 }"#).unwrap();
        assert_eq!(p.decay_bars, 5);
        assert_eq!(p.min_hold_bars, 2);
    }
}
