// =============================================================================
// Lane Replay — drive the dispatcher from a JSONL tick file
// =============================================================================
//
// Usage: lane-replay <ticks.jsonl>
//
// Each input line is one tick: `{ "now": ..., "policy": {...}, "snapshots": [...] }`.
// Every LaneResult is written to stdout as one JSON line; logs go to stderr.
// The replay plays the bookkeeping role: each result is booked into the
// guardrail ledger as if it had filled.
//
// Env:
//   LANE_CONFIG   runtime config JSON (default lane_config.json)
//   EXIT_RULES    exit rule table JSON (overrides config.exit_rules_path)
//   RUST_LOG      log filter (default info)
// =============================================================================

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lane_engine::{
    Decision, ExitRuleTable, GuardrailLedger, LaneDispatcher, PolicyState, RuntimeConfig,
    SignalSnapshot,
};

#[derive(Debug, Deserialize)]
struct ReplayTick {
    now: DateTime<Utc>,
    #[serde(default)]
    policy: PolicyState,
    #[serde(default)]
    snapshots: Vec<SignalSnapshot>,
}

fn load_exit_rules(config: &RuntimeConfig) -> ExitRuleTable {
    let path = std::env::var("EXIT_RULES")
        .ok()
        .or_else(|| config.exit_rules_path.clone());
    let Some(path) = path else {
        info!("no exit rule file configured, using built-in table");
        return ExitRuleTable::default();
    };
    ExitRuleTable::load(&path).unwrap_or_else(|e| {
        warn!(path = %path, error = %e, "Failed to load exit rules, using built-in table");
        ExitRuleTable::default()
    })
}

fn main() -> Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let input = std::env::args()
        .nth(1)
        .context("usage: lane-replay <ticks.jsonl>")?;

    let config_path = std::env::var("LANE_CONFIG").unwrap_or_else(|_| "lane_config.json".to_string());
    let config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(path = %config_path, error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    let exit_rules = Arc::new(load_exit_rules(&config));

    // ── 2. Build dispatcher ──────────────────────────────────────────────
    let ledger = Arc::new(GuardrailLedger::new());
    let mut dispatcher = LaneDispatcher::from_config(&config, exit_rules, Arc::clone(&ledger));

    // ── 3. Replay ────────────────────────────────────────────────────────
    let file = File::open(&input).with_context(|| format!("failed to open tick file {input}"))?;
    let reader = BufReader::new(file);
    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    let (mut ticks, mut skipped, mut opens, mut closes) = (0u64, 0u64, 0u64, 0u64);

    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {} of {input}", idx + 1))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let tick: ReplayTick = match serde_json::from_str(line) {
            Ok(t) => t,
            Err(e) => {
                warn!(line = idx + 1, error = %e, "malformed tick, skipping");
                skipped += 1;
                continue;
            }
        };

        for result in dispatcher.tick(tick.now, &tick.snapshots, &tick.policy) {
            ledger.apply(&result);
            match result.decision {
                Decision::Open => opens += 1,
                Decision::Close => closes += 1,
                Decision::Hold | Decision::Skip => {}
            }
            serde_json::to_writer(&mut out, &result).context("failed to serialise lane result")?;
            out.write_all(b"\n").context("failed to write to stdout")?;
        }
        ticks += 1;
    }
    out.flush().context("failed to flush stdout")?;

    info!(
        ticks,
        skipped,
        opens,
        closes,
        open_positions = dispatcher.open_positions().len(),
        "replay finished"
    );
    Ok(())
}
