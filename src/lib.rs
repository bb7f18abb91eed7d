// =============================================================================
// Lane Engine — per-symbol trading lanes over a shared snapshot stream
// =============================================================================
//
// Synchronous decision core. Callers feed one batch of `SignalSnapshot`s plus
// a `PolicyState` per tick; the dispatcher runs every enabled lane over every
// symbol and returns one auditable `LaneResult` each. All time comes from the
// caller; nothing here sleeps or does I/O outside configuration loading.
// =============================================================================

pub mod dispatcher;
pub mod exit;
pub mod guardrails;
pub mod lane;
pub mod runtime_config;
pub mod types;

pub use dispatcher::LaneDispatcher;
pub use exit::{evaluate_exit, ExitInput, ExitParams, ExitReason, ExitRuleTable, ExitSignal};
pub use guardrails::{check_guardrails, GuardrailKey, GuardrailLedger, GuardrailLimits, GuardrailVerdict};
pub use lane::{Decision, Lane, LaneKind, LanePhase, LaneResult, LaneSlot, RiskProfile};
pub use runtime_config::RuntimeConfig;
pub use types::{Direction, PolicyState, SignalSnapshot};
