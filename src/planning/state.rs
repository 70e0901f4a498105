// src/planning/state.rs
//
// Ego behavioral state, recomputed every cycle as a pure function of the
// planning data and the external safety verdict. No transition table is
// persisted; the tag is derived fresh each tick.

use serde::Serialize;

use crate::config::SafetyConfig;
use crate::types::AvoidancePlanningData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AvoidanceState {
    NotAvoid,
    AvoidPathNotReady,
    AvoidExecute,
    Yield,
}

impl AvoidanceState {
    pub fn as_str(self) -> &'static str {
        match self {
            AvoidanceState::NotAvoid => "NOT_AVOID",
            AvoidanceState::AvoidPathNotReady => "AVOID_PATH_NOT_READY",
            AvoidanceState::AvoidExecute => "AVOID_EXECUTE",
            AvoidanceState::Yield => "YIELD",
        }
    }
}

/// Derive the behavioral state for this cycle.
///
/// * no targets -> NotAvoid
/// * a target that cannot be avoided and is already close, or a failed
///   safety check -> Yield
/// * active, safe shift lines -> AvoidExecute
/// * otherwise (plan exists or is pending, not yet executable) ->
///   AvoidPathNotReady
pub fn update_ego_state(
    data: &AvoidancePlanningData,
    safe: bool,
    has_active_shift: bool,
    config: &SafetyConfig,
) -> AvoidanceState {
    if data.target_objects.is_empty() {
        return AvoidanceState::NotAvoid;
    }

    let unavoidable_and_close = data
        .target_objects
        .iter()
        .any(|o| !o.is_avoidable && o.longitudinal < config.unavoidable_close_distance);

    if unavoidable_and_close || !safe {
        return AvoidanceState::Yield;
    }

    if has_active_shift {
        return AvoidanceState::AvoidExecute;
    }

    AvoidanceState::AvoidPathNotReady
}
