// src/debounce.rs
//
// Threshold debouncing shared by the filter's latched judgements
// (avoid-required, forced-avoidance, stoppable).

/// Evaluate a thresholded predicate with expansion hysteresis.
///
/// `check` receives a threshold scale factor: 1.0 on the rising edge,
/// `expand_factor` while the previous evaluation was already true. The flag
/// therefore only falls once the measurement clears the expanded threshold,
/// which suppresses chatter at the boundary.
pub fn hold_with_hysteresis<F>(check: F, expand_factor: f64, previous: Option<bool>) -> bool
where
    F: Fn(f64) -> bool,
{
    match previous {
        Some(true) => check(expand_factor),
        _ => check(1.0),
    }
}

/// Latch a boolean once it has been true while the carried state exists.
/// Used where a judgement must not flip back on marginal evidence
/// (stoppable objects stay stoppable while registered).
pub fn hold_sticky(raw: bool, previous: Option<bool>) -> bool {
    raw || previous.unwrap_or(false)
}
