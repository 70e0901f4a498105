// src/lib.rs
//
// Shift-line based lateral avoidance planning.
//
// Per-cycle data flow:
//   perception objects + reference path + ego pose
//     -> filter (target / other classification)
//     -> outline generator (per-object avoid/return candidates)
//     -> shift line pipeline (combine, merge, fill-gap, trim, extract-new)
//     -> safety gate + ego state machine
//     -> cooperative registration (approval slots, registered lines)
// committed atomically at the end of the tick by planning::AvoidancePlanner.

pub mod config;
pub mod debounce;
pub mod filter;
pub mod geometry;
pub mod interface;
pub mod path_shifter;
pub mod planning;
pub mod types;

pub use config::Config;
pub use planning::state::AvoidanceState;
pub use planning::{AvoidancePlanner, CycleInput, PlanOutput};
