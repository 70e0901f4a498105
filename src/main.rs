// src/main.rs
//
// Demo driver: runs the avoidance planner against a synthetic straight-road
// scenario with parked vehicles and prints the state transitions and the
// final shift-line plan.

use anyhow::Result;
use avoidance_planner::interface::{ManualApproval, PermissiveSafetyChecker, StraightRoad};
use avoidance_planner::types::{ObjectClass, ObjectShape, Pose, PredictedObject, ReferencePath};
use avoidance_planner::{AvoidancePlanner, Config, CycleInput};
use tracing::{info, warn};
use uuid::Uuid;

const TICK_SECONDS: f64 = 0.1;
const TICKS: usize = 60;

fn main() -> Result<()> {
    let config = match Config::load("config.yaml") {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err:#}; using built-in defaults");
            Config::default()
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(format!("avoidance_planner={}", config.logging.level))
        .init();

    info!("avoidance planner demo starting");
    info!(
        "jerk limit {:.1} m/s^3, quantize step {:.1} m, execution threshold {:.2} m",
        config.avoidance.lateral_jerk_limit,
        config.avoidance.quantize_step,
        config.avoidance.lateral_execution_threshold
    );

    // Straight road, generous right-hand margin, two parked cars on the
    // right edge close enough to be taken in one maneuver.
    let road = StraightRoad {
        length: 250.0,
        right_shoulder_width: 6.0,
        ..StraightRoad::default()
    };
    let objects = vec![parked_car(70.0, -1.9), parked_car(95.0, -2.1)];
    info!("scenario: {} parked vehicle(s) on the right edge", objects.len());

    let reference_path =
        ReferencePath::new((0..250).map(|i| Pose::new(i as f64, 0.0, 0.0)).collect());

    let mut planner = AvoidancePlanner::new(config);
    let safety = PermissiveSafetyChecker;
    // Stand-in supervisor that approves a request after watching it for
    // half a second.
    let mut approval = ManualApproval::auto_after(5);

    let ego_speed = 8.0;
    let mut last_state = None;
    let mut last_output = None;

    for tick in 0..TICKS {
        let now = tick as f64 * TICK_SECONDS;
        // The ego creeps forward along the reference path.
        let ego_x = now * ego_speed;
        let input = CycleInput {
            now,
            ego_pose: Pose::new(ego_x, 0.0, 0.0),
            ego_speed,
            reference_path: reference_path.clone(),
            objects: &objects,
        };

        let output = planner.run_cycle(&input, &road, &safety, &mut approval);

        if output.retained {
            warn!("t={now:.1}s: cycle retained the previous plan");
        }
        if last_state != Some(output.state) {
            info!(
                "t={now:.1}s: state -> {} ({} candidate line(s), {} committed)",
                output.state.as_str(),
                output.candidate_lines.len(),
                output.shift_lines.len()
            );
            last_state = Some(output.state);
        }
        last_output = Some(output);
    }

    let Some(output) = last_output else {
        return Ok(());
    };

    info!("final state: {}", output.state.as_str());
    for line in &output.shift_lines {
        info!(
            "  shift line {}: [{:.1} m, {:.1} m] {:+.2} m -> {:+.2} m",
            line.id,
            line.start_longitudinal,
            line.end_longitudinal,
            line.start_shift_length,
            line.end_shift_length
        );
    }

    let peak = output
        .shifted_path
        .shift_length
        .iter()
        .fold(0.0_f64, |acc, s| if s.abs() > acc.abs() { *s } else { acc });
    info!("peak lateral offset on the output path: {peak:+.2} m");

    if !output.records.is_empty() {
        info!(
            "rejection records: {}",
            serde_json::to_string_pretty(&output.records)?
        );
    }

    Ok(())
}

fn parked_car(x: f64, y: f64) -> PredictedObject {
    PredictedObject {
        id: Uuid::new_v4(),
        classification: ObjectClass::Car,
        pose: Pose::new(x, y, 0.0),
        speed: 0.0,
        shape: ObjectShape {
            length: 4.0,
            width: 1.8,
        },
    }
}
