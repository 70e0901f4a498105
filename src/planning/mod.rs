// src/planning/mod.rs
//
// The avoidance planning engine. One call to run_cycle() executes the
// whole tick: object filtering, outline generation, the shift line
// pipeline, the safety gate, the ego state machine and cooperative
// registration, then commits cross-cycle state atomically at the end.
//
// Failure policy: data-unavailable conditions abort the cycle early and
// the previously committed plan is returned unchanged; a validity-check
// failure rejects this cycle's candidate batch but still commits the
// object bookkeeping. Nothing here propagates a hard error upward.

pub mod outline;
pub mod pipeline;
pub mod registration;
pub mod state;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::filter::{self, ObjectStore};
use crate::geometry;
use crate::interface::{
    ApprovalStatus, CooperationInterface, LaneNetwork, SafetyChecker, SurroundPartition,
};
use crate::path_shifter::{PathShifter, ShiftedPath};
use crate::types::{
    AvoidLine, AvoidancePlanningData, ObjectData, ObstacleCutout, Pose, PredictedObject,
    ReferencePath, RejectionRecord, Side,
};

use pipeline::ShiftLinePipeline;
use registration::{side_of, CooperativeRegistry};
use state::AvoidanceState;

const SHIFT_EPS: f64 = 1.0e-3;

/// Monotonic id source for shift lines within one engine instance.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator(u64);

impl IdGenerator {
    pub fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

/// Resolve a line's path indices and anchor poses from its arc-length
/// interval against this cycle's reference path.
pub fn fill_line_geometry(line: &mut AvoidLine, data: &AvoidancePlanningData) {
    let points = &data.reference_path.points;
    if points.is_empty() {
        return;
    }
    let arc = &data.arclength_from_ego;
    line.start_idx = geometry::index_from_arclength(arc, line.start_longitudinal);
    line.end_idx = geometry::index_from_arclength(arc, line.end_longitudinal);
    line.start = points[line.start_idx];
    line.end = points[line.end_idx];
}

// ============================================================================
// CYCLE INPUT / OUTPUT
// ============================================================================

#[derive(Debug, Clone)]
pub struct CycleInput<'a> {
    /// Monotonic wall time of this tick [s].
    pub now: f64,
    pub ego_pose: Pose,
    pub ego_speed: f64,
    pub reference_path: ReferencePath,
    pub objects: &'a [PredictedObject],
}

#[derive(Debug, Clone)]
pub struct PlanOutput {
    pub state: AvoidanceState,
    /// Approved lines currently driving the path shifter.
    pub shift_lines: Vec<AvoidLine>,
    /// This cycle's full candidate array (approved + pending).
    pub candidate_lines: Vec<AvoidLine>,
    pub shifted_path: ShiftedPath,
    /// Obstacle polygons for the downstream drivable-area builder.
    pub obstacle_cutouts: Vec<ObstacleCutout>,
    pub records: Vec<RejectionRecord>,
    /// True when a cycle abort or a rejected batch kept the previous plan.
    pub retained: bool,
}

impl Default for PlanOutput {
    fn default() -> Self {
        Self {
            state: AvoidanceState::NotAvoid,
            shift_lines: Vec::new(),
            candidate_lines: Vec::new(),
            shifted_path: ShiftedPath::default(),
            obstacle_cutouts: Vec::new(),
            records: Vec::new(),
            retained: false,
        }
    }
}

#[derive(Debug, Error)]
enum CycleAbort {
    #[error("reference path has fewer than two points")]
    EmptyPath,
    #[error("ego pose is not on the lane map")]
    NoLane,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct AvoidancePlanner {
    config: Config,
    store: ObjectStore,
    registry: CooperativeRegistry,
    path_shifter: PathShifter,
    ids: IdGenerator,
    committed: PlanOutput,
}

impl AvoidancePlanner {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: ObjectStore::default(),
            registry: CooperativeRegistry::new(),
            path_shifter: PathShifter::new(),
            ids: IdGenerator::default(),
            committed: PlanOutput::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn base_offset(&self) -> f64 {
        self.path_shifter.base_offset()
    }

    /// Run one planning tick. Never fails hard: aborted cycles return the
    /// previously committed plan flagged `retained`.
    pub fn run_cycle(
        &mut self,
        input: &CycleInput,
        lanes: &dyn LaneNetwork,
        safety: &dyn SafetyChecker,
        coop: &mut dyn CooperationInterface,
    ) -> PlanOutput {
        match self.try_cycle(input, lanes, safety, coop) {
            Ok(output) => {
                if !output.retained {
                    self.committed = output.clone();
                }
                output
            }
            Err(abort) => {
                warn!("planning cycle aborted: {abort}; retaining previous plan");
                let mut output = self.committed.clone();
                output.retained = true;
                output
            }
        }
    }

    fn try_cycle(
        &mut self,
        input: &CycleInput,
        lanes: &dyn LaneNetwork,
        safety: &dyn SafetyChecker,
        coop: &mut dyn CooperationInterface,
    ) -> Result<PlanOutput, CycleAbort> {
        // ------------------------------------------------------------------
        // Fundamental data.
        // ------------------------------------------------------------------
        if input.reference_path.len() < 2 {
            return Err(CycleAbort::EmptyPath);
        }
        let ego_lane = lanes
            .closest_lane(input.ego_pose.position)
            .ok_or(CycleAbort::NoLane)?;
        let current_lanes = lanes.lane_sequence(&ego_lane);
        if current_lanes.is_empty() {
            return Err(CycleAbort::NoLane);
        }

        let points = input.reference_path.points.clone();
        let ego_idx = geometry::nearest_index(&points, input.ego_pose.position);
        let mut data = AvoidancePlanningData {
            arclength_from_ego: geometry::arclength_from_index(&points, ego_idx),
            reference_path: ReferencePath::new(points),
            ego_idx,
            ego_pose: input.ego_pose,
            ego_speed: input.ego_speed,
            current_lanes,
            target_objects: Vec::new(),
            other_objects: Vec::new(),
        };

        self.path_shifter.set_reference(data.reference_path.clone());
        self.refresh_shifter_lines(&data);
        let base_offset = self.path_shifter.base_offset();

        // ------------------------------------------------------------------
        // Objects: derive, persist, filter. All mutation happens on a
        // scratch copy of the store, committed at the end of the cycle.
        // ------------------------------------------------------------------
        let mut store = self.store.clone();
        let mut records = Vec::new();
        let filter_cfg = &self.config.target_filter;

        let feasible_stop_distance =
            input.ego_speed.powi(2) / (2.0 * filter_cfg.max_deceleration.max(0.1));

        let mut now_objects: Vec<ObjectData> = Vec::new();
        for object in input.objects {
            let params = filter_cfg
                .class_params(object.classification)
                .cloned()
                .unwrap_or_default();

            let mut o = filter::create_object_data(object.clone(), &data.reference_path.points);
            filter::fill_envelope_and_extent(
                &mut o,
                &store.registered,
                &data.reference_path.points,
                data.ego_pose.position,
                &params,
            );
            filter::fill_object_moving_time(&mut o, &mut store.stopped, input.now, &params);
            o.to_stop_line = o.longitudinal - self.config.avoidance.longitudinal_margin_front;
            filter::fill_avoidance_necessity(
                &mut o,
                &store.registered,
                self.config.vehicle.width,
                filter_cfg,
                &params,
            );
            filter::fill_object_stoppable_judge(
                &mut o,
                &store.registered,
                feasible_stop_distance,
                filter_cfg,
            );
            now_objects.push(o);
        }

        filter::compensate_detection_lost(&store.registered, &mut now_objects, &[]);

        let ctx = filter::FilterContext {
            lanes,
            config: &self.config,
            now: input.now,
        };
        filter::filter_target_objects(now_objects, &mut data, &mut records, &ctx);
        filter::update_registered_objects(
            &mut store.registered,
            &data.target_objects,
            input.now,
            filter_cfg,
        );

        debug!(
            "cycle t={:.1}: {} targets, {} others",
            input.now,
            data.target_objects.len(),
            data.other_objects.len()
        );

        // ------------------------------------------------------------------
        // Outlines and the shift line pipeline.
        // ------------------------------------------------------------------
        let outlines = outline::generate_outlines(
            &mut data,
            &mut records,
            &self.config,
            base_offset,
            &mut self.ids,
        );

        self.registry.update(
            &data,
            base_offset,
            self.config.avoidance.base_offset_reset_threshold,
            coop,
        );

        let pipeline = ShiftLinePipeline {
            config: &self.config.avoidance,
            data: &data,
            base_offset,
            ego_speed: input.ego_speed,
        };
        let plan = match pipeline.run(outlines, self.registry.raw_lines(), &mut self.ids) {
            Ok(plan) => plan,
            Err(err) => {
                warn!("shift line batch rejected: {err}; retaining previous plan");
                self.store = store;
                let mut output = self.committed.clone();
                output.retained = true;
                output.records = records;
                return Ok(output);
            }
        };

        // ------------------------------------------------------------------
        // Safety gate on the candidate path.
        // ------------------------------------------------------------------
        let shift_side = plan
            .new_lines
            .first()
            .or_else(|| plan.candidate_lines.first())
            .map(side_of)
            .unwrap_or(Side::Left);

        let candidate_path = {
            let mut trial = PathShifter::new();
            trial.set_reference(data.reference_path.clone());
            trial.set_base_offset(base_offset);
            trial.set_shift_lines(plan.candidate_lines.clone());
            trial.generate().unwrap_or_default()
        };
        let partition = self.partition_surroundings(&data, shift_side, lanes);
        let verdict = safety.check(&candidate_path, &partition, self.config.safety.time_horizon);
        if !verdict.is_safe {
            debug!("safety check failed against {} objects", verdict.blocking.len());
        }

        // ------------------------------------------------------------------
        // Cooperative registration of new lines.
        // ------------------------------------------------------------------
        let mut all_approved = !plan.new_lines.is_empty();
        for side in [Side::Left, Side::Right] {
            let representative = plan.new_lines.iter().find(|l| side_of(l) == side);
            let Some(representative) = representative else {
                continue;
            };
            self.registry.request_candidate(
                side,
                representative,
                verdict.is_safe,
                representative.start_longitudinal,
                representative.end_longitudinal,
                self.config.avoidance.duplicate_pose_threshold,
                self.config.avoidance.duplicate_shift_threshold,
                coop,
            );
            if self.registry.candidate_status(side, coop) != Some(ApprovalStatus::Approved) {
                all_approved = false;
            }
        }

        if !plan.new_lines.is_empty() && all_approved && verdict.is_safe {
            info!(
                "{} new shift line(s) approved; committing to the path shifter",
                plan.new_lines.len()
            );
            for side in [Side::Left, Side::Right] {
                self.registry.promote_candidate(side, &plan.new_lines);
            }
            self.registry.set_raw_lines(plan.candidate_lines.clone());
            self.path_shifter
                .set_shift_lines(plan.candidate_lines.clone());
        }

        // ------------------------------------------------------------------
        // Ego state, postprocess, output.
        // ------------------------------------------------------------------
        let has_active_shift =
            !self.path_shifter.shift_lines().is_empty() || base_offset.abs() > SHIFT_EPS;
        let ego_state =
            state::update_ego_state(&data, verdict.is_safe, has_active_shift, &self.config.safety);

        self.path_shifter.remove_behind_and_rebase(data.ego_idx);

        if data.target_objects.is_empty() && self.path_shifter.shift_lines().is_empty() {
            self.registry.reset_if_returned(
                self.path_shifter.base_offset(),
                self.config.avoidance.base_offset_reset_threshold,
                coop,
            );
        }

        let shifted_path = self.path_shifter.generate().unwrap_or_else(|| ShiftedPath {
            path: data.reference_path.clone(),
            shift_length: vec![base_offset; data.reference_path.len()],
        });

        let all_objects: Vec<ObjectData> = data
            .target_objects
            .iter()
            .chain(data.other_objects.iter())
            .cloned()
            .collect();
        let obstacle_cutouts = filter::generate_obstacle_cutouts(
            &all_objects,
            self.config.vehicle.width,
            &self.config,
        );

        self.store = store;
        Ok(PlanOutput {
            state: ego_state,
            shift_lines: self.path_shifter.shift_lines().to_vec(),
            candidate_lines: plan.candidate_lines,
            shifted_path,
            obstacle_cutouts,
            records,
            retained: false,
        })
    }

    /// Re-anchor the approved lines on the new reference path via their
    /// stored world poses.
    fn refresh_shifter_lines(&mut self, data: &AvoidancePlanningData) {
        let points = &data.reference_path.points;
        let arc = &data.arclength_from_ego;
        let mut lines = self.path_shifter.shift_lines().to_vec();
        for line in lines.iter_mut() {
            line.start_idx = geometry::nearest_index(points, line.start.position);
            line.start_longitudinal = arc[line.start_idx];
            line.end_idx = geometry::nearest_index(points, line.end.position);
            line.end_longitudinal = arc[line.end_idx];
        }
        self.path_shifter.set_shift_lines(lines);
    }

    /// Partition surrounding objects ("other" plus unavoidable targets) by
    /// lane adjacency for the safety checker.
    fn partition_surroundings(
        &self,
        data: &AvoidancePlanningData,
        shift_side: Side,
        lanes: &dyn LaneNetwork,
    ) -> SurroundPartition {
        use geo::Contains;

        let safety_cfg = &self.config.safety;
        let mut partition = SurroundPartition::default();

        let shift_side_polygons: Vec<geo::Polygon<f64>> = data
            .current_lanes
            .iter()
            .flat_map(|l| lanes.adjacent_lanes(l, shift_side))
            .map(|l| l.polygon())
            .collect();

        let unavoidable = data.target_objects.iter().filter(|t| !t.is_avoidable);
        for o in data.other_objects.iter().chain(unavoidable) {
            let point = geo::Point::new(o.object.pose.position.x, o.object.pose.position.y);

            if data.current_lanes.iter().any(|l| l.polygon().contains(&point)) {
                if safety_cfg.check_current_lane {
                    partition.ego_lane.push(o.object.clone());
                }
                continue;
            }

            let on_shift_side = shift_side_polygons.iter().any(|p| p.contains(&point))
                || o.side() == shift_side;
            if on_shift_side {
                if safety_cfg.check_shift_side_lane {
                    partition.shift_side.push(o.object.clone());
                }
            } else if safety_cfg.check_other_side_lane {
                partition.opposite_side.push(o.object.clone());
            }
        }
        partition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{ManualApproval, PermissiveSafetyChecker, StraightRoad};
    use crate::types::{ObjectClass, ObjectShape};
    use approx::assert_relative_eq;
    use uuid::Uuid;

    fn reference_path(length: usize) -> ReferencePath {
        ReferencePath::new((0..length).map(|i| Pose::new(i as f64, 0.0, 0.0)).collect())
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

    /// Straight road with a wide right margin so a car parked on the right
    /// edge is comfortably avoidable.
    fn wide_road() -> StraightRoad {
        StraightRoad {
            length: 200.0,
            right_shoulder_width: 6.0,
            ..StraightRoad::default()
        }
    }

    #[test]
    fn empty_scene_stays_not_avoid() {
        let mut planner = AvoidancePlanner::new(Config::default());
        let road = wide_road();
        let safety = PermissiveSafetyChecker;
        let mut coop = ManualApproval::auto_after(1);

        let input = CycleInput {
            now: 0.0,
            ego_pose: Pose::new(0.0, 0.0, 0.0),
            ego_speed: 5.0,
            reference_path: reference_path(200),
            objects: &[],
        };
        let out = planner.run_cycle(&input, &road, &safety, &mut coop);
        assert_eq!(out.state, AvoidanceState::NotAvoid);
        assert!(out.shift_lines.is_empty());
        assert!(!out.retained);
    }

    #[test]
    fn empty_path_retains_previous_plan() {
        let mut planner = AvoidancePlanner::new(Config::default());
        let road = wide_road();
        let safety = PermissiveSafetyChecker;
        let mut coop = ManualApproval::auto_after(1);

        let input = CycleInput {
            now: 0.0,
            ego_pose: Pose::new(0.0, 0.0, 0.0),
            ego_speed: 5.0,
            reference_path: ReferencePath::default(),
            objects: &[],
        };
        let out = planner.run_cycle(&input, &road, &safety, &mut coop);
        assert!(out.retained);
        assert_eq!(out.state, AvoidanceState::NotAvoid);
    }

    #[test]
    fn parked_car_produces_an_executed_avoidance() {
        let mut planner = AvoidancePlanner::new(Config::default());
        let road = wide_road();
        let safety = PermissiveSafetyChecker;
        // Supervisor signs off after watching the request for two cycles.
        let mut coop = ManualApproval::auto_after(2);

        // Just off the ego lane on the right.
        let objects = vec![parked_car(60.0, -1.9)];

        let mut states = Vec::new();
        let mut last = PlanOutput::default();
        for tick in 0..5 {
            let input = CycleInput {
                now: tick as f64 * 0.1,
                ego_pose: Pose::new(0.0, 0.0, 0.0),
                ego_speed: 5.0,
                reference_path: reference_path(200),
                objects: &objects,
            };
            last = planner.run_cycle(&input, &road, &safety, &mut coop);
            states.push(last.state);
        }

        // Waiting for approval first, executing after the sign-off.
        assert_eq!(states[0], AvoidanceState::AvoidPathNotReady);
        assert_eq!(*states.last().unwrap(), AvoidanceState::AvoidExecute);

        // One avoid/return pair with a leftward (positive) peak.
        assert!(!last.shift_lines.is_empty());
        let peak = last
            .shift_lines
            .iter()
            .map(|l| l.end_shift_length)
            .fold(f64::MIN, f64::max);
        assert!(peak > 1.0, "expected a leftward shift, got {peak}");
        // The path bends left around the object.
        let max_y = last
            .shifted_path
            .path
            .points
            .iter()
            .map(|p| p.position.y)
            .fold(f64::MIN, f64::max);
        assert_relative_eq!(max_y, peak, epsilon = 1.0e-6);
        // ...and returns to center by the end of the path.
        let final_shift = *last.shifted_path.shift_length.last().unwrap();
        assert_relative_eq!(final_shift, 0.0, epsilon = 1.0e-6);

        // Intervals are ordered and non-overlapping.
        for pair in last.candidate_lines.windows(2) {
            assert!(pair[0].end_longitudinal <= pair[1].start_longitudinal + 1.0e-3);
        }
    }

    #[test]
    fn unavoidable_close_object_yields() {
        let mut planner = AvoidancePlanner::new(Config::default());
        // No room on either side.
        let road = StraightRoad {
            length: 200.0,
            left_shoulder_width: 0.0,
            right_shoulder_width: 0.0,
            ..StraightRoad::default()
        };
        let safety = PermissiveSafetyChecker;
        let mut coop = ManualApproval::auto_after(1);

        let objects = vec![parked_car(30.0, -1.4)];
        let input = CycleInput {
            now: 0.0,
            ego_pose: Pose::new(0.0, 0.0, 0.0),
            ego_speed: 5.0,
            reference_path: reference_path(200),
            objects: &objects,
        };
        let out = planner.run_cycle(&input, &road, &safety, &mut coop);
        assert_eq!(out.state, AvoidanceState::Yield);
    }
}
