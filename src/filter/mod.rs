// src/filter/mod.rs
//
// Object target filter: decides, for every perception object, whether the
// planner should shift around it ("target") or leave it to longitudinal
// control ("other", tagged with a rejection reason).
//
// Persistence lives in ObjectStore: registered objects are carried forward
// by identity, falling back to a nearest-position match, and evicted after
// a lost-time threshold. The stopped-object registry backs the move/stop
// timers that drive the forced-avoidance rule.

use geo::Contains;
use tracing::debug;

use crate::config::{Config, ObjectClassParams, TargetFilterConfig};
use crate::debounce;
use crate::geometry;
use crate::interface::LaneNetwork;
use crate::types::{
    AvoidancePlanningData, Lane, ObjectData, ObstacleCutout, Point2, Pose, PredictedObject,
    RejectReason, RejectionRecord,
};

// ============================================================================
// SHIFT HELPERS
// ============================================================================

/// Required lateral shift to clear an object by `avoid_margin`. Magnitudes
/// at or below 1 mm collapse to exactly zero.
pub fn shift_length(is_object_on_right: bool, overhang_dist: f64, avoid_margin: f64) -> f64 {
    let shift = if is_object_on_right {
        overhang_dist + avoid_margin
    } else {
        overhang_dist - avoid_margin
    };
    if shift.abs() > 1.0e-3 {
        shift
    } else {
        0.0
    }
}

/// A shift pointing into the object's side is not an avoidance.
pub fn is_shift_necessary(is_object_on_right: bool, shift_length: f64) -> bool {
    if is_object_on_right && shift_length < 0.0 {
        return false;
    }
    if !is_object_on_right && shift_length > 0.0 {
        return false;
    }
    true
}

pub fn is_same_direction_shift(is_object_on_right: bool, shift_length: f64) -> bool {
    is_object_on_right == shift_length.is_sign_negative()
}

// ============================================================================
// OBJECT STORE
// ============================================================================

/// Cross-cycle object state, owned by the engine and passed into each
/// cycle. The engine mutates a scratch copy and commits it at cycle end.
#[derive(Debug, Clone, Default)]
pub struct ObjectStore {
    pub registered: Vec<ObjectData>,
    pub stopped: Vec<ObjectData>,
}

/// Refresh the registered set against this cycle's objects: identity match
/// first, nearest-position fallback second, eviction after the lost-time
/// threshold. New ids are appended.
pub fn update_registered_objects(
    registered: &mut Vec<ObjectData>,
    now_objects: &[ObjectData],
    now: f64,
    config: &TargetFilterConfig,
) {
    registered.retain_mut(|r| {
        let by_id = now_objects.iter().find(|o| o.id() == r.id());
        let matched = by_id.or_else(|| {
            now_objects.iter().find(|o| {
                o.object.pose.position.distance_to(r.object.pose.position)
                    < config.position_match_radius
            })
        });

        match matched {
            Some(m) => {
                *r = m.clone();
                r.last_seen = now;
                r.lost_time = 0.0;
                true
            }
            None => {
                r.lost_time = now - r.last_seen;
                r.lost_time <= config.object_last_seen_threshold
            }
        }
    });

    for o in now_objects {
        if !registered.iter().any(|r| r.id() == o.id()) {
            let mut fresh = o.clone();
            fresh.last_seen = now;
            registered.push(fresh);
        }
    }
}

/// Inject registered objects that perception dropped this cycle back into
/// the working set, unless an earlier stage already classified them as
/// "other". Keeps an avoidance in progress through detection dropouts.
pub fn compensate_detection_lost(
    registered: &[ObjectData],
    now_objects: &mut Vec<ObjectData>,
    other_objects: &[ObjectData],
) {
    for r in registered {
        let detected = now_objects.iter().any(|o| o.id() == r.id());
        let ignored = other_objects.iter().any(|o| o.id() == r.id());
        if !detected && !ignored {
            now_objects.push(r.clone());
        }
    }
}

// ============================================================================
// PER-OBJECT FILLS
// ============================================================================

/// Build the per-cycle ObjectData skeleton: path projection of the object
/// pose. Envelope, overhang and longitudinal extent are filled afterwards.
pub fn create_object_data(object: PredictedObject, path: &[Pose]) -> ObjectData {
    let mut data = ObjectData::new(object);
    if path.is_empty() {
        return data;
    }
    let idx = geometry::nearest_index(path, data.object.pose.position);
    data.lateral = geometry::lateral_deviation(&path[idx], data.object.pose.position);
    data
}

/// Envelope polygon smoothed against the registered polygon of the same
/// object, then overhang and longitudinal extent against the path.
pub fn fill_envelope_and_extent(
    object: &mut ObjectData,
    registered: &[ObjectData],
    path: &[Pose],
    ego_pos: Point2,
    params: &ObjectClassParams,
) {
    let idx = geometry::nearest_index(path, object.object.pose.position);
    let closest_pose = path[idx];

    let footprint = geometry::object_footprint(&object.object);
    let fresh = geometry::envelope_polygon(&footprint, &closest_pose, params.envelope_buffer_margin);

    object.envelope = match registered.iter().find(|r| r.id() == object.id()) {
        Some(prev) if prev.envelope.exterior().0.len() >= 4 => {
            geometry::smoothed_envelope(&fresh, &prev.envelope, &closest_pose)
        }
        _ => fresh,
    };

    let (overhang, overhang_pose) =
        geometry::envelope_overhang(&object.envelope, path, object.is_on_right());
    object.overhang_dist = overhang;
    object.overhang_pose = overhang_pose;

    let (longitudinal, length) =
        geometry::envelope_longitudinal_span(&object.envelope, path, ego_pos);
    object.longitudinal = longitudinal;
    object.length = length;
}

/// Move/stop timers against the stopped-object registry.
pub fn fill_object_moving_time(
    object: &mut ObjectData,
    stopped: &mut Vec<ObjectData>,
    now: f64,
    params: &ObjectClassParams,
) {
    let faster_than_threshold = object.object.speed > params.moving_speed_threshold;
    let idx = stopped.iter().position(|s| s.id() == object.id());

    if !faster_than_threshold {
        object.last_stop = now;
        object.move_time = 0.0;
        match idx {
            None => {
                object.stop_time = 0.0;
                object.last_move = now;
                stopped.push(object.clone());
            }
            Some(i) => {
                let entry = &mut stopped[i];
                entry.stop_time = now - entry.last_move;
                entry.last_stop = now;
                entry.move_time = 0.0;
                object.stop_time = entry.stop_time;
                object.last_move = entry.last_move;
            }
        }
        return;
    }

    match idx {
        None => {
            object.move_time = f64::INFINITY;
            object.stop_time = 0.0;
            object.last_move = now;
        }
        Some(i) => {
            object.last_stop = stopped[i].last_stop;
            object.move_time = now - stopped[i].last_stop;
            object.stop_time = 0.0;
            if object.move_time > params.moving_time_threshold {
                stopped.remove(i);
            }
        }
    }
}

/// Hysteretic avoid-necessity: once latched, the margin is expanded by the
/// configured factor before the flag may fall.
pub fn fill_avoidance_necessity(
    object: &mut ObjectData,
    registered: &[ObjectData],
    vehicle_width: f64,
    config: &TargetFilterConfig,
    params: &ObjectClassParams,
) {
    let safety_margin = 0.5 * vehicle_width + params.safety_buffer_lateral;
    let on_right = object.is_on_right();
    let overhang = object.overhang_dist;

    let check = move |factor: f64| {
        if on_right {
            overhang.abs() < safety_margin * factor
        } else {
            overhang < safety_margin * factor
        }
    };

    let previous = registered
        .iter()
        .find(|r| r.id() == object.id())
        .map(|r| r.avoid_required);

    object.avoid_required =
        debounce::hold_with_hysteresis(check, config.hysteresis_factor_expand_rate, previous);
}

/// Whether the ego could stop in front of this object. Sticky while the
/// object is registered; the "reliable" deceleration policy short-circuits
/// to always-stoppable.
pub fn fill_object_stoppable_judge(
    object: &mut ObjectData,
    registered: &[ObjectData],
    feasible_stop_distance: f64,
    config: &TargetFilterConfig,
) {
    if config.policy_deceleration == "reliable" {
        object.is_stoppable = true;
        return;
    }

    if !object.avoid_required {
        object.is_stoppable = false;
        return;
    }

    let raw = object.to_stop_line > feasible_stop_distance;
    let previous = registered
        .iter()
        .find(|r| r.id() == object.id())
        .map(|r| r.is_stoppable);
    object.is_stoppable = debounce::hold_sticky(raw, previous);
}

// ============================================================================
// AVOID MARGIN
// ============================================================================

/// Three-tier margin decision against the road-shoulder clearance:
/// unavoidable when even the hard clearance cannot fit the minimum margin,
/// clamped to the minimum when only the soft clearance fails, otherwise the
/// smaller of the soft limit and the nominal desired margin.
pub fn compute_avoid_margin(
    to_road_shoulder_distance: f64,
    vehicle_width: f64,
    params: &ObjectClassParams,
    config: &Config,
) -> Option<f64> {
    let max_margin = params.safety_buffer_lateral + params.avoid_margin_lateral + 0.5 * vehicle_width;
    let min_margin = params.safety_buffer_lateral + 0.5 * vehicle_width;
    let soft_limit =
        to_road_shoulder_distance - config.avoidance.soft_road_shoulder_margin - 0.5 * vehicle_width;
    let hard_limit =
        to_road_shoulder_distance - config.avoidance.hard_road_shoulder_margin - 0.5 * vehicle_width;

    if hard_limit < min_margin {
        return None;
    }
    if soft_limit < min_margin {
        return Some(min_margin);
    }
    Some(soft_limit.min(max_margin))
}

/// Drivable-area cut-outs for objects the shift planner tracks but cannot
/// maneuver around. The final boundary construction happens downstream;
/// this only supplies the obstacle polygons.
pub fn generate_obstacle_cutouts(
    objects: &[ObjectData],
    vehicle_width: f64,
    config: &Config,
) -> Vec<ObstacleCutout> {
    if !config.avoidance.enable_bound_clipping {
        return Vec::new();
    }

    let mut cutouts = Vec::new();
    for object in objects {
        if object.is_avoidable {
            continue;
        }
        let Some(margin) = object.avoid_margin else {
            continue;
        };
        let Some(params) = config.target_filter.class_params(object.object.classification) else {
            continue;
        };

        let buffer = margin - params.envelope_buffer_margin - vehicle_width / 2.0;
        cutouts.push(ObstacleCutout {
            pose: object.object.pose,
            polygon: geometry::expand_polygon(&object.envelope, buffer),
            is_left: object.lateral > 0.0,
        });
    }
    cutouts
}

// ============================================================================
// TARGET FILTER
// ============================================================================

pub struct FilterContext<'a> {
    pub lanes: &'a dyn LaneNetwork,
    pub config: &'a Config,
    pub now: f64,
}

fn reject(
    mut object: ObjectData,
    reason: RejectReason,
    data: &mut AvoidancePlanningData,
    records: &mut Vec<RejectionRecord>,
) {
    debug!(
        "object {} rejected: {} (lon={:.1}, lat={:.2})",
        object.id(),
        reason.as_str(),
        object.longitudinal,
        object.lateral
    );
    records.push(RejectionRecord {
        object_id: object.id(),
        classification: object.object.classification,
        reason,
        longitudinal: object.longitudinal,
        lateral: object.lateral,
    });
    object.reason = Some(reason);
    data.other_objects.push(object);
}

fn accept(mut object: ObjectData, now: f64, data: &mut AvoidancePlanningData) {
    object.last_seen = now;
    object.is_avoidable = object.avoid_margin.is_some();
    data.target_objects.push(object);
}

/// Shiftable-ratio parked classification for a vehicle inside the ego
/// lane: lateral offset from the lane centerline, normalized by the
/// distance the object could be shifted before reaching the road edge.
fn is_parked_vehicle(
    object: &mut ObjectData,
    lane: &Lane,
    lanes: &dyn LaneNetwork,
    config: &TargetFilterConfig,
) -> bool {
    if lane.centerline.is_empty() {
        return false;
    }

    let center_idx = geometry::nearest_index(&lane.centerline, object.object.pose.position);
    let center_pose = lane.centerline[center_idx];

    let boundary = lanes.outer_boundary(lane, object.side());
    let center_to_edge = geometry::point_polyline_distance(center_pose.position, &boundary.line);

    let mut shiftable_distance = center_to_edge - 0.5 * object.object.shape.width;
    if !boundary.is_road_shoulder {
        shiftable_distance += config.object_check_min_road_shoulder_width;
    }

    let offset_from_center =
        geometry::lateral_deviation(&center_pose, object.object.pose.position).abs();
    object.shiftable_ratio = offset_from_center / shiftable_distance.max(1.0e-6);

    object.shiftable_ratio > config.object_check_shiftable_ratio
}

/// The rejection cascade, first match wins. Objects land in
/// `data.target_objects` or `data.other_objects`; every rejection produces
/// a diagnostic record.
pub fn filter_target_objects(
    objects: Vec<ObjectData>,
    data: &mut AvoidancePlanningData,
    records: &mut Vec<RejectionRecord>,
    ctx: &FilterContext,
) {
    let filter = &ctx.config.target_filter;
    let ego_pos = data.ego_pose.position;
    let dist_to_goal = ctx.lanes.distance_to_goal(ego_pos);

    for mut o in objects {
        let class = o.object.classification;

        // Object type.
        let params = match filter.class_params(class) {
            Some(p) if p.is_target => p.clone(),
            _ => {
                reject(o, RejectReason::NotTargetType, data, records);
                continue;
            }
        };

        // Sustained motion.
        if o.move_time > params.moving_time_threshold {
            reject(o, RejectReason::MovingObject, data, records);
            continue;
        }

        // Longitudinal windows and route goal.
        if o.longitudinal < -filter.object_check_backward_distance {
            reject(o, RejectReason::BehindEgo, data, records);
            continue;
        }
        if o.longitudinal > filter.object_check_forward_distance {
            reject(o, RejectReason::TooFarAhead, data, records);
            continue;
        }
        if o.longitudinal > dist_to_goal {
            reject(o, RejectReason::BehindGoal, data, records);
            continue;
        }
        if o.longitudinal + o.length / 2.0 + filter.object_check_goal_distance > dist_to_goal {
            reject(o, RejectReason::TooNearGoal, data, records);
            continue;
        }

        let lane = match ctx.lanes.closest_lane(o.object.pose.position) {
            Some(lane) => lane,
            None => {
                debug!("object {} has no lane; skipped", o.id());
                continue;
            }
        };

        // Shoulder clearance on the object's side, extended by expandable
        // boundary polygons where the map provides them.
        let boundary = ctx.lanes.outer_boundary(&lane, o.side());
        let base_distance = geometry::polygon_polyline_distance(&o.envelope, &boundary.line);
        let toward = nearest_boundary_point(o.overhang_pose, &boundary.line);
        o.to_road_shoulder_distance = geometry::extend_distance_with_polygons(
            base_distance,
            o.overhang_pose,
            toward,
            &ctx.lanes.expandable_polygons_near(o.overhang_pose),
        );

        // Margin tiers (evaluated before the lateral rules so every accepted
        // object carries its margin; None means unavoidable, which is not a
        // rejection).
        o.avoid_margin = compute_avoid_margin(
            o.to_road_shoulder_distance,
            ctx.config.vehicle.width,
            &params,
            ctx.config,
        );

        // Centerline proximity / crosswalk rule.
        if !class.is_vehicle() {
            if ctx
                .lanes
                .near_crosswalk(o.object.pose.position, filter.crosswalk_proximity_threshold)
            {
                reject(o, RejectReason::CrosswalkUser, data, records);
            } else {
                // Non-vehicles away from crosswalks are always targeted,
                // wherever they stand in the lane.
                accept(o, ctx.now, data);
            }
            continue;
        }

        if o.lateral.abs() < filter.threshold_distance_object_is_on_center {
            reject(o, RejectReason::TooNearCenterline, data, records);
            continue;
        }

        // Shift direction and magnitude.
        if let Some(margin) = o.avoid_margin {
            let shift = shift_length(o.is_on_right(), o.overhang_dist, margin);
            if !is_shift_necessary(o.is_on_right(), shift) {
                reject(o, RejectReason::NotNeedAvoidance, data, records);
                continue;
            }
            if shift.abs() < ctx.config.avoidance.lateral_execution_threshold {
                reject(o, RejectReason::BelowExecutionThreshold, data, records);
                continue;
            }
        }

        // Parked classification for vehicles in the ego lane, with the
        // forced-avoidance override for long-stopped vehicles.
        let in_ego_lane = lane
            .polygon()
            .contains(&geo::Point::new(o.object.pose.position.x, o.object.pose.position.y));

        if in_ego_lane {
            let stopped_long_enough =
                o.stop_time > filter.threshold_time_force_avoidance;

            if stopped_long_enough && filter.force_avoidance_for_stopped_vehicle {
                let to_traffic_light = ctx
                    .lanes
                    .distance_to_next_traffic_light(o.object.pose.position);
                let mut not_parked =
                    to_traffic_light < filter.object_ignore_section_traffic_light_distance;

                let to_crosswalk =
                    ctx.lanes.distance_to_next_crosswalk(ego_pos) - o.longitudinal;
                let stopped_for_crosswalk = to_crosswalk
                    < filter.object_ignore_section_crosswalk_in_front_distance
                    && to_crosswalk
                        > -filter.object_ignore_section_crosswalk_behind_distance;
                not_parked = not_parked || stopped_for_crosswalk;

                o.to_stop_factor_distance = to_traffic_light.min(to_crosswalk);

                if !not_parked {
                    accept(o, ctx.now, data);
                    continue;
                }
            }

            // No parked vehicles inside turn lanes.
            if lane.turn_direction.is_some() {
                reject(o, RejectReason::NotParkedVehicle, data, records);
                continue;
            }

            if !is_parked_vehicle(&mut o, &lane, ctx.lanes, filter) {
                reject(o, RejectReason::NotParkedVehicle, data, records);
                continue;
            }
        }

        accept(o, ctx.now, data);
    }

    data.target_objects
        .sort_by(|a, b| a.longitudinal.total_cmp(&b.longitudinal));
}

fn nearest_boundary_point(p: Point2, line: &[Point2]) -> Point2 {
    let mut best = p;
    let mut best_dist = f64::MAX;
    for w in line.windows(2) {
        let (a, b) = (w[0], w[1]);
        let abx = b.x - a.x;
        let aby = b.y - a.y;
        let len2 = abx * abx + aby * aby;
        let t = if len2 < 1.0e-12 {
            0.0
        } else {
            (((p.x - a.x) * abx + (p.y - a.y) * aby) / len2).clamp(0.0, 1.0)
        };
        let q = Point2::new(a.x + t * abx, a.y + t * aby);
        let d = p.distance_to(q);
        if d < best_dist {
            best_dist = d;
            best = q;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::StraightRoad;
    use crate::types::{ObjectClass, ObjectShape, ReferencePath};
    use approx::assert_relative_eq;
    use uuid::Uuid;

    fn straight_path(n: usize) -> Vec<Pose> {
        (0..n).map(|i| Pose::new(i as f64, 0.0, 0.0)).collect()
    }

    fn car_at(x: f64, y: f64) -> PredictedObject {
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

    fn prepared_object(x: f64, y: f64, path: &[Pose]) -> ObjectData {
        let mut o = create_object_data(car_at(x, y), path);
        let params = ObjectClassParams::default();
        fill_envelope_and_extent(&mut o, &[], path, Point2::new(0.0, 0.0), &params);
        o
    }

    fn planning_data(path: Vec<Pose>) -> AvoidancePlanningData {
        AvoidancePlanningData {
            reference_path: ReferencePath::new(path.clone()),
            arclength_from_ego: geometry::arclength_from_index(&path, 0),
            ego_idx: 0,
            ego_pose: path[0],
            ego_speed: 5.0,
            ..AvoidancePlanningData::default()
        }
    }

    #[test]
    fn shift_length_adds_margin_on_the_outside() {
        assert_relative_eq!(shift_length(true, 2.0, 0.5), 2.5);
        assert_relative_eq!(shift_length(false, 2.0, 0.5), 1.5);
        assert_relative_eq!(shift_length(true, -0.0005, 0.0), 0.0);
    }

    #[test]
    fn necessity_rejects_shifts_into_the_object() {
        assert!(!is_shift_necessary(true, -0.2));
        assert!(is_shift_necessary(true, 0.2));
        assert!(!is_shift_necessary(false, 0.2));
        assert!(is_shift_necessary(false, -0.2));
    }

    #[test]
    fn same_direction_shift_matches_the_object_side() {
        assert!(is_same_direction_shift(true, -0.5));
        assert!(!is_same_direction_shift(true, 0.5));
        assert!(is_same_direction_shift(false, 0.5));
    }

    #[test]
    fn tight_shoulder_means_unavoidable() {
        let config = Config::default();
        let params = ObjectClassParams::default();
        // min margin = 0.3 + 0.915 = 1.215; hard limit = 1.0 - 0.3 - 0.915 < min
        let margin = compute_avoid_margin(1.0, config.vehicle.width, &params, &config);
        assert!(margin.is_none());

        // Ample clearance: limited by the nominal desired margin.
        let margin = compute_avoid_margin(10.0, config.vehicle.width, &params, &config)
            .expect("avoidable");
        assert_relative_eq!(
            margin,
            params.safety_buffer_lateral + params.avoid_margin_lateral + 0.5 * config.vehicle.width
        );
    }

    #[test]
    fn unavoidable_object_is_tracked_without_margin() {
        let path = straight_path(120);
        // Parked far on the left with almost no shoulder behind it.
        let road = StraightRoad {
            left_shoulder_width: 0.0,
            ..StraightRoad::default()
        };
        let mut o = prepared_object(30.0, 1.4, &path);
        o.stop_time = 0.0;

        let config = Config::default();
        let mut data = planning_data(path);
        let mut records = Vec::new();
        let ctx = FilterContext {
            lanes: &road,
            config: &config,
            now: 0.0,
        };
        filter_target_objects(vec![o], &mut data, &mut records, &ctx);

        assert_eq!(data.target_objects.len(), 1);
        let target = &data.target_objects[0];
        assert!(target.avoid_margin.is_none());
        assert!(!target.is_avoidable);
    }

    #[test]
    fn moving_object_is_rejected() {
        let path = straight_path(120);
        let road = StraightRoad::default();
        let mut o = prepared_object(30.0, 1.4, &path);
        o.move_time = 10.0;

        let config = Config::default();
        let mut data = planning_data(path);
        let mut records = Vec::new();
        let ctx = FilterContext {
            lanes: &road,
            config: &config,
            now: 0.0,
        };
        filter_target_objects(vec![o], &mut data, &mut records, &ctx);

        assert!(data.target_objects.is_empty());
        assert_eq!(records[0].reason, RejectReason::MovingObject);
    }

    #[test]
    fn centered_vehicle_is_rejected() {
        let path = straight_path(120);
        let road = StraightRoad::default();
        let o = prepared_object(30.0, 0.3, &path);

        let config = Config::default();
        let mut data = planning_data(path);
        let mut records = Vec::new();
        let ctx = FilterContext {
            lanes: &road,
            config: &config,
            now: 0.0,
        };
        filter_target_objects(vec![o], &mut data, &mut records, &ctx);

        assert!(data.target_objects.is_empty());
        assert_eq!(records[0].reason, RejectReason::TooNearCenterline);
    }

    #[test]
    fn long_stopped_vehicle_in_ego_lane_is_forced_target() {
        let path = straight_path(120);
        // Wide lane so the object sits inside the ego lane polygon but off
        // center; no light or crosswalk ahead.
        let road = StraightRoad {
            lane_width: 4.0,
            ..StraightRoad::default()
        };
        let config = Config::default();
        let mut o = prepared_object(30.0, 1.2, &path);
        o.stop_time = config.target_filter.threshold_time_force_avoidance + 1.0;

        let mut data = planning_data(path);
        let mut records = Vec::new();
        let ctx = FilterContext {
            lanes: &road,
            config: &config,
            now: 0.0,
        };
        filter_target_objects(vec![o], &mut data, &mut records, &ctx);

        assert_eq!(data.target_objects.len(), 1);
    }

    #[test]
    fn stopped_vehicle_before_traffic_light_is_not_forced() {
        let path = straight_path(120);
        let road = StraightRoad {
            lane_width: 4.0,
            traffic_light_x: Some(45.0),
            ..StraightRoad::default()
        };
        let config = Config::default();
        let mut o = prepared_object(30.0, 1.2, &path);
        o.stop_time = config.target_filter.threshold_time_force_avoidance + 1.0;

        let mut data = planning_data(path);
        let mut records = Vec::new();
        let ctx = FilterContext {
            lanes: &road,
            config: &config,
            now: 0.0,
        };
        filter_target_objects(vec![o], &mut data, &mut records, &ctx);

        // Waiting at the light: falls through to the parked check, where a
        // near-center vehicle fails the shiftable ratio.
        assert!(data.target_objects.is_empty());
        assert_eq!(records[0].reason, RejectReason::NotParkedVehicle);
    }

    #[test]
    fn pedestrian_near_crosswalk_is_left_alone() {
        let path = straight_path(120);
        let road = StraightRoad {
            crosswalk_x: Some(30.0),
            ..StraightRoad::default()
        };
        let config = Config::default();
        let mut pedestrian = car_at(30.0, 1.4);
        pedestrian.classification = ObjectClass::Pedestrian;
        pedestrian.shape = ObjectShape {
            length: 0.6,
            width: 0.6,
        };
        let mut o = create_object_data(pedestrian, &path);
        fill_envelope_and_extent(
            &mut o,
            &[],
            &path,
            Point2::new(0.0, 0.0),
            &ObjectClassParams::default(),
        );

        let mut data = planning_data(path);
        let mut records = Vec::new();
        let ctx = FilterContext {
            lanes: &road,
            config: &config,
            now: 0.0,
        };
        filter_target_objects(vec![o], &mut data, &mut records, &ctx);

        assert!(data.target_objects.is_empty());
        assert_eq!(records[0].reason, RejectReason::CrosswalkUser);
    }

    #[test]
    fn cutouts_cover_only_unavoidable_tracked_objects() {
        let mut config = Config::default();
        config.avoidance.enable_bound_clipping = true;
        let path = straight_path(120);

        let mut avoidable = prepared_object(30.0, 1.4, &path);
        avoidable.avoid_margin = Some(2.0);
        avoidable.is_avoidable = true;

        let mut infeasible = prepared_object(50.0, -1.9, &path);
        infeasible.avoid_margin = Some(2.0);
        infeasible.is_avoidable = false;

        let mut no_margin = prepared_object(70.0, 1.4, &path);
        no_margin.avoid_margin = None;
        no_margin.is_avoidable = false;

        let cutouts = generate_obstacle_cutouts(
            &[avoidable, infeasible, no_margin],
            config.vehicle.width,
            &config,
        );
        assert_eq!(cutouts.len(), 1);
        assert!(!cutouts[0].is_left);

        // Disabled clipping emits nothing.
        config.avoidance.enable_bound_clipping = false;
        let none = generate_obstacle_cutouts(&[], config.vehicle.width, &config);
        assert!(none.is_empty());
    }

    #[test]
    fn necessity_hysteresis_holds_once_latched() {
        let config = Config::default();
        let params = ObjectClassParams::default();
        let path = straight_path(120);

        // Overhang just outside the nominal margin: raw check is false.
        let mut o = prepared_object(30.0, 1.6, &path);
        o.overhang_dist = 0.5 * config.vehicle.width + params.safety_buffer_lateral + 0.1;

        fill_avoidance_necessity(&mut o, &[], config.vehicle.width, &config.target_filter, &params);
        assert!(!o.avoid_required);

        // Same measurement, but the registered copy already latched the
        // flag: the expanded margin keeps it up.
        let mut registered = o.clone();
        registered.avoid_required = true;
        fill_avoidance_necessity(
            &mut o,
            &[registered],
            config.vehicle.width,
            &config.target_filter,
            &params,
        );
        assert!(o.avoid_required);
    }

    #[test]
    fn registered_objects_survive_dropouts_until_threshold() {
        let config = Config::default();
        let path = straight_path(120);
        let o = prepared_object(30.0, 1.4, &path);
        let mut registered = Vec::new();

        update_registered_objects(&mut registered, &[o.clone()], 0.0, &config.target_filter);
        assert_eq!(registered.len(), 1);

        // Dropout shorter than the threshold: kept, and compensated back
        // into the working set.
        update_registered_objects(&mut registered, &[], 1.0, &config.target_filter);
        assert_eq!(registered.len(), 1);
        let mut now_objects = Vec::new();
        compensate_detection_lost(&registered, &mut now_objects, &[]);
        assert_eq!(now_objects.len(), 1);

        // Past the threshold: evicted.
        update_registered_objects(&mut registered, &[], 10.0, &config.target_filter);
        assert!(registered.is_empty());
    }

    #[test]
    fn position_match_carries_identity_across_id_change() {
        let config = Config::default();
        let path = straight_path(120);
        let o = prepared_object(30.0, 1.4, &path);
        let mut registered = Vec::new();
        update_registered_objects(&mut registered, &[o.clone()], 0.0, &config.target_filter);

        // Same physical object, new perception id, sub-radius displacement.
        let mut renamed = prepared_object(30.4, 1.4, &path);
        renamed.avoid_required = true;
        update_registered_objects(&mut registered, &[renamed.clone()], 0.5, &config.target_filter);

        assert!(registered.iter().any(|r| r.id() == renamed.id()));
    }

    #[test]
    fn stop_timer_accumulates_across_cycles() {
        let params = ObjectClassParams::default();
        let path = straight_path(120);
        let mut stopped = Vec::new();

        let mut o = prepared_object(30.0, 1.4, &path);
        fill_object_moving_time(&mut o, &mut stopped, 0.0, &params);
        assert_relative_eq!(o.stop_time, 0.0);

        let mut o = prepared_object(30.0, 1.4, &path);
        fill_object_moving_time(&mut o, &mut stopped, 4.0, &params);
        assert_relative_eq!(o.stop_time, 4.0);

        // Starts moving: move_time counts from the last stop.
        let mut o = prepared_object(30.0, 1.4, &path);
        o.object.speed = 5.0;
        fill_object_moving_time(&mut o, &mut stopped, 5.0, &params);
        assert_relative_eq!(o.move_time, 1.0);
    }
}
