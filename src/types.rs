// src/types.rs
//
// Shared data model for the avoidance planner.
//
// Everything here is recreated each planning cycle from raw perception and
// the reference path, except the registered variants (RegisteredShiftLine,
// carried-forward ObjectData) which persist across cycles.

use std::collections::BTreeSet;

use geo::Polygon;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// GEOMETRY PRIMITIVES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: Point2) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// 2D pose on the road plane. Yaw follows the usual convention: 0 along +x,
/// counter-clockwise positive, so "left of the pose" is lateral-positive.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub position: Point2,
    pub yaw: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, yaw: f64) -> Self {
        Self {
            position: Point2::new(x, y),
            yaw,
        }
    }
}

/// Reference path the shift lines are defined against. Points are assumed
/// ordered and roughly equidistant; arc lengths are derived per cycle.
#[derive(Debug, Clone, Default)]
pub struct ReferencePath {
    pub points: Vec<Pose>,
}

impl ReferencePath {
    pub fn new(points: Vec<Pose>) -> Self {
        Self { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }
}

// ============================================================================
// SIDES AND CLASSIFICATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Car,
    Truck,
    Bus,
    Trailer,
    Motorcycle,
    Bicycle,
    Pedestrian,
    Unknown,
}

impl ObjectClass {
    /// Pedestrians, cyclists and unclassified returns are not "vehicles" for
    /// the parked-vehicle rules; they get the crosswalk rule instead.
    pub fn is_vehicle(self) -> bool {
        !matches!(
            self,
            ObjectClass::Pedestrian | ObjectClass::Bicycle | ObjectClass::Unknown
        )
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "car" => Some(ObjectClass::Car),
            "truck" => Some(ObjectClass::Truck),
            "bus" => Some(ObjectClass::Bus),
            "trailer" => Some(ObjectClass::Trailer),
            "motorcycle" => Some(ObjectClass::Motorcycle),
            "bicycle" => Some(ObjectClass::Bicycle),
            "pedestrian" => Some(ObjectClass::Pedestrian),
            "unknown" => Some(ObjectClass::Unknown),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectClass::Car => "car",
            ObjectClass::Truck => "truck",
            ObjectClass::Bus => "bus",
            ObjectClass::Trailer => "trailer",
            ObjectClass::Motorcycle => "motorcycle",
            ObjectClass::Bicycle => "bicycle",
            ObjectClass::Pedestrian => "pedestrian",
            ObjectClass::Unknown => "unknown",
        }
    }
}

// ============================================================================
// PERCEPTION INPUT
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ObjectShape {
    /// Bounding-box length along the object's heading [m].
    pub length: f64,
    /// Bounding-box width across the object's heading [m].
    pub width: f64,
}

/// One perception snapshot of a surrounding object, as delivered upstream.
#[derive(Debug, Clone)]
pub struct PredictedObject {
    pub id: Uuid,
    pub classification: ObjectClass,
    pub pose: Pose,
    /// Planar speed magnitude [m/s].
    pub speed: f64,
    pub shape: ObjectShape,
}

// ============================================================================
// REJECTION REASONS
// ============================================================================

/// Why an object was classified as "other" instead of an avoidance target.
/// Closed set; the filter never emits anything outside this enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NotTargetType,
    MovingObject,
    BehindEgo,
    TooFarAhead,
    BehindGoal,
    TooNearGoal,
    TooNearCenterline,
    CrosswalkUser,
    NotNeedAvoidance,
    BelowExecutionThreshold,
    NotParkedVehicle,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::NotTargetType => "not_target_type",
            RejectReason::MovingObject => "moving_object",
            RejectReason::BehindEgo => "behind_ego",
            RejectReason::TooFarAhead => "too_far_ahead",
            RejectReason::BehindGoal => "behind_goal",
            RejectReason::TooNearGoal => "too_near_goal",
            RejectReason::TooNearCenterline => "too_near_centerline",
            RejectReason::CrosswalkUser => "crosswalk_user",
            RejectReason::NotNeedAvoidance => "not_need_avoidance",
            RejectReason::BelowExecutionThreshold => "below_execution_threshold",
            RejectReason::NotParkedVehicle => "not_parked_vehicle",
        }
    }
}

/// Flat diagnostic record emitted for every rejected object.
#[derive(Debug, Clone, Serialize)]
pub struct RejectionRecord {
    pub object_id: Uuid,
    pub classification: ObjectClass,
    pub reason: RejectReason,
    pub longitudinal: f64,
    pub lateral: f64,
}

// ============================================================================
// OBJECT DATA
// ============================================================================

/// A perception object decorated with everything the filter and the outline
/// generator derive from it. Persistent fields (timers, envelope, hysteresis
/// flags) are carried forward across cycles by the object store.
#[derive(Debug, Clone)]
pub struct ObjectData {
    pub object: PredictedObject,

    /// Signed lateral deviation from the reference path, left positive [m].
    pub lateral: f64,
    /// Arc-length position of the envelope's nearest point, from ego [m].
    pub longitudinal: f64,
    /// Arc-length extent of the envelope along the path [m].
    pub length: f64,

    /// Lateral deviation of the envelope vertex protruding furthest toward
    /// the path. Positive-left like `lateral`.
    pub overhang_dist: f64,
    /// World position of that vertex.
    pub overhang_pose: Point2,

    /// Time-smoothed footprint hull (union with the registered polygon).
    pub envelope: Polygon<f64>,

    /// Lateral clearance from the envelope to the nearest non-drivable
    /// boundary on the object's side [m].
    pub to_road_shoulder_distance: f64,

    /// Required lateral margin. `None` means the object cannot be avoided
    /// within the drivable corridor (`is_avoidable` is false).
    pub avoid_margin: Option<f64>,

    /// Hysteretic avoid-necessity flag.
    pub avoid_required: bool,
    pub is_avoidable: bool,
    pub is_stoppable: bool,

    /// Seconds the object has been continuously moving / stopped.
    pub move_time: f64,
    pub stop_time: f64,
    pub last_seen: f64,
    pub last_stop: f64,
    pub last_move: f64,
    /// Seconds since the object was last matched to live perception.
    pub lost_time: f64,

    /// Lateral offset from the lane centerline normalized by the distance
    /// to the nearest road edge. Parked-vehicle classification input.
    pub shiftable_ratio: f64,

    /// Distance to whatever would make a stopped vehicle not-parked
    /// (red light, crosswalk) [m].
    pub to_stop_factor_distance: f64,
    /// Feasible stop distance in front of this object [m].
    pub to_stop_line: f64,

    pub reason: Option<RejectReason>,
}

impl ObjectData {
    pub fn new(object: PredictedObject) -> Self {
        Self {
            object,
            lateral: 0.0,
            longitudinal: 0.0,
            length: 0.0,
            overhang_dist: 0.0,
            overhang_pose: Point2::default(),
            envelope: Polygon::new(geo::LineString::new(vec![]), vec![]),
            to_road_shoulder_distance: f64::MAX,
            avoid_margin: None,
            avoid_required: false,
            is_avoidable: false,
            is_stoppable: false,
            move_time: 0.0,
            stop_time: 0.0,
            last_seen: 0.0,
            last_stop: 0.0,
            last_move: 0.0,
            lost_time: 0.0,
            shiftable_ratio: 0.0,
            to_stop_factor_distance: f64::MAX,
            to_stop_line: f64::MAX,
            reason: None,
        }
    }

    pub fn is_on_right(&self) -> bool {
        self.lateral < 0.0
    }

    pub fn side(&self) -> Side {
        if self.is_on_right() {
            Side::Right
        } else {
            Side::Left
        }
    }

    pub fn id(&self) -> Uuid {
        self.object.id
    }
}

// ============================================================================
// SHIFT LINES
// ============================================================================

/// One atomic lateral shift instruction: transition the offset from
/// `start_shift_length` to `end_shift_length` over the arc-length interval
/// [start_longitudinal, end_longitudinal].
///
/// Invariant: start_longitudinal <= end_longitudinal, and the interval lies
/// within [0, path length] once filled against a reference path.
#[derive(Debug, Clone, Default)]
pub struct AvoidLine {
    pub id: u64,
    /// Objects this line was generated for. Unioned through merges.
    pub object_ids: BTreeSet<Uuid>,
    /// Earlier lines whose arc-length interval overlaps this one. Preserves
    /// lineage through merge/trim stages.
    pub parent_ids: BTreeSet<u64>,

    pub start: Pose,
    pub end: Pose,
    pub start_idx: usize,
    pub end_idx: usize,
    pub start_longitudinal: f64,
    pub end_longitudinal: f64,
    pub start_shift_length: f64,
    pub end_shift_length: f64,
}

impl AvoidLine {
    pub fn relative_longitudinal(&self) -> f64 {
        self.end_longitudinal - self.start_longitudinal
    }

    pub fn relative_length(&self) -> f64 {
        self.end_shift_length - self.start_shift_length
    }

    pub fn gradient(&self) -> f64 {
        let dl = self.relative_longitudinal();
        if dl.abs() < 1.0e-6 {
            0.0
        } else {
            self.relative_length() / dl
        }
    }

    pub fn overlaps(&self, other: &AvoidLine) -> bool {
        !(self.end_longitudinal < other.start_longitudinal
            || other.end_longitudinal < self.start_longitudinal)
    }
}

/// One object's full candidate maneuver: shift out, optionally hold between
/// grouped objects, shift back to center.
#[derive(Debug, Clone)]
pub struct AvoidOutline {
    pub avoid_line: AvoidLine,
    pub return_line: AvoidLine,
    pub middle_lines: Vec<AvoidLine>,
}

impl AvoidOutline {
    pub fn new(avoid_line: AvoidLine, return_line: AvoidLine) -> Self {
        Self {
            avoid_line,
            return_line,
            middle_lines: Vec::new(),
        }
    }

    /// Lines in arc-length order: avoid, middles, return.
    pub fn into_lines(self) -> Vec<AvoidLine> {
        let mut out = Vec::with_capacity(2 + self.middle_lines.len());
        out.push(self.avoid_line);
        out.extend(self.middle_lines);
        out.push(self.return_line);
        out
    }
}

/// A previously approved shift line, persisted with its approval token and
/// world-frame anchor poses so it survives recomputation of the reference
/// path. Dropped once the ego passes `finish_pose` with zero residual shift.
#[derive(Debug, Clone)]
pub struct RegisteredShiftLine {
    pub token: Uuid,
    pub side: Side,
    pub line: AvoidLine,
    pub start_pose: Pose,
    pub finish_pose: Pose,
}

/// Obstacle polygon carved out of the drivable area for objects this
/// planner tracks but cannot shift around; consumed by the downstream
/// boundary builder.
#[derive(Debug, Clone)]
pub struct ObstacleCutout {
    pub pose: Pose,
    pub polygon: Polygon<f64>,
    pub is_left: bool,
}

// ============================================================================
// LANES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDirection {
    Left,
    Right,
    Straight,
}

/// Minimal lane geometry handed over by the lane/route graph collaborator.
#[derive(Debug, Clone)]
pub struct Lane {
    pub id: u64,
    pub centerline: Vec<Pose>,
    pub left_bound: Vec<Point2>,
    pub right_bound: Vec<Point2>,
    pub turn_direction: Option<TurnDirection>,
    pub is_road_shoulder: bool,
}

impl Lane {
    /// Lane surface polygon: left bound forward, right bound backward.
    pub fn polygon(&self) -> Polygon<f64> {
        let mut ring: Vec<geo::Coord<f64>> = self
            .left_bound
            .iter()
            .map(|p| geo::coord! { x: p.x, y: p.y })
            .collect();
        ring.extend(
            self.right_bound
                .iter()
                .rev()
                .map(|p| geo::coord! { x: p.x, y: p.y }),
        );
        Polygon::new(geo::LineString::new(ring), vec![])
    }
}

// ============================================================================
// PER-CYCLE PLANNING DATA
// ============================================================================

/// Snapshot owned by exactly one planning cycle. Built from scratch at the
/// start of the cycle and never mutated concurrently with the next one.
#[derive(Debug, Clone, Default)]
pub struct AvoidancePlanningData {
    pub reference_path: ReferencePath,
    /// Signed arc length of every path point, measured from the ego's
    /// nearest path index.
    pub arclength_from_ego: Vec<f64>,
    pub ego_idx: usize,
    pub ego_pose: Pose,
    pub ego_speed: f64,
    pub current_lanes: Vec<Lane>,
    pub target_objects: Vec<ObjectData>,
    pub other_objects: Vec<ObjectData>,
}

impl AvoidancePlanningData {
    pub fn path_length(&self) -> f64 {
        self.arclength_from_ego.last().copied().unwrap_or(0.0)
    }
}
