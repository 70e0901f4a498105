// src/interface.rs
//
// Boundary to the external collaborators: the lane/route graph, the
// predicted-path safety checker, and the cooperative-approval transport.
// The planner only sees these traits; the concrete implementations here are
// the in-memory stand-ins used by the demo binary and the tests.

use std::collections::HashMap;

use geo::Polygon;
use uuid::Uuid;

use crate::path_shifter::ShiftedPath;
use crate::types::{Lane, Point2, Pose, PredictedObject, Side};

// ============================================================================
// LANE / ROUTE GRAPH
// ============================================================================

/// Outermost drivable boundary on one side of a lane.
#[derive(Debug, Clone)]
pub struct Boundary {
    pub line: Vec<Point2>,
    /// True when the boundary belongs to a road-shoulder lane rather than
    /// the road edge itself.
    pub is_road_shoulder: bool,
}

pub trait LaneNetwork {
    /// Lane whose surface is closest to `p`, if any lane is in range.
    fn closest_lane(&self, p: Point2) -> Option<Lane>;

    /// Lane sequence the ego currently follows, starting at `from`.
    fn lane_sequence(&self, from: &Lane) -> Vec<Lane>;

    /// Adjacent lanes on `side` of `lane` (same direction plus opposite
    /// where the map allows using it).
    fn adjacent_lanes(&self, lane: &Lane, side: Side) -> Vec<Lane>;

    /// Outermost drivable boundary on `side`, walking across adjacent
    /// lanes up to the road edge.
    fn outer_boundary(&self, lane: &Lane, side: Side) -> Boundary;

    /// Expandable boundary polygons (hatched road markings, intersection
    /// areas) near `p`.
    fn expandable_polygons_near(&self, p: Point2) -> Vec<Polygon<f64>>;

    /// True when `p` lies within `threshold` of a crosswalk polygon.
    fn near_crosswalk(&self, p: Point2, threshold: f64) -> bool;

    /// Arc distance from `p` to the next traffic light, +inf if none.
    fn distance_to_next_traffic_light(&self, p: Point2) -> f64;

    /// Arc distance from `p` to the next crosswalk, +inf if none.
    fn distance_to_next_crosswalk(&self, p: Point2) -> f64;

    /// Arc distance from `p` to the route goal, +inf while the goal is not
    /// on the current lane sequence.
    fn distance_to_goal(&self, p: Point2) -> f64;
}

// ============================================================================
// SAFETY CHECKER
// ============================================================================

/// Surrounding objects partitioned by lane adjacency relative to the
/// candidate shift.
#[derive(Debug, Clone, Default)]
pub struct SurroundPartition {
    pub ego_lane: Vec<PredictedObject>,
    pub shift_side: Vec<PredictedObject>,
    pub opposite_side: Vec<PredictedObject>,
}

#[derive(Debug, Clone)]
pub struct SafetyVerdict {
    pub is_safe: bool,
    pub blocking: Vec<Uuid>,
}

impl Default for SafetyVerdict {
    fn default() -> Self {
        Self {
            is_safe: true,
            blocking: Vec::new(),
        }
    }
}

pub trait SafetyChecker {
    fn check(
        &self,
        candidate: &ShiftedPath,
        surroundings: &SurroundPartition,
        time_horizon: f64,
    ) -> SafetyVerdict;
}

/// Passes everything. Default collaborator for tests and the demo, where
/// the scenario contains no moving traffic.
#[derive(Debug, Default)]
pub struct PermissiveSafetyChecker;

impl SafetyChecker for PermissiveSafetyChecker {
    fn check(
        &self,
        _candidate: &ShiftedPath,
        _surroundings: &SurroundPartition,
        _time_horizon: f64,
    ) -> SafetyVerdict {
        SafetyVerdict::default()
    }
}

// ============================================================================
// COOPERATIVE APPROVAL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStatus {
    Pending,
    Approved,
}

pub trait CooperationInterface {
    /// Refresh one token's request state. Called every cycle for the
    /// candidate of each side and for every registered line.
    fn update_status(
        &mut self,
        token: Uuid,
        safe: bool,
        start_distance: f64,
        finish_distance: f64,
    );

    fn status(&self, token: Uuid) -> ApprovalStatus;

    fn is_registered(&self, token: Uuid) -> bool;

    fn remove(&mut self, token: Uuid);
}

/// In-memory approval store. Either approves manually via `approve`, or
/// automatically after a token has been refreshed `auto_approve_after`
/// times (emulating a supervisor that signs off after watching the request
/// for a few cycles).
#[derive(Debug, Default)]
pub struct ManualApproval {
    auto_approve_after: Option<u32>,
    seen: HashMap<Uuid, u32>,
    approved: HashMap<Uuid, bool>,
}

impl ManualApproval {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_after(cycles: u32) -> Self {
        Self {
            auto_approve_after: Some(cycles),
            ..Self::default()
        }
    }

    pub fn approve(&mut self, token: Uuid) {
        self.approved.insert(token, true);
    }
}

impl CooperationInterface for ManualApproval {
    fn update_status(
        &mut self,
        token: Uuid,
        safe: bool,
        _start_distance: f64,
        _finish_distance: f64,
    ) {
        let count = self.seen.entry(token).or_insert(0);
        *count += 1;
        self.approved.entry(token).or_insert(false);
        if let Some(after) = self.auto_approve_after {
            if safe && *count >= after {
                self.approved.insert(token, true);
            }
        }
    }

    fn status(&self, token: Uuid) -> ApprovalStatus {
        match self.approved.get(&token) {
            Some(true) => ApprovalStatus::Approved,
            _ => ApprovalStatus::Pending,
        }
    }

    fn is_registered(&self, token: Uuid) -> bool {
        self.approved.contains_key(&token)
    }

    fn remove(&mut self, token: Uuid) {
        self.seen.remove(&token);
        self.approved.remove(&token);
    }
}

// ============================================================================
// STRAIGHT ROAD STUB
// ============================================================================

/// A single straight lane along +x with configurable widths, an optional
/// left road shoulder, and optional crosswalk / traffic-light / goal
/// positions. Enough map for scenario tests and the demo driver.
#[derive(Debug, Clone)]
pub struct StraightRoad {
    pub length: f64,
    pub lane_width: f64,
    /// Width of the drivable margin beyond the lane on each side.
    pub left_shoulder_width: f64,
    pub right_shoulder_width: f64,
    pub crosswalk_x: Option<f64>,
    pub traffic_light_x: Option<f64>,
    pub goal_x: Option<f64>,
    pub turn_direction: Option<crate::types::TurnDirection>,
}

impl Default for StraightRoad {
    fn default() -> Self {
        Self {
            length: 200.0,
            lane_width: 3.5,
            left_shoulder_width: 1.5,
            right_shoulder_width: 0.5,
            crosswalk_x: None,
            traffic_light_x: None,
            goal_x: None,
            turn_direction: None,
        }
    }
}

impl StraightRoad {
    fn lane(&self) -> Lane {
        let n = (self.length / 5.0).ceil() as usize + 1;
        let step = self.length / (n - 1) as f64;
        let half = self.lane_width / 2.0;
        Lane {
            id: 1,
            centerline: (0..n).map(|i| Pose::new(i as f64 * step, 0.0, 0.0)).collect(),
            left_bound: vec![Point2::new(0.0, half), Point2::new(self.length, half)],
            right_bound: vec![Point2::new(0.0, -half), Point2::new(self.length, -half)],
            turn_direction: self.turn_direction,
            is_road_shoulder: false,
        }
    }
}

impl LaneNetwork for StraightRoad {
    fn closest_lane(&self, p: Point2) -> Option<Lane> {
        if p.x < -10.0 || p.x > self.length + 10.0 {
            return None;
        }
        Some(self.lane())
    }

    fn lane_sequence(&self, from: &Lane) -> Vec<Lane> {
        vec![from.clone()]
    }

    fn adjacent_lanes(&self, _lane: &Lane, _side: Side) -> Vec<Lane> {
        Vec::new()
    }

    fn outer_boundary(&self, _lane: &Lane, side: Side) -> Boundary {
        let half = self.lane_width / 2.0;
        let (y, shoulder) = match side {
            Side::Left => (half + self.left_shoulder_width, self.left_shoulder_width > 0.0),
            Side::Right => (
                -half - self.right_shoulder_width,
                self.right_shoulder_width > 0.0,
            ),
        };
        Boundary {
            line: vec![Point2::new(0.0, y), Point2::new(self.length, y)],
            is_road_shoulder: shoulder,
        }
    }

    fn expandable_polygons_near(&self, _p: Point2) -> Vec<Polygon<f64>> {
        Vec::new()
    }

    fn near_crosswalk(&self, p: Point2, threshold: f64) -> bool {
        self.crosswalk_x
            .map(|x| (p.x - x).abs() < threshold + self.lane_width)
            .unwrap_or(false)
    }

    fn distance_to_next_traffic_light(&self, p: Point2) -> f64 {
        match self.traffic_light_x {
            Some(x) if x >= p.x => x - p.x,
            _ => f64::MAX,
        }
    }

    fn distance_to_next_crosswalk(&self, p: Point2) -> f64 {
        match self.crosswalk_x {
            Some(x) if x >= p.x => x - p.x,
            _ => f64::MAX,
        }
    }

    fn distance_to_goal(&self, p: Point2) -> f64 {
        match self.goal_x {
            Some(x) => x - p.x,
            None => f64::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_approval_auto_approves_after_n_updates() {
        let mut approval = ManualApproval::auto_after(3);
        let token = Uuid::new_v4();
        for _ in 0..2 {
            approval.update_status(token, true, 10.0, 30.0);
            assert_eq!(approval.status(token), ApprovalStatus::Pending);
        }
        approval.update_status(token, true, 10.0, 30.0);
        assert_eq!(approval.status(token), ApprovalStatus::Approved);
    }

    #[test]
    fn unsafe_candidate_is_never_auto_approved() {
        let mut approval = ManualApproval::auto_after(1);
        let token = Uuid::new_v4();
        for _ in 0..5 {
            approval.update_status(token, false, 10.0, 30.0);
        }
        assert_eq!(approval.status(token), ApprovalStatus::Pending);
    }

    #[test]
    fn straight_road_boundary_offsets() {
        let road = StraightRoad::default();
        let lane = road.closest_lane(Point2::new(50.0, 0.0)).expect("lane");
        let left = road.outer_boundary(&lane, Side::Left);
        let right = road.outer_boundary(&lane, Side::Right);
        assert!(left.line[0].y > right.line[0].y);
        assert!((left.line[0].y - (1.75 + 1.5)).abs() < 1.0e-9);
    }
}
