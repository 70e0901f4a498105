// src/planning/registration.rs
//
// Cooperative registration: one outstanding approval slot per side, and
// the registered set of approved lines that persists across cycles with
// world-frame anchor poses.

use tracing::{debug, info};
use uuid::Uuid;

use crate::geometry;
use crate::interface::{ApprovalStatus, CooperationInterface};
use crate::types::{AvoidLine, AvoidancePlanningData, RegisteredShiftLine, Side};

const SHIFT_EPS: f64 = 1.0e-3;

/// Side a line is attributed to: the sign of its shift length at the
/// endpoint further from center. Positive is left.
pub fn side_of(line: &AvoidLine) -> Side {
    let representative = if line.end_shift_length.abs() >= line.start_shift_length.abs() {
        line.end_shift_length
    } else {
        line.start_shift_length
    };
    if representative < 0.0 {
        Side::Right
    } else {
        Side::Left
    }
}

#[derive(Debug, Clone, Default)]
struct CandidateSlot {
    token: Option<Uuid>,
    line: Option<AvoidLine>,
}

#[derive(Debug, Clone, Default)]
pub struct CooperativeRegistry {
    left: CandidateSlot,
    right: CandidateSlot,
    shifts: Vec<RegisteredShiftLine>,
    /// Raw registered lines fed back into the pipeline's combine stage.
    raw_lines: Vec<AvoidLine>,
}

impl CooperativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw_lines(&self) -> &[AvoidLine] {
        &self.raw_lines
    }

    pub fn registered_shifts(&self) -> &[RegisteredShiftLine] {
        &self.shifts
    }

    pub fn has_registered(&self) -> bool {
        !self.shifts.is_empty()
    }

    fn slot_mut(&mut self, side: Side) -> &mut CandidateSlot {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    /// Request approval for `line` on `side`. A materially different
    /// candidate replaces the previous unapproved one for that side; an
    /// unchanged candidate keeps its token so the approval can mature.
    pub fn request_candidate(
        &mut self,
        side: Side,
        line: &AvoidLine,
        safe: bool,
        start_distance: f64,
        finish_distance: f64,
        pose_threshold: f64,
        shift_threshold: f64,
        coop: &mut dyn CooperationInterface,
    ) -> Uuid {
        let slot = self.slot_mut(side);

        let unchanged = slot.line.as_ref().is_some_and(|prev| {
            prev.start.position.distance_to(line.start.position) <= pose_threshold
                && prev.end.position.distance_to(line.end.position) <= pose_threshold
                && (prev.end_shift_length - line.end_shift_length).abs() <= shift_threshold
        });

        let token = match (slot.token, unchanged) {
            (Some(token), true) => token,
            (previous, _) => {
                let token = Uuid::new_v4();
                slot.token = Some(token);
                slot.line = Some(line.clone());
                if let Some(old) = previous {
                    debug!("{} candidate replaced", side.as_str());
                    coop.remove(old);
                }
                token
            }
        };

        coop.update_status(token, safe, start_distance, finish_distance);
        token
    }

    pub fn candidate_status(
        &self,
        side: Side,
        coop: &dyn CooperationInterface,
    ) -> Option<ApprovalStatus> {
        let slot = match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        };
        slot.token.map(|t| coop.status(t))
    }

    pub fn cancel_candidate(&mut self, side: Side, coop: &mut dyn CooperationInterface) {
        let slot = self.slot_mut(side);
        if let Some(token) = slot.token.take() {
            coop.remove(token);
        }
        slot.line = None;
    }

    /// The candidate on `side` was approved: copy the new lines into the
    /// registered set under the slot's token and free the slot.
    pub fn promote_candidate(&mut self, side: Side, new_lines: &[AvoidLine]) {
        let slot = self.slot_mut(side);
        let Some(token) = slot.token.take() else {
            return;
        };
        slot.line = None;

        for line in new_lines.iter().filter(|l| side_of(l) == side) {
            info!(
                "registered {} shift line {} ([{:.1}, {:.1}] m, {:.2} m)",
                side.as_str(),
                line.id,
                line.start_longitudinal,
                line.end_longitudinal,
                line.end_shift_length
            );
            self.shifts.push(RegisteredShiftLine {
                token,
                side,
                line: line.clone(),
                start_pose: line.start,
                finish_pose: line.end,
            });
        }
    }

    /// Persist the full candidate array as the raw registered lines the
    /// next cycle's combine stage starts from.
    pub fn set_raw_lines(&mut self, lines: Vec<AvoidLine>) {
        self.raw_lines = lines;
    }

    /// Per-cycle maintenance: re-anchor raw lines on the new reference
    /// path, refresh approval distances, and drop registered lines the ego
    /// has passed once the cumulative shift is back to zero.
    pub fn update(
        &mut self,
        data: &AvoidancePlanningData,
        base_offset: f64,
        base_offset_threshold: f64,
        coop: &mut dyn CooperationInterface,
    ) {
        let path = &data.reference_path.points;
        let arc = &data.arclength_from_ego;

        for line in self.raw_lines.iter_mut() {
            line.start_idx = geometry::nearest_index(path, line.start.position);
            line.start_longitudinal = arc[line.start_idx];
            line.end_idx = geometry::nearest_index(path, line.end.position);
            line.end_longitudinal = arc[line.end_idx];
        }
        self.raw_lines.retain(|line| line.end_longitudinal > 0.0);

        let ego = data.ego_pose.position;
        let returned = base_offset.abs() < base_offset_threshold;
        self.shifts.retain_mut(|registered| {
            let start_distance = geometry::signed_arc_length(path, ego, registered.start_pose.position);
            let finish_distance =
                geometry::signed_arc_length(path, ego, registered.finish_pose.position);
            if returned && finish_distance < -SHIFT_EPS {
                info!(
                    "{} shift line passed; releasing approval slot",
                    registered.side.as_str()
                );
                coop.remove(registered.token);
                return false;
            }
            coop.update_status(registered.token, true, start_distance, finish_distance);
            true
        });
    }

    /// Clear everything, allowed only once the residual base offset is
    /// back at zero (resetting earlier would command a step in steering).
    pub fn reset_if_returned(
        &mut self,
        base_offset: f64,
        base_offset_threshold: f64,
        coop: &mut dyn CooperationInterface,
    ) -> bool {
        if base_offset.abs() > base_offset_threshold {
            debug!("base offset nonzero; keeping registered shift lines");
            return false;
        }
        for registered in self.shifts.drain(..) {
            coop.remove(registered.token);
        }
        self.raw_lines.clear();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::ManualApproval;
    use crate::types::{Pose, ReferencePath};

    fn line(start_arc: f64, end_arc: f64, end_shift: f64) -> AvoidLine {
        AvoidLine {
            id: 1,
            start: Pose::new(start_arc, 0.0, 0.0),
            end: Pose::new(end_arc, 0.0, 0.0),
            start_longitudinal: start_arc,
            end_longitudinal: end_arc,
            start_shift_length: 0.0,
            end_shift_length: end_shift,
            ..AvoidLine::default()
        }
    }

    fn data_with_ego_at(x: f64) -> AvoidancePlanningData {
        let points: Vec<Pose> = (0..200).map(|i| Pose::new(i as f64, 0.0, 0.0)).collect();
        let ego_idx = x as usize;
        AvoidancePlanningData {
            arclength_from_ego: crate::geometry::arclength_from_index(&points, ego_idx),
            reference_path: ReferencePath::new(points),
            ego_idx,
            ego_pose: Pose::new(x, 0.0, 0.0),
            ..AvoidancePlanningData::default()
        }
    }

    #[test]
    fn side_attribution_follows_shift_sign() {
        assert_eq!(side_of(&line(10.0, 30.0, 2.0)), Side::Left);
        assert_eq!(side_of(&line(10.0, 30.0, -2.0)), Side::Right);
    }

    #[test]
    fn unchanged_candidate_keeps_its_token() {
        let mut registry = CooperativeRegistry::new();
        let mut coop = ManualApproval::new();
        let l = line(10.0, 30.0, 2.0);

        let first = registry.request_candidate(Side::Left, &l, true, 10.0, 30.0, 1.0, 0.5, &mut coop);
        let second =
            registry.request_candidate(Side::Left, &l, true, 9.0, 29.0, 1.0, 0.5, &mut coop);
        assert_eq!(first, second);
    }

    #[test]
    fn new_candidate_replaces_the_unapproved_slot() {
        let mut registry = CooperativeRegistry::new();
        let mut coop = ManualApproval::new();

        let first_line = line(10.0, 30.0, 2.0);
        let first =
            registry.request_candidate(Side::Left, &first_line, true, 10.0, 30.0, 1.0, 0.5, &mut coop);

        let second_line = line(40.0, 70.0, 1.2);
        let second =
            registry.request_candidate(Side::Left, &second_line, true, 40.0, 70.0, 1.0, 0.5, &mut coop);

        assert_ne!(first, second);
        assert!(!coop.is_registered(first));
        assert!(coop.is_registered(second));
    }

    #[test]
    fn sides_have_independent_slots() {
        let mut registry = CooperativeRegistry::new();
        let mut coop = ManualApproval::new();

        let left =
            registry.request_candidate(Side::Left, &line(10.0, 30.0, 2.0), true, 10.0, 30.0, 1.0, 0.5, &mut coop);
        let right = registry.request_candidate(
            Side::Right,
            &line(50.0, 70.0, -1.5),
            true,
            50.0,
            70.0,
            1.0,
            0.5,
            &mut coop,
        );
        assert_ne!(left, right);
        assert!(coop.is_registered(left));
        assert!(coop.is_registered(right));
    }

    #[test]
    fn approved_lines_persist_and_expire_after_passing() {
        let mut registry = CooperativeRegistry::new();
        let mut coop = ManualApproval::new();
        let l = line(10.0, 30.0, 2.0);

        let token =
            registry.request_candidate(Side::Left, &l, true, 10.0, 30.0, 1.0, 0.5, &mut coop);
        coop.approve(token);
        registry.promote_candidate(Side::Left, &[l.clone()]);
        registry.set_raw_lines(vec![l]);
        assert!(registry.has_registered());

        // Ego before the finish pose: kept.
        registry.update(&data_with_ego_at(20.0), 1.5, 0.1, &mut coop);
        assert!(registry.has_registered());

        // Ego past the finish but still shifted: kept.
        registry.update(&data_with_ego_at(50.0), 1.5, 0.1, &mut coop);
        assert!(registry.has_registered());

        // Past the finish with the shift returned to zero: dropped.
        registry.update(&data_with_ego_at(50.0), 0.0, 0.1, &mut coop);
        assert!(!registry.has_registered());
        assert!(!coop.is_registered(token));
    }

    #[test]
    fn reset_is_guarded_by_base_offset() {
        let mut registry = CooperativeRegistry::new();
        let mut coop = ManualApproval::new();
        let l = line(10.0, 30.0, 2.0);
        let token =
            registry.request_candidate(Side::Left, &l, true, 10.0, 30.0, 1.0, 0.5, &mut coop);
        coop.approve(token);
        registry.promote_candidate(Side::Left, &[l]);

        assert!(!registry.reset_if_returned(0.8, 0.1, &mut coop));
        assert!(registry.has_registered());

        assert!(registry.reset_if_returned(0.0, 0.1, &mut coop));
        assert!(!registry.has_registered());
    }
}
