// src/path_shifter.rs
//
// Rasterizes an ordered shift-line sequence into a laterally offset path.
// The planner uses it twice per cycle: once to trial-build the candidate
// path for the validity check, and once to emit the approved output path.
//
// Shift interpolation is piecewise linear between each line's endpoints;
// between lines the profile holds the previous line's end shift. A residual
// `base_offset` survives line removal so the path never jumps under the ego.

use tracing::warn;

use crate::geometry;
use crate::types::{AvoidLine, Pose, ReferencePath};

/// Reference path plus per-point lateral offsets.
#[derive(Debug, Clone, Default)]
pub struct ShiftedPath {
    pub path: ReferencePath,
    pub shift_length: Vec<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct PathShifter {
    reference: ReferencePath,
    shift_lines: Vec<AvoidLine>,
    base_offset: f64,
}

impl PathShifter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reference(&mut self, path: ReferencePath) {
        self.reference = path;
    }

    pub fn reference(&self) -> &ReferencePath {
        &self.reference
    }

    pub fn set_shift_lines(&mut self, mut lines: Vec<AvoidLine>) {
        lines.sort_by(|a, b| a.start_longitudinal.total_cmp(&b.start_longitudinal));
        self.shift_lines = lines;
    }

    pub fn shift_lines(&self) -> &[AvoidLine] {
        &self.shift_lines
    }

    pub fn base_offset(&self) -> f64 {
        self.base_offset
    }

    pub fn set_base_offset(&mut self, offset: f64) {
        self.base_offset = offset;
    }

    /// Apply the shift profile to the reference path. Returns `None` when
    /// the reference is too short to offset.
    pub fn generate(&self) -> Option<ShiftedPath> {
        if self.reference.len() < 2 {
            return None;
        }

        let points = &self.reference.points;
        let arc = geometry::cumulative_arclength(points);
        let mut shift_length = vec![self.base_offset; points.len()];

        for line in &self.shift_lines {
            if line.end_idx >= points.len() || line.start_idx > line.end_idx {
                warn!(
                    "shift line {} has indices outside the reference path; skipped",
                    line.id
                );
                continue;
            }
            let span = arc[line.end_idx] - arc[line.start_idx];
            for (i, shift) in shift_length.iter_mut().enumerate() {
                if i < line.start_idx {
                    continue;
                }
                if i >= line.end_idx || span < 1.0e-6 {
                    *shift = line.end_shift_length;
                    continue;
                }
                let t = ((arc[i] - arc[line.start_idx]) / span).clamp(0.0, 1.0);
                *shift = line.start_shift_length + t * line.relative_length();
            }
        }

        let shifted: Vec<Pose> = points
            .iter()
            .zip(shift_length.iter())
            .map(|(pose, s)| {
                Pose::new(
                    pose.position.x - s * pose.yaw.sin(),
                    pose.position.y + s * pose.yaw.cos(),
                    pose.yaw,
                )
            })
            .collect();

        Some(ShiftedPath {
            path: ReferencePath::new(shifted),
            shift_length,
        })
    }

    /// Drop lines whose interval ends behind `ego_idx` and fold their
    /// terminal shift into the base offset, so the remaining profile is
    /// continuous under the ego.
    pub fn remove_behind_and_rebase(&mut self, ego_idx: usize) {
        let mut new_base = self.base_offset;
        let mut last_removed_end = 0usize;
        let mut kept = Vec::with_capacity(self.shift_lines.len());

        for line in self.shift_lines.drain(..) {
            if line.end_idx <= ego_idx {
                if line.end_idx >= last_removed_end {
                    last_removed_end = line.end_idx;
                    new_base = line.end_shift_length;
                }
            } else {
                kept.push(line);
            }
        }

        self.shift_lines = kept;
        self.base_offset = new_base;
    }
}

// ============================================================================
// JERK FEASIBILITY
// ============================================================================

/// Longitudinal distance needed to shift `lateral` meters at `velocity`
/// under a minimal-time S-curve with peak jerk `jerk` and zero boundary
/// acceleration.
pub fn longitudinal_dist_from_jerk(lateral: f64, jerk: f64, velocity: f64) -> f64 {
    let j = jerk.abs();
    let l = lateral.abs();
    let v = velocity.abs();
    if j < 1.0e-8 {
        return 1.0e10;
    }
    4.0 * (0.5 * l / j).cbrt() * v
}

/// Inverse of `longitudinal_dist_from_jerk`: the peak jerk required to
/// shift `lateral` meters over `longitudinal` meters at `velocity`.
pub fn jerk_from_lat_lon_distance(lateral: f64, longitudinal: f64, velocity: f64) -> f64 {
    let l = lateral.abs();
    let d = longitudinal.abs().max(1.0e-6);
    let v = velocity.abs();
    0.5 * l * (4.0 * v / d).powi(3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Point2;
    use approx::assert_relative_eq;

    fn straight_reference(n: usize) -> ReferencePath {
        ReferencePath::new((0..n).map(|i| Pose::new(i as f64, 0.0, 0.0)).collect())
    }

    fn line(start_idx: usize, end_idx: usize, start_shift: f64, end_shift: f64) -> AvoidLine {
        AvoidLine {
            start_idx,
            end_idx,
            start_longitudinal: start_idx as f64,
            end_longitudinal: end_idx as f64,
            start_shift_length: start_shift,
            end_shift_length: end_shift,
            ..AvoidLine::default()
        }
    }

    #[test]
    fn empty_lines_reproduce_reference_with_base_offset() {
        let mut shifter = PathShifter::new();
        shifter.set_reference(straight_reference(10));
        shifter.set_base_offset(0.5);
        let out = shifter.generate().expect("path");
        assert!(out.shift_length.iter().all(|s| (s - 0.5).abs() < 1.0e-9));
        assert_relative_eq!(out.path.points[3].position.y, 0.5);
    }

    #[test]
    fn shift_interpolates_linearly_and_holds_after_end() {
        let mut shifter = PathShifter::new();
        shifter.set_reference(straight_reference(21));
        shifter.set_shift_lines(vec![line(5, 15, 0.0, 2.0)]);
        let out = shifter.generate().expect("path");
        assert_relative_eq!(out.shift_length[5], 0.0, epsilon = 1.0e-9);
        assert_relative_eq!(out.shift_length[10], 1.0, epsilon = 1.0e-9);
        assert_relative_eq!(out.shift_length[15], 2.0, epsilon = 1.0e-9);
        assert_relative_eq!(out.shift_length[20], 2.0, epsilon = 1.0e-9);
        // Left-positive shift moves the path up on a +x heading.
        assert_relative_eq!(out.path.points[15].position.y, 2.0, epsilon = 1.0e-9);
    }

    #[test]
    fn remove_behind_rebases_base_offset() {
        let mut shifter = PathShifter::new();
        shifter.set_reference(straight_reference(40));
        shifter.set_shift_lines(vec![line(2, 8, 0.0, 1.5), line(20, 30, 1.5, 0.0)]);
        shifter.remove_behind_and_rebase(12);
        assert_eq!(shifter.shift_lines().len(), 1);
        assert_relative_eq!(shifter.base_offset(), 1.5);

        let out = shifter.generate().expect("path");
        assert_relative_eq!(out.shift_length[12], 1.5, epsilon = 1.0e-9);
        assert_relative_eq!(out.shift_length[39], 0.0, epsilon = 1.0e-9);
    }

    #[test]
    fn jerk_formulas_are_inverse() {
        let lateral = 2.5;
        let velocity = 8.0;
        let jerk = 1.0;
        let dist = longitudinal_dist_from_jerk(lateral, jerk, velocity);
        assert_relative_eq!(
            jerk_from_lat_lon_distance(lateral, dist, velocity),
            jerk,
            epsilon = 1.0e-9
        );
    }

    #[test]
    fn nearest_index_sanity() {
        let path = straight_reference(10);
        assert_eq!(
            crate::geometry::nearest_index(&path.points, Point2::new(4.3, 1.0)),
            4
        );
    }
}
