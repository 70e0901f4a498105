// src/planning/pipeline.rs
//
// Multi-stage pipeline turning this cycle's outlines plus the registered
// shift lines into one ordered, non-overlapping shift-line array:
//
//   combine -> add-return-line -> merge -> fill-gap -> trim -> extract-new
//
// followed by a validity check that trial-builds the shifted path and
// rejects the whole batch when it would step away from the ego.
//
// Arc-length order is authoritative throughout. Sorting is stable and
// registered lines enter the array first, so exact ties resolve in favor
// of the older line.

use thiserror::Error;
use tracing::debug;

use crate::config::AvoidanceConfig;
use crate::path_shifter::{longitudinal_dist_from_jerk, PathShifter};
use crate::types::{AvoidLine, AvoidOutline, AvoidancePlanningData};

use super::{fill_line_geometry, IdGenerator};

const SHIFT_EPS: f64 = 1.0e-3;
const ARC_EPS: f64 = 1.0e-3;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("candidate path deviates {deviation:.2} m from the ego position")]
    InvalidCandidate { deviation: f64 },
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOutput {
    /// The full ordered shift-line array for this cycle.
    pub candidate_lines: Vec<AvoidLine>,
    /// Lines without a registered counterpart; these need fresh approval.
    pub new_lines: Vec<AvoidLine>,
}

pub struct ShiftLinePipeline<'a> {
    pub config: &'a AvoidanceConfig,
    pub data: &'a AvoidancePlanningData,
    /// Residual lateral offset under the ego.
    pub base_offset: f64,
    pub ego_speed: f64,
}

impl<'a> ShiftLinePipeline<'a> {
    pub fn run(
        &self,
        outlines: Vec<AvoidOutline>,
        registered_lines: &[AvoidLine],
        ids: &mut IdGenerator,
    ) -> Result<PipelineOutput, PipelineError> {
        let raw = self.combine(outlines, registered_lines);
        let with_return = self.add_return_line(raw, ids);
        let merged = self.merge(with_return);
        let filled = self.fill_gaps(merged, ids);
        let trimmed = self.trim(filled);

        self.check_validity(&trimmed)?;

        let new_lines = self.extract_new(&trimmed, registered_lines);
        debug!(
            "pipeline: {} candidate lines, {} new",
            trimmed.len(),
            new_lines.len()
        );

        Ok(PipelineOutput {
            candidate_lines: trimmed,
            new_lines,
        })
    }

    fn is_similar(&self, a: &AvoidLine, b: &AvoidLine) -> bool {
        a.start.position.distance_to(b.start.position) <= self.config.duplicate_pose_threshold
            && a.end.position.distance_to(b.end.position) <= self.config.duplicate_pose_threshold
            && (a.end_shift_length - b.end_shift_length).abs()
                <= self.config.duplicate_shift_threshold
    }

    // ------------------------------------------------------------------
    // combine
    // ------------------------------------------------------------------

    /// Registered lines first, then this cycle's outlines, skipping an
    /// outline whose object already has a near-identical registered line.
    fn combine(&self, outlines: Vec<AvoidOutline>, registered: &[AvoidLine]) -> Vec<AvoidLine> {
        let mut combined: Vec<AvoidLine> = registered.to_vec();

        for outline in outlines {
            let duplicate = registered.iter().any(|r| {
                outline
                    .avoid_line
                    .object_ids
                    .iter()
                    .any(|id| r.object_ids.contains(id))
                    && self.is_similar(r, &outline.avoid_line)
            });
            if duplicate {
                debug!("outline suppressed: near-identical registered line");
                continue;
            }
            combined.extend(outline.into_lines());
        }

        combined.sort_by(|a, b| a.start_longitudinal.total_cmp(&b.start_longitudinal));
        combined
    }

    // ------------------------------------------------------------------
    // add-return-line
    // ------------------------------------------------------------------

    /// Guarantee the profile ends back at the centerline: find the farthest
    /// nonzero terminal shift among the candidates (or the ego's own
    /// residual offset when there are none) and append a return line.
    fn add_return_line(&self, mut lines: Vec<AvoidLine>, ids: &mut IdGenerator) -> Vec<AvoidLine> {
        let path_end = self.data.path_length();
        let speed = self.ego_speed.max(self.config.nominal_avoidance_speed);

        let (return_from_arc, return_from_shift, carry) = match lines
            .iter()
            .max_by(|a, b| a.end_longitudinal.total_cmp(&b.end_longitudinal))
        {
            Some(last) => {
                if last.end_shift_length.abs() <= SHIFT_EPS {
                    return lines;
                }
                (
                    last.end_longitudinal,
                    last.end_shift_length,
                    last.object_ids.clone(),
                )
            }
            None => {
                if self.base_offset.abs() <= SHIFT_EPS {
                    return lines;
                }
                // Nothing planned but the ego is still offset: return from
                // a short prepare distance ahead.
                (
                    self.config.longitudinal_margin_rear.min(path_end),
                    self.base_offset,
                    Default::default(),
                )
            }
        };

        if return_from_arc >= path_end - ARC_EPS {
            return lines;
        }

        let span =
            longitudinal_dist_from_jerk(return_from_shift, self.config.lateral_jerk_limit, speed);
        let mut return_line = AvoidLine {
            id: ids.next(),
            object_ids: carry,
            start_longitudinal: return_from_arc,
            end_longitudinal: (return_from_arc + span).min(path_end),
            start_shift_length: return_from_shift,
            end_shift_length: 0.0,
            ..AvoidLine::default()
        };
        fill_line_geometry(&mut return_line, self.data);
        lines.push(return_line);
        lines
    }

    // ------------------------------------------------------------------
    // merge
    // ------------------------------------------------------------------

    /// Collapse overlapping same-side lines into one spanning line with the
    /// outermost peak, and fuse contiguous lines whose gradients lie within
    /// the similarity threshold. Parent-id sets are unioned either way.
    fn merge(&self, mut lines: Vec<AvoidLine>) -> Vec<AvoidLine> {
        lines.sort_by(|a, b| a.start_longitudinal.total_cmp(&b.start_longitudinal));

        let mut out: Vec<AvoidLine> = Vec::with_capacity(lines.len());
        for line in lines {
            let Some(last) = out.last_mut() else {
                out.push(line);
                continue;
            };

            let overlapping = line.start_longitudinal < last.end_longitudinal - ARC_EPS;
            let same_side = last.end_shift_length.signum() == line.end_shift_length.signum()
                && last.end_shift_length.abs() > SHIFT_EPS
                && line.end_shift_length.abs() > SHIFT_EPS;

            if overlapping && same_side {
                if line.end_longitudinal > last.end_longitudinal {
                    last.end_longitudinal = line.end_longitudinal;
                    last.end_idx = line.end_idx;
                    last.end = line.end;
                }
                if line.end_shift_length.abs() > last.end_shift_length.abs() {
                    last.end_shift_length = line.end_shift_length;
                }
                last.parent_ids.insert(line.id);
                last.parent_ids.extend(line.parent_ids.iter().copied());
                last.object_ids.extend(line.object_ids.iter().copied());
                continue;
            }

            let contiguous = (line.start_longitudinal - last.end_longitudinal).abs() <= ARC_EPS
                && (line.start_shift_length - last.end_shift_length).abs() <= SHIFT_EPS;
            let similar_gradient =
                (line.gradient() - last.gradient()).abs() <= self.config.similar_gradient_threshold;

            if contiguous && similar_gradient {
                last.end_longitudinal = line.end_longitudinal;
                last.end_idx = line.end_idx;
                last.end = line.end;
                last.end_shift_length = line.end_shift_length;
                last.parent_ids.insert(line.id);
                last.parent_ids.extend(line.parent_ids.iter().copied());
                last.object_ids.extend(line.object_ids.iter().copied());
                continue;
            }

            out.push(line);
        }
        out
    }

    // ------------------------------------------------------------------
    // fill-gap
    // ------------------------------------------------------------------

    /// Bridge every gap whose boundary shifts mismatch, or which would hold
    /// a nonzero shift without a line saying so, keeping the profile
    /// explicitly piecewise-linear. Also bridges from the ego's residual
    /// offset to the first line.
    fn fill_gaps(&self, lines: Vec<AvoidLine>, ids: &mut IdGenerator) -> Vec<AvoidLine> {
        if lines.is_empty() {
            return lines;
        }

        let mut out: Vec<AvoidLine> = Vec::with_capacity(lines.len() + 2);

        let first = &lines[0];
        if first.start_longitudinal > ARC_EPS
            && (first.start_shift_length - self.base_offset).abs() > SHIFT_EPS
        {
            let mut bridge = AvoidLine {
                id: ids.next(),
                parent_ids: [first.id].into_iter().collect(),
                object_ids: first.object_ids.clone(),
                start_longitudinal: 0.0,
                end_longitudinal: first.start_longitudinal,
                start_shift_length: self.base_offset,
                end_shift_length: first.start_shift_length,
                ..AvoidLine::default()
            };
            fill_line_geometry(&mut bridge, self.data);
            out.push(bridge);
        }

        for line in lines {
            if let Some(last) = out.last() {
                let gap = line.start_longitudinal - last.end_longitudinal;
                let mismatched =
                    (last.end_shift_length - line.start_shift_length).abs() > SHIFT_EPS;
                let nonzero = last.end_shift_length.abs() > SHIFT_EPS;
                if gap > ARC_EPS && mismatched && nonzero {
                    let mut bridge = AvoidLine {
                        id: ids.next(),
                        parent_ids: [last.id, line.id].into_iter().collect(),
                        object_ids: last
                            .object_ids
                            .iter()
                            .chain(line.object_ids.iter())
                            .copied()
                            .collect(),
                        start_longitudinal: last.end_longitudinal,
                        end_longitudinal: line.start_longitudinal,
                        start_shift_length: last.end_shift_length,
                        end_shift_length: line.start_shift_length,
                        ..AvoidLine::default()
                    };
                    fill_line_geometry(&mut bridge, self.data);
                    out.push(bridge);
                }
            }
            out.push(line);
        }
        out
    }

    // ------------------------------------------------------------------
    // trim
    // ------------------------------------------------------------------

    /// Quantize shift lengths, drop degenerate slivers, re-merge chains
    /// with near-equal gradients, and remove return-to-center lines
    /// superseded by a later same-side requirement.
    fn trim(&self, mut lines: Vec<AvoidLine>) -> Vec<AvoidLine> {
        if lines.is_empty() {
            return lines;
        }
        lines.sort_by(|a, b| a.start_longitudinal.total_cmp(&b.start_longitudinal));

        // 1. Quantize terminal shifts, re-chaining start shifts so the
        // profile stays continuous.
        let step = self.config.quantize_step;
        if step > SHIFT_EPS {
            let mut previous_end = lines[0].start_shift_length;
            for line in lines.iter_mut() {
                line.start_shift_length = previous_end;
                line.end_shift_length = (line.end_shift_length / step).round() * step;
                previous_end = line.end_shift_length;
            }
        }

        // 2. Drop slivers: shorter than the minimum span with no real
        // shift change. The implicit hold between lines covers the gap.
        let min_span = self.config.min_longitudinal_span;
        lines.retain(|line| {
            line.relative_longitudinal() >= min_span || line.relative_length().abs() > SHIFT_EPS
        });

        // Dropping can break shift continuity at the seam.
        let mut previous_end: Option<f64> = None;
        for line in lines.iter_mut() {
            if let Some(prev) = previous_end {
                if (line.start_shift_length - prev).abs() > SHIFT_EPS
                    && line.start_shift_length.abs() <= SHIFT_EPS
                {
                    line.start_shift_length = prev;
                }
            }
            previous_end = Some(line.end_shift_length);
        }

        // 3. Merge chains with near-equal gradients, even across a hold
        // gap (the gap counts as a zero-gradient segment).
        let mut out: Vec<AvoidLine> = Vec::with_capacity(lines.len());
        for line in lines {
            let Some(last) = out.last_mut() else {
                out.push(line);
                continue;
            };

            let combined = AvoidLine {
                start_longitudinal: last.start_longitudinal,
                end_longitudinal: line.end_longitudinal,
                start_shift_length: last.start_shift_length,
                end_shift_length: line.end_shift_length,
                ..AvoidLine::default()
            };
            let threshold = self.config.similar_gradient_threshold;
            let gap = line.start_longitudinal - last.end_longitudinal;
            let gap_ok = gap <= ARC_EPS || combined.gradient().abs() <= threshold;
            let similar = (combined.gradient() - last.gradient()).abs() <= threshold
                && (combined.gradient() - line.gradient()).abs() <= threshold
                && gap_ok;

            if similar {
                last.end_longitudinal = line.end_longitudinal;
                last.end_idx = line.end_idx;
                last.end = line.end;
                last.end_shift_length = line.end_shift_length;
                last.parent_ids.insert(line.id);
                last.parent_ids.extend(line.parent_ids.iter().copied());
                last.object_ids.extend(line.object_ids.iter().copied());
            } else {
                out.push(line);
            }
        }

        // 4. A return to center is unnecessary while a later line shifts
        // to the same side again: hold the shift instead.
        let mut i = 0;
        while i < out.len() {
            let is_return = out[i].end_shift_length.abs() <= SHIFT_EPS
                && out[i].start_shift_length.abs() > SHIFT_EPS;
            if is_return {
                let side = out[i].start_shift_length.signum();
                let superseded = out[i + 1..].iter().any(|later| {
                    later.end_shift_length.abs() > SHIFT_EPS
                        && later.end_shift_length.signum() == side
                });
                if superseded {
                    let held = out[i].start_shift_length;
                    out[i].end_shift_length = held;
                    if let Some(next) = out.get_mut(i + 1) {
                        next.start_shift_length = held;
                    }
                }
            }
            i += 1;
        }

        for line in out.iter_mut() {
            fill_line_geometry(line, self.data);
        }
        out
    }

    // ------------------------------------------------------------------
    // extract-new
    // ------------------------------------------------------------------

    /// Lines without a near-identical registered counterpart require fresh
    /// approval; matching lines pass through unchanged.
    fn extract_new(&self, candidate: &[AvoidLine], registered: &[AvoidLine]) -> Vec<AvoidLine> {
        candidate
            .iter()
            .filter(|c| !registered.iter().any(|r| self.is_similar(r, c)))
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // validity
    // ------------------------------------------------------------------

    /// Trial-build the shifted path; the lateral offset at the ego's arc
    /// position must stay within tolerance of the current base offset.
    fn check_validity(&self, candidate: &[AvoidLine]) -> Result<(), PipelineError> {
        let mut shifter = PathShifter::new();
        shifter.set_reference(self.data.reference_path.clone());
        shifter.set_base_offset(self.base_offset);
        shifter.set_shift_lines(candidate.to_vec());

        let shifted = match shifter.generate() {
            Some(shifted) => shifted,
            None => return Ok(()),
        };

        let at_ego = shifted
            .shift_length
            .get(self.data.ego_idx)
            .copied()
            .unwrap_or(self.base_offset);
        let deviation = at_ego - self.base_offset;
        if deviation.abs() > self.config.lateral_deviation_tolerance {
            return Err(PipelineError::InvalidCandidate { deviation });
        }
        Ok(())
    }
}
