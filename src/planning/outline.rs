// src/planning/outline.rs
//
// Builds one candidate maneuver per eligible target: an avoid line that
// transitions from the current shift to the required shift over a
// jerk-feasible span, and a return line back to center beyond the object.
// Nearby same-side maneuvers are chained with middle lines instead of
// returning to center in between.
//
// Objects whose maneuver is degenerate (sub-quantization shift, or more
// jerk than the hard limit would be needed in the available distance) are
// folded back into other_objects.

use tracing::debug;

use crate::config::Config;
use crate::filter;
use crate::path_shifter::{jerk_from_lat_lon_distance, longitudinal_dist_from_jerk};
use crate::types::{
    AvoidLine, AvoidOutline, AvoidancePlanningData, ObjectData, RejectReason, RejectionRecord,
};

use super::{fill_line_geometry, IdGenerator};

enum Decision {
    Built(AvoidOutline),
    NoOutline,
    Fold(RejectReason),
}

pub fn generate_outlines(
    data: &mut AvoidancePlanningData,
    records: &mut Vec<RejectionRecord>,
    config: &Config,
    base_offset: f64,
    ids: &mut IdGenerator,
) -> Vec<AvoidOutline> {
    let mut outlines = Vec::new();
    let mut kept = Vec::new();

    let targets = std::mem::take(&mut data.target_objects);
    for mut o in targets {
        match build_outline(&o, data, config, base_offset, ids) {
            Decision::Built(outline) => {
                kept.push(o);
                outlines.push(outline);
            }
            Decision::NoOutline => kept.push(o),
            Decision::Fold(reason) => {
                debug!("object {} folded to other: {}", o.id(), reason.as_str());
                records.push(RejectionRecord {
                    object_id: o.id(),
                    classification: o.object.classification,
                    reason,
                    longitudinal: o.longitudinal,
                    lateral: o.lateral,
                });
                o.reason = Some(reason);
                o.is_avoidable = false;
                data.other_objects.push(o);
            }
        }
    }
    data.target_objects = kept;

    merge_adjacent_outlines(outlines, data, ids)
}

fn build_outline(
    object: &ObjectData,
    data: &AvoidancePlanningData,
    config: &Config,
    base_offset: f64,
    ids: &mut IdGenerator,
) -> Decision {
    // Unavoidable objects stay targets (they gate the ego state) but get
    // no maneuver.
    let margin = match object.avoid_margin {
        Some(margin) => margin,
        None => return Decision::NoOutline,
    };

    let required_shift = filter::shift_length(object.is_on_right(), object.overhang_dist, margin);
    let relative_shift = required_shift - base_offset;
    if required_shift == 0.0 || relative_shift.abs() < config.avoidance.quantize_step {
        return Decision::Fold(RejectReason::BelowExecutionThreshold);
    }

    let avoidance = &config.avoidance;
    let speed = data.ego_speed.max(avoidance.nominal_avoidance_speed);
    let nominal_span =
        longitudinal_dist_from_jerk(relative_shift, avoidance.lateral_jerk_limit, speed);

    let avoid_end = object.longitudinal - avoidance.longitudinal_margin_front;
    if avoid_end <= 0.0 {
        // The transition would have to finish behind the ego.
        return Decision::Fold(RejectReason::BelowExecutionThreshold);
    }

    let span = nominal_span.min(avoid_end);
    if span < nominal_span {
        let required_jerk = jerk_from_lat_lon_distance(relative_shift, span, speed);
        if required_jerk > avoidance.max_lateral_jerk {
            return Decision::Fold(RejectReason::BelowExecutionThreshold);
        }
    }

    let path_end = data.path_length();

    let mut avoid_line = AvoidLine {
        id: ids.next(),
        start_longitudinal: avoid_end - span,
        end_longitudinal: avoid_end,
        start_shift_length: base_offset,
        end_shift_length: required_shift,
        ..AvoidLine::default()
    };
    avoid_line.object_ids.insert(object.id());
    fill_line_geometry(&mut avoid_line, data);

    let return_start =
        (object.longitudinal + object.length + avoidance.longitudinal_margin_rear).min(path_end);
    let return_span = longitudinal_dist_from_jerk(
        required_shift,
        avoidance.lateral_jerk_limit,
        speed,
    );
    let mut return_line = AvoidLine {
        id: ids.next(),
        start_longitudinal: return_start,
        end_longitudinal: (return_start + return_span).min(path_end),
        start_shift_length: required_shift,
        end_shift_length: 0.0,
        ..AvoidLine::default()
    };
    return_line.object_ids.insert(object.id());
    fill_line_geometry(&mut return_line, data);

    Decision::Built(AvoidOutline::new(avoid_line, return_line))
}

/// Chain outlines whose intervals touch: drop the earlier return and the
/// gap to the later avoid line, holding the shift with a middle line
/// instead. Only same-side maneuvers chain; opposing shifts must return to
/// center in between.
fn merge_adjacent_outlines(
    outlines: Vec<AvoidOutline>,
    data: &AvoidancePlanningData,
    ids: &mut IdGenerator,
) -> Vec<AvoidOutline> {
    let mut merged: Vec<AvoidOutline> = Vec::new();

    for mut outline in outlines {
        let Some(prev) = merged.last_mut() else {
            merged.push(outline);
            continue;
        };

        let same_side = prev.avoid_line.end_shift_length.signum()
            == outline.avoid_line.end_shift_length.signum();
        let overlapping =
            outline.avoid_line.start_longitudinal <= prev.return_line.end_longitudinal;

        if !(same_side && overlapping) {
            merged.push(outline);
            continue;
        }

        let hold_from = prev
            .middle_lines
            .last()
            .unwrap_or(&prev.avoid_line)
            .clone();

        let mut middle = AvoidLine {
            id: ids.next(),
            start_longitudinal: hold_from.end_longitudinal,
            end_longitudinal: outline
                .avoid_line
                .start_longitudinal
                .max(hold_from.end_longitudinal),
            start_shift_length: hold_from.end_shift_length,
            end_shift_length: hold_from.end_shift_length,
            ..AvoidLine::default()
        };
        middle.object_ids.extend(hold_from.object_ids.iter().copied());
        middle
            .object_ids
            .extend(outline.avoid_line.object_ids.iter().copied());
        fill_line_geometry(&mut middle, data);

        // The later avoid line now starts from the held shift.
        outline.avoid_line.start_shift_length = hold_from.end_shift_length;
        outline.avoid_line.start_longitudinal = middle.end_longitudinal;
        fill_line_geometry(&mut outline.avoid_line, data);

        prev.middle_lines.push(middle);
        prev.middle_lines.push(outline.avoid_line);
        prev.middle_lines.extend(outline.middle_lines);
        prev.return_line = outline.return_line;
    }

    merged
}
