// src/geometry.rs
//
// Geometry utilities shared by the filter, the outline generator and the
// shift line pipeline: path projection, arc-length tables, envelope polygon
// construction and overhang measurement.
//
// Polygons are geo::Polygon<f64>; everything path-related works on plain
// pose slices so the callers decide what a "path" is.

use geo::{Area, BooleanOps, BoundingRect, Contains, Polygon};

use crate::types::{AvoidLine, Point2, Pose, PredictedObject};

// ============================================================================
// PATH PROJECTION
// ============================================================================

/// Index of the path point nearest to `p`.
pub fn nearest_index(points: &[Pose], p: Point2) -> usize {
    let mut min_dist = f64::MAX;
    let mut min_idx = 0;
    for (i, pose) in points.iter().enumerate() {
        let d = (pose.position.x - p.x).powi(2) + (pose.position.y - p.y).powi(2);
        if d < min_dist {
            min_dist = d;
            min_idx = i;
        }
    }
    min_idx
}

/// Signed lateral deviation of `target` from `base`, left positive.
pub fn lateral_deviation(base: &Pose, target: Point2) -> f64 {
    let dx = target.x - base.position.x;
    let dy = target.y - base.position.y;
    -dx * base.yaw.sin() + dy * base.yaw.cos()
}

/// Signed longitudinal offset of `target` along `base`'s heading.
pub fn longitudinal_offset(base: &Pose, target: Point2) -> f64 {
    let dx = target.x - base.position.x;
    let dy = target.y - base.position.y;
    dx * base.yaw.cos() + dy * base.yaw.sin()
}

/// Cumulative arc length from the first point.
pub fn cumulative_arclength(points: &[Pose]) -> Vec<f64> {
    let mut arc = Vec::with_capacity(points.len());
    let mut acc = 0.0;
    for (i, pose) in points.iter().enumerate() {
        if i > 0 {
            acc += pose.position.distance_to(points[i - 1].position);
        }
        arc.push(acc);
    }
    arc
}

/// Arc length of every point measured from `origin_idx` (negative behind).
pub fn arclength_from_index(points: &[Pose], origin_idx: usize) -> Vec<f64> {
    let arc = cumulative_arclength(points);
    let origin = arc.get(origin_idx).copied().unwrap_or(0.0);
    arc.into_iter().map(|a| a - origin).collect()
}

/// Signed arc length between the projections of two free points onto the
/// path, corrected by their longitudinal offsets from the matched poses.
pub fn signed_arc_length(points: &[Pose], src: Point2, dst: Point2) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let arc = cumulative_arclength(points);
    let src_idx = nearest_index(points, src);
    let dst_idx = nearest_index(points, dst);
    (arc[dst_idx] - arc[src_idx]) - longitudinal_offset(&points[src_idx], src)
        + longitudinal_offset(&points[dst_idx], dst)
}

/// First path index whose arc length exceeds `target_arc`; the last index
/// if no point does.
pub fn index_from_arclength(arclength: &[f64], target_arc: f64) -> usize {
    if arclength.is_empty() {
        return 0;
    }
    for (i, arc) in arclength.iter().enumerate() {
        if *arc > target_arc {
            return i;
        }
    }
    arclength.len() - 1
}

/// Shift length of `line` sampled at arc position `arc`; 0.0 outside the
/// line's interval.
pub fn lerp_shift_on_arc(arc: f64, line: &AvoidLine) -> f64 {
    if line.start_longitudinal <= arc && arc < line.end_longitudinal {
        if line.relative_longitudinal().abs() < 1.0e-5 {
            return line.end_shift_length;
        }
        let start_weight = (line.end_longitudinal - arc) / line.relative_longitudinal();
        start_weight * line.start_shift_length + (1.0 - start_weight) * line.end_shift_length
    } else {
        0.0
    }
}

// ============================================================================
// POLYGONS
// ============================================================================

pub fn polygon_from_points(points: &[Point2]) -> Polygon<f64> {
    let ring: Vec<geo::Coord<f64>> = points
        .iter()
        .map(|p| geo::coord! { x: p.x, y: p.y })
        .collect();
    Polygon::new(geo::LineString::new(ring), vec![])
}

/// Rectangular footprint of an object from its pose and bounding box.
pub fn object_footprint(object: &PredictedObject) -> Polygon<f64> {
    let half_l = object.shape.length / 2.0;
    let half_w = object.shape.width / 2.0;
    let (sin, cos) = object.pose.yaw.sin_cos();
    let center = object.pose.position;

    let corner = |lx: f64, ly: f64| Point2 {
        x: center.x + cos * lx - sin * ly,
        y: center.y + sin * lx + cos * ly,
    };

    polygon_from_points(&[
        corner(half_l, half_w),
        corner(half_l, -half_w),
        corner(-half_l, -half_w),
        corner(-half_l, half_w),
    ])
}

/// Path-aligned envelope of `source`: the bounding box of the polygon in
/// the frame of `closest_pose`, inflated by `buffer` on every side, mapped
/// back to world coordinates.
pub fn envelope_polygon(source: &Polygon<f64>, closest_pose: &Pose, buffer: f64) -> Polygon<f64> {
    let (sin, cos) = closest_pose.yaw.sin_cos();
    let origin = closest_pose.position;

    let local: Vec<geo::Coord<f64>> = source
        .exterior()
        .coords()
        .map(|c| {
            let dx = c.x - origin.x;
            let dy = c.y - origin.y;
            geo::coord! { x: cos * dx + sin * dy, y: -sin * dx + cos * dy }
        })
        .collect();

    let local_poly = Polygon::new(geo::LineString::new(local), vec![]);
    let rect = match local_poly.bounding_rect() {
        Some(rect) => rect,
        None => return source.clone(),
    };

    let min = rect.min();
    let max = rect.max();
    let corners = [
        (min.x - buffer, min.y - buffer),
        (max.x + buffer, min.y - buffer),
        (max.x + buffer, max.y + buffer),
        (min.x - buffer, max.y + buffer),
    ];

    let world: Vec<Point2> = corners
        .iter()
        .map(|(lx, ly)| Point2 {
            x: origin.x + cos * lx - sin * ly,
            y: origin.y + sin * lx + cos * ly,
        })
        .collect();

    polygon_from_points(&world)
}

/// Envelope smoothing across cycles: reuse the registered polygon when the
/// fresh envelope is fully inside it, otherwise union the two and
/// re-envelope the result. Falls back to the fresh envelope when the union
/// degenerates.
pub fn smoothed_envelope(
    fresh: &Polygon<f64>,
    registered: &Polygon<f64>,
    closest_pose: &Pose,
) -> Polygon<f64> {
    if registered.contains(fresh) {
        return registered.clone();
    }

    let unions = fresh.union(registered);
    let merged = unions
        .0
        .iter()
        .max_by(|a, b| a.unsigned_area().total_cmp(&b.unsigned_area()));

    match merged {
        Some(poly) => envelope_polygon(poly, closest_pose, 0.0),
        None => fresh.clone(),
    }
}

/// Offset every vertex away from the polygon centroid by `margin`.
/// Negative margins shrink the polygon toward its centroid.
pub fn expand_polygon(polygon: &Polygon<f64>, margin: f64) -> Polygon<f64> {
    use geo::Centroid;

    let Some(centroid) = polygon.centroid() else {
        return polygon.clone();
    };
    let moved: Vec<Point2> = polygon
        .exterior()
        .coords()
        .map(|c| {
            let dx = c.x - centroid.x();
            let dy = c.y - centroid.y();
            let norm = dx.hypot(dy);
            if norm < 1.0e-9 {
                Point2::new(c.x, c.y)
            } else {
                let scale = ((norm + margin) / norm).max(0.0);
                Point2::new(centroid.x() + dx * scale, centroid.y() + dy * scale)
            }
        })
        .collect();
    polygon_from_points(&moved)
}

/// Largest protrusion of the envelope toward the path. For an object on the
/// right this is the maximum lateral deviation over the envelope vertices,
/// for an object on the left the minimum. Returns the deviation and the
/// vertex it occurs at.
pub fn envelope_overhang(
    envelope: &Polygon<f64>,
    path: &[Pose],
    on_right: bool,
) -> (f64, Point2) {
    let mut largest = if on_right { f64::MIN } else { f64::MAX };
    let mut at = Point2::default();

    for c in envelope.exterior().coords() {
        let p = Point2::new(c.x, c.y);
        let idx = nearest_index(path, p);
        let lateral = lateral_deviation(&path[idx], p);
        let further = if on_right {
            lateral > largest
        } else {
            lateral < largest
        };
        if further {
            largest = lateral;
            at = p;
        }
    }
    (largest, at)
}

/// Arc-length position and extent of the envelope along the path, measured
/// from the ego position.
pub fn envelope_longitudinal_span(
    envelope: &Polygon<f64>,
    path: &[Pose],
    ego_pos: Point2,
) -> (f64, f64) {
    let mut min_arc = f64::MAX;
    let mut max_arc = f64::MIN;
    for c in envelope.exterior().coords() {
        let arc = signed_arc_length(path, ego_pos, Point2::new(c.x, c.y));
        min_arc = min_arc.min(arc);
        max_arc = max_arc.max(arc);
    }
    if min_arc > max_arc {
        (0.0, 0.0)
    } else {
        (min_arc, max_arc - min_arc)
    }
}

// ============================================================================
// DISTANCES
// ============================================================================

fn point_segment_distance(p: Point2, a: Point2, b: Point2) -> f64 {
    let abx = b.x - a.x;
    let aby = b.y - a.y;
    let len2 = abx * abx + aby * aby;
    if len2 < 1.0e-12 {
        return p.distance_to(a);
    }
    let t = (((p.x - a.x) * abx + (p.y - a.y) * aby) / len2).clamp(0.0, 1.0);
    p.distance_to(Point2::new(a.x + t * abx, a.y + t * aby))
}

fn segment_segment_distance(a1: Point2, a2: Point2, b1: Point2, b2: Point2) -> f64 {
    if segments_intersect(a1, a2, b1, b2).is_some() {
        return 0.0;
    }
    point_segment_distance(a1, b1, b2)
        .min(point_segment_distance(a2, b1, b2))
        .min(point_segment_distance(b1, a1, a2))
        .min(point_segment_distance(b2, a1, a2))
}

/// Minimum distance between a point and a polyline.
pub fn point_polyline_distance(p: Point2, line: &[Point2]) -> f64 {
    if line.len() < 2 {
        return line.first().map_or(f64::MAX, |a| p.distance_to(*a));
    }
    let mut min_dist = f64::MAX;
    for i in 0..line.len() - 1 {
        min_dist = min_dist.min(point_segment_distance(p, line[i], line[i + 1]));
    }
    min_dist
}

/// Minimum distance between a polygon boundary and a polyline.
pub fn polygon_polyline_distance(polygon: &Polygon<f64>, line: &[Point2]) -> f64 {
    let ring: Vec<Point2> = polygon
        .exterior()
        .coords()
        .map(|c| Point2::new(c.x, c.y))
        .collect();
    if ring.len() < 2 || line.len() < 2 {
        return f64::MAX;
    }

    let mut min_dist = f64::MAX;
    for i in 0..ring.len() - 1 {
        for j in 0..line.len() - 1 {
            let d = segment_segment_distance(ring[i], ring[i + 1], line[j], line[j + 1]);
            min_dist = min_dist.min(d);
        }
    }
    min_dist
}

/// Intersection point of two segments, if any.
pub fn segments_intersect(a1: Point2, a2: Point2, b1: Point2, b2: Point2) -> Option<Point2> {
    let d1x = a2.x - a1.x;
    let d1y = a2.y - a1.y;
    let d2x = b2.x - b1.x;
    let d2y = b2.y - b1.y;

    let denom = d1x * d2y - d1y * d2x;
    if denom.abs() < 1.0e-12 {
        return None;
    }

    let t = ((b1.x - a1.x) * d2y - (b1.y - a1.y) * d2x) / denom;
    let u = ((b1.x - a1.x) * d1y - (b1.y - a1.y) * d1x) / denom;
    if (0.0..=1.0).contains(&t) && (0.0..=1.0).contains(&u) {
        Some(Point2::new(a1.x + t * d1x, a1.y + t * d1y))
    } else {
        None
    }
}

/// Extend a road-shoulder distance with expandable boundary polygons
/// (hatched markings, intersection areas): cast a ray from `origin` through
/// `toward` and keep the farthest polygon-edge intersection.
pub fn extend_distance_with_polygons(
    base_distance: f64,
    origin: Point2,
    toward: Point2,
    polygons: &[Polygon<f64>],
) -> f64 {
    if polygons.is_empty() {
        return base_distance;
    }

    // A point far beyond the boundary along the origin->toward direction.
    let dx = toward.x - origin.x;
    let dy = toward.y - origin.y;
    let norm = dx.hypot(dy);
    if norm < 1.0e-6 {
        return base_distance;
    }
    let far = Point2::new(origin.x + dx / norm * 200.0, origin.y + dy / norm * 200.0);

    let mut updated = base_distance;
    for polygon in polygons {
        let ring: Vec<Point2> = polygon
            .exterior()
            .coords()
            .map(|c| Point2::new(c.x, c.y))
            .collect();
        let mut farthest: Option<f64> = None;
        for i in 0..ring.len().saturating_sub(1) {
            if let Some(hit) = segments_intersect(origin, far, ring[i], ring[i + 1]) {
                let d = origin.distance_to(hit);
                farthest = Some(farthest.map_or(d, |f: f64| f.max(d)));
            }
        }
        if let Some(d) = farthest {
            updated = updated.max(d);
        }
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn straight_path(n: usize, step: f64) -> Vec<Pose> {
        (0..n).map(|i| Pose::new(i as f64 * step, 0.0, 0.0)).collect()
    }

    #[test]
    fn lateral_deviation_is_left_positive() {
        let base = Pose::new(0.0, 0.0, 0.0);
        assert_relative_eq!(lateral_deviation(&base, Point2::new(5.0, 2.0)), 2.0);
        assert_relative_eq!(lateral_deviation(&base, Point2::new(5.0, -3.0)), -3.0);
    }

    #[test]
    fn arclength_from_index_is_signed() {
        let path = straight_path(11, 1.0);
        let arc = arclength_from_index(&path, 5);
        assert_relative_eq!(arc[5], 0.0);
        assert_relative_eq!(arc[0], -5.0);
        assert_relative_eq!(arc[10], 5.0);
    }

    #[test]
    fn signed_arc_length_corrects_for_offsets() {
        let path = straight_path(21, 1.0);
        let d = signed_arc_length(&path, Point2::new(2.3, 0.5), Point2::new(7.8, -0.5));
        assert_relative_eq!(d, 5.5, epsilon = 1.0e-9);
    }

    #[test]
    fn envelope_aligns_with_pose_frame() {
        let source = polygon_from_points(&[
            Point2::new(9.0, 1.0),
            Point2::new(11.0, 1.0),
            Point2::new(11.0, 2.0),
            Point2::new(9.0, 2.0),
        ]);
        let env = envelope_polygon(&source, &Pose::new(10.0, 0.0, 0.0), 0.5);
        let (min_x, max_x) = env
            .exterior()
            .coords()
            .fold((f64::MAX, f64::MIN), |(lo, hi), c| {
                (lo.min(c.x), hi.max(c.x))
            });
        assert_relative_eq!(min_x, 8.5, epsilon = 1.0e-9);
        assert_relative_eq!(max_x, 11.5, epsilon = 1.0e-9);
    }

    #[test]
    fn overhang_picks_the_protruding_vertex() {
        let path = straight_path(21, 1.0);
        // Object on the right: lateral < 0, nearest edge at y = -1.2.
        let env = polygon_from_points(&[
            Point2::new(9.0, -3.0),
            Point2::new(11.0, -3.0),
            Point2::new(11.0, -1.2),
            Point2::new(9.0, -1.2),
        ]);
        let (overhang, at) = envelope_overhang(&env, &path, true);
        assert_relative_eq!(overhang, -1.2, epsilon = 1.0e-9);
        assert_relative_eq!(at.y, -1.2, epsilon = 1.0e-9);
    }

    #[test]
    fn lerp_shift_interpolates_inside_interval() {
        let line = AvoidLine {
            start_longitudinal: 10.0,
            end_longitudinal: 20.0,
            start_shift_length: 0.0,
            end_shift_length: 2.0,
            ..AvoidLine::default()
        };
        assert_relative_eq!(lerp_shift_on_arc(15.0, &line), 1.0);
        assert_relative_eq!(lerp_shift_on_arc(5.0, &line), 0.0);
        assert_relative_eq!(lerp_shift_on_arc(25.0, &line), 0.0);
    }

    #[test]
    fn polyline_distance_hits_the_near_edge() {
        let poly = polygon_from_points(&[
            Point2::new(0.0, 0.0),
            Point2::new(2.0, 0.0),
            Point2::new(2.0, 1.0),
            Point2::new(0.0, 1.0),
        ]);
        let line = vec![Point2::new(-5.0, 3.0), Point2::new(5.0, 3.0)];
        assert_relative_eq!(polygon_polyline_distance(&poly, &line), 2.0, epsilon = 1.0e-9);
    }

    #[test]
    fn expand_polygon_grows_every_side() {
        let square = polygon_from_points(&[
            Point2::new(-1.0, -1.0),
            Point2::new(1.0, -1.0),
            Point2::new(1.0, 1.0),
            Point2::new(-1.0, 1.0),
        ]);
        let grown = expand_polygon(&square, 0.5);
        let max_x = grown
            .exterior()
            .coords()
            .fold(f64::MIN, |acc, c| acc.max(c.x));
        // Corner vertices move out along the diagonal.
        assert_relative_eq!(
            max_x,
            1.0 + 0.5 / 2.0_f64.sqrt(),
            epsilon = 1.0e-9
        );
    }

    #[test]
    fn polygon_extension_takes_farthest_intersection() {
        let hatched = polygon_from_points(&[
            Point2::new(-1.0, 2.0),
            Point2::new(1.0, 2.0),
            Point2::new(1.0, 4.0),
            Point2::new(-1.0, 4.0),
        ]);
        let d = extend_distance_with_polygons(
            2.0,
            Point2::new(0.0, 0.0),
            Point2::new(0.0, 1.0),
            &[hatched],
        );
        assert_relative_eq!(d, 4.0, epsilon = 1.0e-9);
    }
}
