// src/config.rs
//
// Configuration tree loaded from config.yaml. Every section has a Default
// used by tests and by the demo binary when no file is present.
//
// Unknown object-class keys are not fatal: they are dropped with an error
// log, which makes the affected class non-avoidable (the conservative
// fallback for misconfiguration).

use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::types::ObjectClass;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub vehicle: VehicleConfig,
    #[serde(default)]
    pub target_filter: TargetFilterConfig,
    #[serde(default)]
    pub avoidance: AvoidanceConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleConfig {
    /// Ego vehicle width [m].
    pub width: f64,
    /// Ego vehicle length [m].
    pub length: f64,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            width: 1.83,
            length: 4.77,
        }
    }
}

/// Per-class parameters of the target filter. Keyed by class name in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectClassParams {
    /// Whether this class is ever an avoidance target.
    pub is_target: bool,
    /// Speed above which the object counts as moving [m/s].
    pub moving_speed_threshold: f64,
    /// Seconds of continuous motion before a moving object is ignored.
    pub moving_time_threshold: f64,
    /// Hard lateral clearance kept from the object [m].
    pub safety_buffer_lateral: f64,
    /// Additional desired lateral clearance [m].
    pub avoid_margin_lateral: f64,
    /// Envelope polygon inflation [m].
    pub envelope_buffer_margin: f64,
}

impl Default for ObjectClassParams {
    fn default() -> Self {
        Self {
            is_target: false,
            moving_speed_threshold: 1.0,
            moving_time_threshold: 1.0,
            safety_buffer_lateral: 0.3,
            avoid_margin_lateral: 1.0,
            envelope_buffer_margin: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetFilterConfig {
    /// Objects behind this arc-length window are ignored [m].
    pub object_check_backward_distance: f64,
    /// Objects beyond this arc-length window are ignored [m].
    pub object_check_forward_distance: f64,
    /// Required clearance between the object's far end and the route goal [m].
    pub object_check_goal_distance: f64,
    /// Objects laterally closer to the centerline than this are not
    /// considered parked-at-the-edge candidates [m].
    pub threshold_distance_object_is_on_center: f64,
    /// Normalized centerline offset above which an in-lane vehicle counts
    /// as parked.
    pub object_check_shiftable_ratio: f64,
    /// Assumed shoulder width when no shoulder lane exists next to the
    /// outermost road lane [m].
    pub object_check_min_road_shoulder_width: f64,
    /// Seconds an unmatched registered object survives before eviction.
    pub object_last_seen_threshold: f64,
    /// Fallback match radius when the perception id changes [m].
    pub position_match_radius: f64,
    /// Enable avoiding vehicles stopped for a long time in the ego lane.
    pub force_avoidance_for_stopped_vehicle: bool,
    /// Stop duration that triggers forced avoidance [s].
    pub threshold_time_force_avoidance: f64,
    /// A stopped vehicle this close to a traffic light is waiting, not
    /// parked [m].
    pub object_ignore_section_traffic_light_distance: f64,
    /// Same, for crosswalks: in-front window [m].
    pub object_ignore_section_crosswalk_in_front_distance: f64,
    /// Same, behind window [m].
    pub object_ignore_section_crosswalk_behind_distance: f64,
    /// Pedestrians/cyclists within this distance of a crosswalk are left to
    /// the crosswalk module [m].
    pub crosswalk_proximity_threshold: f64,
    /// Expansion applied to the necessity margin once avoid-required is
    /// latched (chatter suppression).
    pub hysteresis_factor_expand_rate: f64,
    /// Deceleration policy: "best_effort" or "reliable".
    pub policy_deceleration: String,
    /// Maximum comfortable deceleration for the stoppable judgement [m/s²].
    pub max_deceleration: f64,
    /// Per-class parameter table, keyed by class name.
    pub object_classes: BTreeMap<String, ObjectClassParams>,
}

impl Default for TargetFilterConfig {
    fn default() -> Self {
        let mut object_classes = BTreeMap::new();
        for name in ["car", "truck", "bus", "trailer"] {
            object_classes.insert(
                name.to_string(),
                ObjectClassParams {
                    is_target: true,
                    ..ObjectClassParams::default()
                },
            );
        }
        for name in ["pedestrian", "bicycle", "motorcycle"] {
            object_classes.insert(
                name.to_string(),
                ObjectClassParams {
                    is_target: true,
                    avoid_margin_lateral: 0.8,
                    ..ObjectClassParams::default()
                },
            );
        }

        Self {
            object_check_backward_distance: 2.0,
            object_check_forward_distance: 150.0,
            object_check_goal_distance: 20.0,
            threshold_distance_object_is_on_center: 1.0,
            object_check_shiftable_ratio: 0.6,
            object_check_min_road_shoulder_width: 0.5,
            object_last_seen_threshold: 2.0,
            position_match_radius: 1.5,
            force_avoidance_for_stopped_vehicle: true,
            threshold_time_force_avoidance: 10.0,
            object_ignore_section_traffic_light_distance: 30.0,
            object_ignore_section_crosswalk_in_front_distance: 30.0,
            object_ignore_section_crosswalk_behind_distance: 30.0,
            crosswalk_proximity_threshold: 2.0,
            hysteresis_factor_expand_rate: 2.0,
            policy_deceleration: "best_effort".to_string(),
            max_deceleration: 1.0,
            object_classes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvoidanceConfig {
    /// Nominal lateral jerk used to size shift spans [m/s³].
    pub lateral_jerk_limit: f64,
    /// Hard lateral jerk limit; a maneuver needing more is infeasible [m/s³].
    pub max_lateral_jerk: f64,
    /// Shift magnitudes below this are not worth executing [m].
    pub lateral_execution_threshold: f64,
    /// Shift lengths are rounded to multiples of this step [m].
    pub quantize_step: f64,
    /// Lines shorter than this along the path are dropped in the trim
    /// stage [m].
    pub min_longitudinal_span: f64,
    /// Two consecutive lines merge when their gradients differ less than
    /// this [m/m].
    pub similar_gradient_threshold: f64,
    /// Longitudinal clearance kept in front of the object [m].
    pub longitudinal_margin_front: f64,
    /// Longitudinal clearance kept behind the object [m].
    pub longitudinal_margin_rear: f64,
    /// Floor applied to ego speed when sizing jerk-limited spans [m/s].
    pub nominal_avoidance_speed: f64,
    /// Preferred clearance kept from the road shoulder [m].
    pub soft_road_shoulder_margin: f64,
    /// Minimum clearance kept from the road shoulder [m].
    pub hard_road_shoulder_margin: f64,
    /// Maximum lateral deviation between ego and a candidate path before
    /// the whole batch is rejected [m].
    pub lateral_deviation_tolerance: f64,
    /// Candidate/registered lines closer than this in start/end pose count
    /// as duplicates [m].
    pub duplicate_pose_threshold: f64,
    /// ... and in shift length [m].
    pub duplicate_shift_threshold: f64,
    /// Residual base offset below which the registered set may be reset [m].
    pub base_offset_reset_threshold: f64,
    /// Emit drivable-area cut-out polygons for unavoidable objects.
    pub enable_bound_clipping: bool,
}

impl Default for AvoidanceConfig {
    fn default() -> Self {
        Self {
            lateral_jerk_limit: 1.0,
            max_lateral_jerk: 2.0,
            lateral_execution_threshold: 0.09,
            quantize_step: 0.3,
            min_longitudinal_span: 0.5,
            similar_gradient_threshold: 0.02,
            longitudinal_margin_front: 3.0,
            longitudinal_margin_rear: 3.0,
            nominal_avoidance_speed: 2.78,
            soft_road_shoulder_margin: 0.8,
            hard_road_shoulder_margin: 0.3,
            lateral_deviation_tolerance: 1.0,
            duplicate_pose_threshold: 1.0,
            duplicate_shift_threshold: 0.5,
            base_offset_reset_threshold: 0.1,
            enable_bound_clipping: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Prediction horizon handed to the safety checker [s].
    pub time_horizon: f64,
    /// Check objects in the lane the ego shifts into.
    pub check_shift_side_lane: bool,
    /// Check objects on the other side.
    pub check_other_side_lane: bool,
    /// Check objects in the current lane sequence.
    pub check_current_lane: bool,
    /// An unavoidable target closer than this forces a yield [m].
    pub unavoidable_close_distance: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            time_horizon: 5.0,
            check_shift_side_lane: true,
            check_other_side_lane: false,
            check_current_lane: false,
            unavoidable_close_distance: 50.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        let mut config: Config =
            serde_yaml::from_str(&contents).context("failed to parse config")?;
        config.validate();
        Ok(config)
    }

    /// Drop object-class entries whose key is not a known class name. The
    /// class then has no parameters, which the filter treats as
    /// non-avoidable.
    fn validate(&mut self) {
        let unknown: Vec<String> = self
            .target_filter
            .object_classes
            .keys()
            .filter(|k| ObjectClass::from_name(k).is_none())
            .cloned()
            .collect();
        for key in unknown {
            error!(
                "unknown object class '{}' in config; the class will not be avoided",
                key
            );
            self.target_filter.object_classes.remove(&key);
        }

        if !matches!(
            self.target_filter.policy_deceleration.as_str(),
            "best_effort" | "reliable"
        ) {
            error!(
                "unknown deceleration policy '{}'; falling back to best_effort",
                self.target_filter.policy_deceleration
            );
            self.target_filter.policy_deceleration = "best_effort".to_string();
        }
    }
}

impl TargetFilterConfig {
    pub fn class_params(&self, class: ObjectClass) -> Option<&ObjectClassParams> {
        self.object_classes.get(class.as_str())
    }
}
