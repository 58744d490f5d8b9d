use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    ground::MIN_GROUND_POINTS,
};

/// Parameter bundle of one registration stage.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct GicpParams {
    pub k_correspondences: usize,
    pub max_correspondence_distance: f64,
    pub max_iterations: u16,
    pub transformation_epsilon: f64,
    pub euclidean_fitness_epsilon: f64,
    pub ransac_iterations: u16,
    pub ransac_inlier_threshold: f64,
}

impl GicpParams {
    pub fn s2s_default_values() -> GicpParams {
        GicpParams {
            k_correspondences: 10,
            max_correspondence_distance: 1.0,
            max_iterations: 32,
            transformation_epsilon: 0.01,
            euclidean_fitness_epsilon: 0.01,
            ransac_iterations: 5,
            ransac_inlier_threshold: 1.0,
        }
    }

    pub fn s2m_default_values() -> GicpParams {
        GicpParams {
            k_correspondences: 20,
            max_correspondence_distance: 0.5,
            max_iterations: 32,
            transformation_epsilon: 0.01,
            euclidean_fitness_epsilon: 0.01,
            ransac_iterations: 5,
            ransac_inlier_threshold: 1.0,
        }
    }
}

impl Default for GicpParams {
    fn default() -> Self {
        GicpParams::s2s_default_values()
    }
}

/// Bounds for environment-driven parameter rescaling.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Spaciousness at which the base parameters are used unscaled.
    pub reference_spaciousness: f64,
    pub window_size: usize,
    pub min_scale: f64,
    pub max_scale: f64,
    pub min_correspondence_distance: f64,
    pub max_correspondence_distance: f64,
    pub min_voxel_res: f32,
    pub max_voxel_res: f32,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        AdaptiveConfig {
            reference_spaciousness: 10.0,
            window_size: 10,
            min_scale: 0.5,
            max_scale: 2.0,
            min_correspondence_distance: 0.25,
            max_correspondence_distance: 3.0,
            min_voxel_res: 0.05,
            max_voxel_res: 1.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GroundConfig {
    /// Plane normal in the world frame.
    pub normal: [f64; 3],
    /// Max distance of a ground candidate from the reference plane.
    pub threshold: f64,
    pub min_points: usize,
    /// Height of the sensor above ground. Detected on the first frame when unset.
    pub sensor_height: Option<f64>,
    pub max_iterations: u16,
    /// Pull of the previous correction on the current fit.
    pub smoothing_weight: f64,
}

impl Default for GroundConfig {
    fn default() -> Self {
        GroundConfig {
            normal: [0.0, 0.0, 1.0],
            threshold: 0.2,
            min_points: 50,
            sensor_height: None,
            max_iterations: 5,
            smoothing_weight: 0.3,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    // preprocessing
    pub min_range: f32,
    pub max_range: f32,
    pub crop_use: bool,
    pub crop_size: f32,
    pub vf_scan_use: bool,
    pub vf_scan_res: f32,
    pub vf_submap_use: bool,
    pub vf_submap_res: f32,

    // keyframes, rotation threshold in degrees
    pub keyframe_thresh_dist: f64,
    pub keyframe_thresh_rot: f64,

    // submap
    pub submap_knn: usize,
    pub submap_kcv: usize,
    pub submap_kcc: usize,
    pub submap_concave_alpha: f64,

    // initial pose, orientation as [w, x, y, z]
    pub initial_pose_use: bool,
    pub initial_position: [f64; 3],
    pub initial_orientation: [f64; 4],

    pub gravity_align: bool,

    pub adaptive_params_use: bool,
    pub adaptive: AdaptiveConfig,

    // imu, calibration time in seconds
    pub imu_use: bool,
    pub imu_calib_time: f64,
    pub imu_buffer_size: usize,

    // dynamic object boxes
    pub box_buffer_size: usize,
    pub box_sync_tolerance: f64,

    // registration params
    pub gicp_min_num_points: usize,
    pub max_fitness_score: f64,
    pub s2s: GicpParams,
    pub s2m: GicpParams,
    pub max_num_threads: u8,

    pub ground_use: bool,
    pub ground: GroundConfig,

    // runtime
    pub scan_queue_size: usize,
    pub report_interval_ms: u64,
    pub trajectory_path: Option<String>,
}

impl Config {
    pub fn default_values() -> Config {
        Config {
            min_range: 1.0,
            max_range: 100.0,
            crop_use: false,
            crop_size: 50.0,
            vf_scan_use: true,
            vf_scan_res: 0.25,
            vf_submap_use: true,
            vf_submap_res: 0.5,

            keyframe_thresh_dist: 1.0,
            keyframe_thresh_rot: 45.0,

            submap_knn: 10,
            submap_kcv: 10,
            submap_kcc: 10,
            submap_concave_alpha: 0.5,

            initial_pose_use: false,
            initial_position: [0.0, 0.0, 0.0],
            initial_orientation: [1.0, 0.0, 0.0, 0.0],

            gravity_align: false,

            adaptive_params_use: true,
            adaptive: AdaptiveConfig::default(),

            imu_use: false,
            imu_calib_time: 3.0,
            imu_buffer_size: 2000,

            box_buffer_size: 10,
            box_sync_tolerance: 0.1,

            gicp_min_num_points: 100,
            max_fitness_score: 1.0,
            s2s: GicpParams::s2s_default_values(),
            s2m: GicpParams::s2m_default_values(),
            max_num_threads: 0,

            ground_use: false,
            ground: GroundConfig::default(),

            scan_queue_size: 4,
            report_interval_ms: 1000,
            trajectory_path: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(msg.to_owned()));
        if !(self.min_range >= 0.0 && self.min_range <= self.max_range) {
            return invalid("min_range must be in [0, max_range]");
        }
        if self.crop_use && self.crop_size <= 0.0 {
            return invalid("crop_size must be positive");
        }
        if (self.vf_scan_use && self.vf_scan_res <= 0.0)
            || (self.vf_submap_use && self.vf_submap_res <= 0.0)
        {
            return invalid("voxel resolutions must be positive");
        }
        if self.keyframe_thresh_dist <= 0.0 || self.keyframe_thresh_rot <= 0.0 {
            return invalid("keyframe thresholds must be positive");
        }
        if self.submap_concave_alpha <= 0.0 {
            return invalid("submap_concave_alpha must be positive");
        }
        let q = self.initial_orientation;
        if self.initial_pose_use && (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]) < 1e-12 {
            return invalid("initial_orientation must be a non-zero quaternion");
        }
        if self.imu_use && (self.imu_buffer_size == 0 || self.imu_calib_time < 0.0) {
            return invalid("imu buffer size must be non-zero and calibration time non-negative");
        }
        if self.box_buffer_size == 0 {
            return invalid("box_buffer_size must be non-zero");
        }
        for params in [&self.s2s, &self.s2m] {
            if params.k_correspondences < 3 {
                return invalid("k_correspondences must be at least 3");
            }
            if params.max_correspondence_distance <= 0.0 || params.max_iterations == 0 {
                return invalid("registration needs a positive distance and iteration count");
            }
        }
        let a = &self.adaptive;
        if a.window_size == 0
            || a.min_scale > a.max_scale
            || a.min_correspondence_distance > a.max_correspondence_distance
            || a.min_voxel_res > a.max_voxel_res
            || a.reference_spaciousness <= 0.0
        {
            return invalid("adaptive bounds are inconsistent");
        }
        let g = &self.ground;
        let n = g.normal;
        if self.ground_use {
            if (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]) < 1e-12 {
                return invalid("ground normal must be non-zero");
            }
            if g.min_points < MIN_GROUND_POINTS {
                return invalid("ground.min_points must be at least 3");
            }
            if g.threshold <= 0.0 || g.smoothing_weight < 0.0 {
                return invalid("ground threshold must be positive and smoothing non-negative");
            }
        }
        if self.scan_queue_size == 0 {
            return invalid("scan_queue_size must be non-zero");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::default_values()
    }
}
