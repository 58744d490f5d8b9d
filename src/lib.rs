pub mod adaptive_params;
pub mod bounding_box;
pub mod buffer;
pub mod config;
pub mod error;
pub mod gicp;
pub mod ground;
pub mod hull;
pub mod imu;
pub mod io;
pub mod keyframe;
pub mod lie_group;
pub mod odom_pipeline;
pub mod point3d;
pub mod preprocess;
pub mod registrar;
pub mod runtime;
pub mod viz;
pub mod voxel_util;
