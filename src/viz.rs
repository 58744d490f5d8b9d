//! Rerun logging helpers shared by the replay binaries.

use nalgebra as na;
use rerun::RecordingStream;

use crate::{
    keyframe::Keyframe,
    odom_pipeline::{FrameResult, StampedPose},
    point3d,
};

pub type VizResult = Result<(), rerun::RecordingStreamError>;

pub fn get_colors_for_points(
    points: &[point3d::Point3d],
    min_val: f32,
    max_val: f32,
    alpha: u8,
) -> Vec<(u8, u8, u8, u8)> {
    let g = colorous::TURBO;
    points
        .iter()
        .map(|p| {
            let t = ((p.intensity - min_val) / (max_val - min_val)).clamp(0.0, 1.0);
            let c = g.eval_continuous(t.into());
            (c.r, c.g, c.b, alpha)
        })
        .collect()
}

pub fn na_to_rerun(transform: &na::Isometry3<f64>) -> rerun::Transform3D {
    rerun::Transform3D::from_translation_rotation(
        [
            transform.translation.x as f32,
            transform.translation.y as f32,
            transform.translation.z as f32,
        ],
        rerun::Quaternion::from_wxyz([
            transform.rotation.w as f32,
            transform.rotation.i as f32,
            transform.rotation.j as f32,
            transform.rotation.k as f32,
        ]),
    )
}

/// Logs the pose, the scan in the sensor frame, and the trajectory so far.
pub fn log_frame(
    recording: &RecordingStream,
    result: &FrameResult,
    scan: &[point3d::Point3d],
    trajectory: &[StampedPose],
    intensity_range: (f32, f32),
) -> VizResult {
    recording.set_time_seconds("stable_time", result.timestamp);
    recording.log(
        "world/lidar",
        &na_to_rerun(&result.pose).with_axis_length(1.0),
    )?;
    let colors = get_colors_for_points(scan, intensity_range.0, intensity_range.1, 255);
    recording.log(
        "world/lidar/scan",
        &rerun::Points3D::new(scan.iter().map(|p| (p.x, p.y, p.z)))
            .with_radii([0.05])
            .with_colors(colors),
    )?;
    let strip: Vec<[f32; 3]> = trajectory
        .iter()
        .map(|sp| {
            let t = sp.pose.translation.vector;
            [t.x as f32, t.y as f32, t.z as f32]
        })
        .collect();
    recording.log("world/trajectory", &rerun::LineStrips3D::new([strip]))?;
    if let Some(keyframe) = &result.keyframe {
        log_keyframe(recording, keyframe)?;
    }
    Ok(())
}

pub fn log_keyframe(recording: &RecordingStream, keyframe: &Keyframe) -> VizResult {
    recording.log(
        format!("world/keyframes/{}", keyframe.index),
        &rerun::Points3D::new(keyframe.points.iter().map(|p| (p.x, p.y, p.z)))
            .with_radii([0.03])
            .with_colors([(160, 160, 160, 128)]),
    )
}
