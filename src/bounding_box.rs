use nalgebra as na;

use crate::buffer::Stamped;
use crate::point3d::Point3d;

/// Oriented box reported by an external detector around a dynamic object.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub timestamp: f64,
    /// Box center and orientation in the sensor frame.
    pub pose: na::Isometry3<f64>,
    /// Full edge lengths along the box axes.
    pub extent: na::Vector3<f64>,
}

impl BoundingBox {
    pub fn contains(&self, point: &Point3d) -> bool {
        let local = self.pose.inverse_transform_point(&point.to_na_point3_f64());
        local.x.abs() <= self.extent.x * 0.5
            && local.y.abs() <= self.extent.y * 0.5
            && local.z.abs() <= self.extent.z * 0.5
    }
}

/// All boxes of one detector output.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxSet {
    pub timestamp: f64,
    pub boxes: Vec<BoundingBox>,
}

impl Stamped for BoxSet {
    fn stamp(&self) -> f64 {
        self.timestamp
    }
}

/// The set closest in time to `stamp`, if any lies within `tolerance`.
pub fn nearest_box_set(sets: &[BoxSet], stamp: f64, tolerance: f64) -> Option<&BoxSet> {
    sets.iter()
        .filter(|s| (s.timestamp - stamp).abs() <= tolerance)
        .min_by(|a, b| {
            (a.timestamp - stamp)
                .abs()
                .total_cmp(&(b.timestamp - stamp).abs())
        })
}

pub fn remove_points_in_boxes(point_cloud: &[Point3d], boxes: &[BoundingBox]) -> Vec<Point3d> {
    if boxes.is_empty() {
        return point_cloud.to_vec();
    }
    point_cloud
        .iter()
        .filter(|pt| !boxes.iter().any(|b| b.contains(pt)))
        .copied()
        .collect()
}
