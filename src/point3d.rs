use nalgebra as na;
use pcd_rs::PcdDeserialize;
use rayon::prelude::*;
use std::sync::Arc;

use crate::error::{Error, Result};

#[derive(PcdDeserialize, Debug, Clone, Copy, PartialEq)]
pub struct Point3d {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub intensity: f32,
}

impl Point3d {
    pub fn new(x: f32, y: f32, z: f32, intensity: f32) -> Point3d {
        Point3d { x, y, z, intensity }
    }
    pub fn square(&self) -> f32 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }
    pub fn to_na_vec_f64(&self) -> na::Vector3<f64> {
        na::Vector3::<f64>::new(self.x as f64, self.y as f64, self.z as f64)
    }
    pub fn to_na_point3_f64(&self) -> na::Point3<f64> {
        na::Point3::<f64>::new(self.x as f64, self.y as f64, self.z as f64)
    }
    pub fn to_array_f64(&self) -> [f64; 3] {
        [self.x as f64, self.y as f64, self.z as f64]
    }
    pub fn transformed(&self, transform: &na::Isometry3<f64>) -> Point3d {
        let p = transform * self.to_na_point3_f64();
        Point3d {
            x: p.x as f32,
            y: p.y as f32,
            z: p.z as f32,
            intensity: self.intensity,
        }
    }
}

/// A timestamped lidar sweep. Shared immutably once ingested.
#[derive(Debug, Clone)]
pub struct Scan {
    pub timestamp: f64,
    pub points: Arc<Vec<Point3d>>,
}

impl Scan {
    pub fn new(timestamp: f64, points: Vec<Point3d>) -> Scan {
        Scan {
            timestamp,
            points: Arc::new(points),
        }
    }
    pub fn len(&self) -> usize {
        self.points.len()
    }
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

pub fn read_pcd_to_points(pcd_path: &str) -> Result<Vec<Point3d>> {
    let reader = pcd_rs::Reader::open(pcd_path).map_err(|e| Error::Pcd(e.to_string()))?;
    reader
        .collect::<std::result::Result<Vec<Point3d>, _>>()
        .map_err(|e| Error::Pcd(e.to_string()))
}

/// Keeps points whose range lies in the inclusive band `[min_distance, max_distance]`.
pub fn clip_point_cloud_by_distance(
    point_cloud: &[Point3d],
    min_distance: f32,
    max_distance: f32,
) -> Vec<Point3d> {
    let min2 = min_distance * min_distance;
    let max2 = max_distance * max_distance;
    point_cloud
        .par_iter()
        .filter_map(|pt| {
            let s = pt.square();
            if s < min2 || s > max2 || !s.is_finite() {
                None
            } else {
                Some(*pt)
            }
        })
        .collect()
}

pub fn transform_point_cloud(transform: &na::Isometry3<f64>, point_cloud: &[Point3d]) -> Vec<Point3d> {
    point_cloud
        .par_iter()
        .map(|pt| pt.transformed(transform))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_keeps_inclusive_band_in_order() {
        let cloud = vec![
            Point3d::new(0.5, 0.0, 0.0, 1.0),
            Point3d::new(1.0, 0.0, 0.0, 2.0),
            Point3d::new(0.0, 3.0, 4.0, 3.0),
            Point3d::new(10.0, 0.0, 0.0, 4.0),
            Point3d::new(f32::NAN, 0.0, 0.0, 5.0),
            Point3d::new(20.0, 0.0, 0.0, 6.0),
        ];
        let clipped = clip_point_cloud_by_distance(&cloud, 1.0, 10.0);
        let intensities: Vec<f32> = clipped.iter().map(|p| p.intensity).collect();
        assert_eq!(intensities, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn transform_keeps_intensity() {
        let t = na::Isometry3::translation(1.0, 2.0, 3.0);
        let moved = transform_point_cloud(&t, &[Point3d::new(1.0, 1.0, 1.0, 7.0)]);
        assert_eq!(moved[0], Point3d::new(2.0, 3.0, 4.0, 7.0));
    }
}
