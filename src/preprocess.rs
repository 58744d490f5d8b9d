use crate::{
    bounding_box::{self, BoxSet},
    config,
    point3d::{self, Point3d, Scan},
    voxel_util,
};

/// Output of one preprocessing pass.
#[derive(Debug, Clone)]
pub struct PreprocessedScan {
    pub timestamp: f64,
    /// Range-filtered, cropped cloud with dynamic objects removed.
    pub filtered: Vec<Point3d>,
    /// `filtered` after the optional voxel filter, used for registration.
    pub points: Vec<Point3d>,
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    min_range: f32,
    max_range: f32,
    crop_size: Option<f32>,
    voxel_res: Option<f32>,
}

impl Preprocessor {
    pub fn new(config: &config::Config) -> Preprocessor {
        Preprocessor {
            min_range: config.min_range,
            max_range: config.max_range,
            crop_size: config.crop_use.then_some(config.crop_size),
            voxel_res: config.vf_scan_use.then_some(config.vf_scan_res),
        }
    }

    pub fn voxel_res(&self) -> Option<f32> {
        self.voxel_res
    }

    /// No-op when the scan voxel filter is disabled.
    pub fn set_voxel_res(&mut self, res: f32) {
        if self.voxel_res.is_some() {
            self.voxel_res = Some(res);
        }
    }

    pub fn process(&self, scan: &Scan, boxes: Option<&BoxSet>) -> PreprocessedScan {
        // self returns and max range noise
        let mut filtered =
            point3d::clip_point_cloud_by_distance(&scan.points, self.min_range, self.max_range);

        if let Some(size) = self.crop_size {
            filtered = crop_box(&filtered, size);
        }

        if let Some(set) = boxes {
            filtered = bounding_box::remove_points_in_boxes(&filtered, &set.boxes);
        }

        let points = match self.voxel_res {
            Some(res) => voxel_util::voxel_downsample(&filtered, res),
            None => filtered.clone(),
        };

        PreprocessedScan {
            timestamp: scan.timestamp,
            filtered,
            points,
        }
    }
}

/// Keeps points inside the cube `[-size, size]^3` around the sensor.
pub fn crop_box(point_cloud: &[Point3d], size: f32) -> Vec<Point3d> {
    point_cloud
        .iter()
        .filter(|pt| pt.x.abs() <= size && pt.y.abs() <= size && pt.z.abs() <= size)
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounding_box::BoundingBox;
    use nalgebra as na;

    fn line_scan() -> Scan {
        let points = (0..100)
            .map(|i| Point3d::new(i as f32 * 0.5, 0.0, 0.0, i as f32))
            .collect();
        Scan::new(3.0, points)
    }

    #[test]
    fn range_crop_and_voxel_in_order() {
        let mut config = config::Config::default_values();
        config.min_range = 1.0;
        config.max_range = 40.0;
        config.crop_use = true;
        config.crop_size = 20.0;
        config.vf_scan_use = true;
        config.vf_scan_res = 2.0;
        let out = Preprocessor::new(&config).process(&line_scan(), None);
        assert_eq!(out.timestamp, 3.0);
        // ranges 1.0 ..= 20.0
        assert_eq!(out.filtered.len(), 39);
        assert_eq!(out.filtered[0].x, 1.0);
        // one point per 2 m cell: [1,2) [2,4) .. [20,22)
        assert_eq!(out.points.len(), 11);
        assert_eq!(out.points[1].x, 2.0);
    }

    #[test]
    fn empty_result_is_valid() {
        let mut config = config::Config::default_values();
        config.min_range = 1000.0;
        config.max_range = 2000.0;
        let out = Preprocessor::new(&config).process(&line_scan(), None);
        assert!(out.filtered.is_empty());
        assert!(out.points.is_empty());
    }

    #[test]
    fn dynamic_boxes_are_excluded() {
        let mut config = config::Config::default_values();
        config.vf_scan_use = false;
        let boxes = BoxSet {
            timestamp: 3.0,
            boxes: vec![BoundingBox {
                timestamp: 3.0,
                pose: na::Isometry3::translation(10.0, 0.0, 0.0),
                extent: na::Vector3::new(2.0, 2.0, 2.0),
            }],
        };
        let plain = Preprocessor::new(&config).process(&line_scan(), None);
        let out = Preprocessor::new(&config).process(&line_scan(), Some(&boxes));
        // x in [9, 11] removed
        assert_eq!(plain.points.len() - out.points.len(), 5);
    }

    #[test]
    fn resolution_update_ignored_when_filter_off() {
        let mut config = config::Config::default_values();
        config.vf_scan_use = false;
        let mut pre = Preprocessor::new(&config);
        pre.set_voxel_res(0.7);
        assert_eq!(pre.voxel_res(), None);
    }
}
