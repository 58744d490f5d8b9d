use crate::point3d::{self, Point3d};
use nalgebra as na;
use std::collections::HashSet;

pub type Voxel = na::Vector3<i32>;

/// One representative per occupied cell: the first point of the input that lands in it.
/// Output keeps the order of first occurrence, so the result only depends on the input.
pub fn voxel_downsample(point_cloud: &[point3d::Point3d], voxel_size: f32) -> Vec<Point3d> {
    let mut occupied: HashSet<Voxel> = HashSet::with_capacity(point_cloud.len());
    point_cloud
        .iter()
        .filter(|pt| occupied.insert(point_to_voxel(pt, voxel_size)))
        .copied()
        .collect()
}

pub fn point_to_voxel(point: &point3d::Point3d, voxel_size: f32) -> Voxel {
    Voxel::new(
        (point.x / voxel_size).floor() as i32,
        (point.y / voxel_size).floor() as i32,
        (point.z / voxel_size).floor() as i32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_first_point_per_cell() {
        let cloud = vec![
            Point3d::new(0.1, 0.1, 0.1, 1.0),
            Point3d::new(0.2, 0.2, 0.2, 2.0),
            Point3d::new(1.1, 0.1, 0.1, 3.0),
            Point3d::new(-0.1, 0.1, 0.1, 4.0),
            Point3d::new(1.4, 0.4, 0.4, 5.0),
        ];
        let down = voxel_downsample(&cloud, 1.0);
        let intensities: Vec<f32> = down.iter().map(|p| p.intensity).collect();
        assert_eq!(intensities, vec![1.0, 3.0, 4.0]);
    }

    #[test]
    fn repeated_runs_match() {
        let cloud: Vec<Point3d> = (0..500)
            .map(|i| {
                let f = i as f32 * 0.037;
                Point3d::new(f.sin() * 5.0, f.cos() * 5.0, f * 0.1, i as f32)
            })
            .collect();
        assert_eq!(voxel_downsample(&cloud, 0.3), voxel_downsample(&cloud, 0.3));
    }
}
