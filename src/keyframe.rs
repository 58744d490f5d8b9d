//! Keyframe retention and submap composition.
//!
//! Keyframes are stored once, in creation order, each owning its world-frame
//! cloud and covariances. A submap is the concatenation of a member set of
//! keyframes and is only rebuilt when that set changes, so consecutive
//! frames with the same neighbourhood share one `Arc<Submap>`.

use log::{debug, info};
use nalgebra as na;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::{
    config,
    gicp::{self, CovarianceCloud, Covariance},
    hull,
    lie_group,
    point3d::{self, Point3d},
    voxel_util,
};

const MIN_KEYFRAMES_CONVEX: usize = 4;
const MIN_KEYFRAMES_CONCAVE: usize = 5;

#[derive(Debug, Clone)]
pub struct Keyframe {
    pub index: usize,
    pub timestamp: f64,
    pub pose: na::Isometry3<f64>,
    /// Downsampled cloud in the world frame.
    pub points: Arc<Vec<Point3d>>,
    /// Surface covariances in the world frame, one per point.
    pub normals: Arc<Vec<Covariance>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Submap {
    pub points: Arc<Vec<Point3d>>,
    pub normals: Arc<Vec<Covariance>>,
    pub members: BTreeSet<usize>,
}

#[derive(Debug, Clone)]
pub struct SubmapUpdate {
    pub submap: Arc<Submap>,
    pub rebuilt: bool,
}

struct HullCache {
    convex: Vec<usize>,
    concave: Vec<usize>,
}

pub struct KeyframeSubmapManager {
    thresh_dist: f64,
    thresh_rot_deg: f64,
    knn: usize,
    kcv: usize,
    kcc: usize,
    concave_alpha: f64,
    voxel_res: Option<f32>,
    covariance_k: usize,

    keyframes: Vec<Arc<Keyframe>>,
    hulls: Option<HullCache>,
    submap: Option<Arc<Submap>>,
    stale: bool,
}

/// Picks the `k` smallest distances, ties going to the lower position, and
/// returns the matching entries of `frames` in that order.
///
/// `distances[i]` belongs to `frames[i]`. Exactly `min(k, n)` entries come back.
pub fn push_submap_indices(distances: &[f64], k: usize, frames: &[usize]) -> Vec<usize> {
    let n = distances.len().min(frames.len());
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| distances[a].total_cmp(&distances[b]).then(a.cmp(&b)));
    order.into_iter().take(k).map(|i| frames[i]).collect()
}

impl KeyframeSubmapManager {
    pub fn new(config: &config::Config) -> KeyframeSubmapManager {
        KeyframeSubmapManager {
            thresh_dist: config.keyframe_thresh_dist,
            thresh_rot_deg: config.keyframe_thresh_rot,
            knn: config.submap_knn,
            kcv: config.submap_kcv,
            kcc: config.submap_kcc,
            concave_alpha: config.submap_concave_alpha,
            voxel_res: config.vf_submap_use.then_some(config.vf_submap_res),
            covariance_k: config.s2m.k_correspondences,
            keyframes: Vec::new(),
            hulls: None,
            submap: None,
            stale: true,
        }
    }

    pub fn keyframes(&self) -> &[Arc<Keyframe>] {
        &self.keyframes
    }

    pub fn len(&self) -> usize {
        self.keyframes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    pub fn submap(&self) -> Option<Arc<Submap>> {
        self.submap.clone()
    }

    pub fn thresh_dist(&self) -> f64 {
        self.thresh_dist
    }

    pub fn set_thresh_dist(&mut self, thresh_dist: f64) {
        self.thresh_dist = thresh_dist;
    }

    pub fn set_concave_alpha(&mut self, alpha: f64) {
        if alpha != self.concave_alpha {
            self.concave_alpha = alpha;
            self.hulls = None;
        }
    }

    /// No-op when the submap voxel filter is disabled.
    pub fn set_voxel_res(&mut self, res: f32) {
        if self.voxel_res.is_some() {
            self.voxel_res = Some(res);
        }
    }

    /// Index and distance of the keyframe closest to `position`.
    pub fn nearest_keyframe(&self, position: &na::Vector3<f64>) -> Option<(usize, f64)> {
        self.keyframes
            .iter()
            .map(|k| (k.index, (k.pose.translation.vector - position).norm()))
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
    }

    /// A pose far enough, in translation or rotation, from its nearest keyframe.
    pub fn is_new_keyframe(&self, pose: &na::Isometry3<f64>) -> bool {
        let Some((closest, dd)) = self.nearest_keyframe(&pose.translation.vector) else {
            return true;
        };
        let theta_deg = lie_group::rotation_angle_deg(&pose.rotation, &self.keyframes[closest].pose.rotation);
        dd >= self.thresh_dist || theta_deg >= self.thresh_rot_deg
    }

    /// Commits a keyframe for `pose` when it passes the thresholds.
    ///
    /// `scan` is the registration source in the sensor frame.
    pub fn update_keyframes(
        &mut self,
        timestamp: f64,
        pose: &na::Isometry3<f64>,
        scan: &CovarianceCloud,
    ) -> Option<Arc<Keyframe>> {
        if !self.is_new_keyframe(pose) {
            return None;
        }
        Some(self.insert_keyframe(timestamp, pose, scan))
    }

    /// Unconditionally appends a keyframe, used for the very first scan.
    pub fn insert_keyframe(
        &mut self,
        timestamp: f64,
        pose: &na::Isometry3<f64>,
        scan: &CovarianceCloud,
    ) -> Arc<Keyframe> {
        let (points, normals) = match self.voxel_res {
            Some(res) => {
                let down = Arc::new(voxel_util::voxel_downsample(&scan.points, res));
                let covs = CovarianceCloud::new(down.clone(), self.covariance_k).covariances;
                (down, covs)
            }
            None => (scan.points.clone(), scan.covariances.clone()),
        };
        let world_points = point3d::transform_point_cloud(pose, &points);
        let world_normals = gicp::rotate_covariances(&pose.rotation.to_rotation_matrix(), &normals);

        let keyframe = Arc::new(Keyframe {
            index: self.keyframes.len(),
            timestamp,
            pose: *pose,
            points: Arc::new(world_points),
            normals: Arc::new(world_normals),
        });
        info!(
            "keyframe {} at [{:.2}, {:.2}, {:.2}] with {} points",
            keyframe.index,
            pose.translation.x,
            pose.translation.y,
            pose.translation.z,
            keyframe.points.len()
        );
        self.keyframes.push(keyframe.clone());
        self.stale = true;
        keyframe
    }

    fn refresh_hulls(&mut self) {
        if !self.stale && self.hulls.is_some() {
            return;
        }
        let positions: Vec<na::Vector2<f64>> = self
            .keyframes
            .iter()
            .map(|k| k.pose.translation.vector.xy())
            .collect();
        let convex = if positions.len() >= MIN_KEYFRAMES_CONVEX {
            hull::convex_hull(&positions)
        } else {
            Vec::new()
        };
        let concave = if positions.len() >= MIN_KEYFRAMES_CONCAVE {
            hull::concave_hull(&positions, self.concave_alpha)
        } else {
            Vec::new()
        };
        self.hulls = Some(HullCache { convex, concave });
        self.stale = false;
    }

    /// Member keyframes of the submap around `pose`: nearest neighbours plus
    /// the nearest convex and concave hull vertices.
    pub fn select_submap_indices(&mut self, pose: &na::Isometry3<f64>) -> BTreeSet<usize> {
        let position = pose.translation.vector;
        let distances: Vec<f64> = self
            .keyframes
            .iter()
            .map(|k| (k.pose.translation.vector - position).norm())
            .collect();
        let all: Vec<usize> = (0..self.keyframes.len()).collect();

        let mut members: BTreeSet<usize> =
            push_submap_indices(&distances, self.knn, &all).into_iter().collect();

        self.refresh_hulls();
        if let Some(hulls) = &self.hulls {
            for (vertices, k) in [(&hulls.convex, self.kcv), (&hulls.concave, self.kcc)] {
                let dists: Vec<f64> = vertices.iter().map(|&i| distances[i]).collect();
                members.extend(push_submap_indices(&dists, k, vertices));
            }
        }
        members
    }

    /// Selects the submap for `pose` and rebuilds it only if its members changed.
    pub fn get_submap_keyframes(&mut self, pose: &na::Isometry3<f64>) -> Option<SubmapUpdate> {
        if self.keyframes.is_empty() {
            return None;
        }
        let members = self.select_submap_indices(pose);
        if let Some(current) = &self.submap {
            if current.members.symmetric_difference(&members).next().is_none() {
                return Some(SubmapUpdate {
                    submap: current.clone(),
                    rebuilt: false,
                });
            }
        }
        let submap = Arc::new(self.build_submap(members));
        debug!(
            "submap rebuilt from {} keyframes, {} points",
            submap.members.len(),
            submap.points.len()
        );
        self.submap = Some(submap.clone());
        Some(SubmapUpdate {
            submap,
            rebuilt: true,
        })
    }

    fn build_submap(&self, members: BTreeSet<usize>) -> Submap {
        let total: usize = members.iter().map(|&i| self.keyframes[i].points.len()).sum();
        let mut points = Vec::with_capacity(total);
        let mut normals = Vec::with_capacity(total);
        for &i in members.iter() {
            points.extend_from_slice(&self.keyframes[i].points);
            normals.extend_from_slice(&self.keyframes[i].normals);
        }
        Submap {
            points: Arc::new(points),
            normals: Arc::new(normals),
            members,
        }
    }
}
