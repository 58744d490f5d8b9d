//! Generalized ICP between two point clouds with per-point surface covariances.
//!
//! Residuals are weighted by `(C_target + R C_source R^T)^-1`, the
//! linearization is the same left-perturbed [trans, rot] system the
//! point-to-point solver used, and the per-point work runs on rayon.

use kiddo::immutable::float::kdtree::ImmutableKdTree;
use kiddo::SquaredEuclidean;
use log::debug;
use nalgebra as na;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    config::GicpParams,
    lie_group::{Exp, Hat},
    point3d::Point3d,
};

pub type Covariance = na::Matrix3<f64>;

/// Nearest-neighbour index over the distinct positions of a cloud.
///
/// Exact duplicates are indexed once and resolve to their first occurrence.
/// Positions are stored in a fixed skewed frame so that axis-aligned planes
/// and quantized returns do not pile up on one split value; distances are
/// unchanged by the rotation.
pub struct PointTree {
    tree: Option<ImmutableKdTree<f64, u64, 3, 32>>,
    // tree item -> index into the cloud
    ids: Vec<usize>,
    frame: na::Rotation3<f64>,
}

impl PointTree {
    pub fn new(points: &[Point3d]) -> PointTree {
        let frame = na::Rotation3::new(na::Vector3::new(0.3137, 0.4721, 0.2293));
        let mut seen: HashMap<[u64; 3], usize> = HashMap::with_capacity(points.len());
        let mut positions = Vec::with_capacity(points.len());
        let mut ids = Vec::with_capacity(points.len());
        for (i, pt) in points.iter().enumerate() {
            let p = pt.to_array_f64();
            // +0.0 folds -0.0 into the same key
            let key = p.map(|v| (v + 0.0).to_bits());
            if seen.insert(key, i).is_none() {
                positions.push(to_index_frame(&frame, &p));
                ids.push(i);
            }
        }
        let tree = (!positions.is_empty()).then(|| ImmutableKdTree::new_from_slice(&positions));
        PointTree { tree, ids, frame }
    }

    /// Number of distinct positions.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Index and squared distance of the closest point.
    pub fn nearest_one(&self, query: &[f64; 3]) -> Option<(usize, f64)> {
        let query = to_index_frame(&self.frame, query);
        let nearest = self.tree.as_ref()?.nearest_one::<SquaredEuclidean>(&query);
        Some((self.ids[nearest.item as usize], nearest.distance))
    }

    /// Indices of the `k` closest points, closest first.
    pub fn nearest_n(&self, query: &[f64; 3], k: usize) -> Vec<usize> {
        let query = to_index_frame(&self.frame, query);
        match &self.tree {
            Some(tree) => tree
                .nearest_n::<SquaredEuclidean>(&query, k)
                .iter()
                .map(|nb| self.ids[nb.item as usize])
                .collect(),
            None => Vec::new(),
        }
    }
}

fn to_index_frame(frame: &na::Rotation3<f64>, p: &[f64; 3]) -> [f64; 3] {
    let q = frame * na::Vector3::new(p[0], p[1], p[2]);
    [q.x, q.y, q.z]
}

const RANSAC_SEED: u64 = 0x5eed;
const MIN_CORRESPONDENCES: usize = 6;

/// A cloud together with the search tree and covariances registration needs.
pub struct CovarianceCloud {
    pub points: Arc<Vec<Point3d>>,
    pub covariances: Arc<Vec<Covariance>>,
    pub tree: PointTree,
}

impl CovarianceCloud {
    /// Estimates covariances from the `k` nearest neighbours of every point.
    pub fn new(points: Arc<Vec<Point3d>>, k: usize) -> CovarianceCloud {
        let tree = PointTree::new(&points);
        let covariances = Arc::new(estimate_covariances(&points, &tree, k));
        CovarianceCloud {
            points,
            covariances,
            tree,
        }
    }

    /// Uses precomputed covariances, one per point.
    pub fn with_covariances(
        points: Arc<Vec<Point3d>>,
        covariances: Arc<Vec<Covariance>>,
    ) -> CovarianceCloud {
        debug_assert_eq!(points.len(), covariances.len());
        let tree = PointTree::new(&points);
        CovarianceCloud {
            points,
            covariances,
            tree,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Plane-regularized covariance of each point's neighbourhood: the two
/// dominant directions get unit variance, the normal direction gets 1e-3.
pub fn estimate_covariances(points: &[Point3d], tree: &PointTree, k: usize) -> Vec<Covariance> {
    points
        .par_iter()
        .map(|pt| {
            let neighbors = tree.nearest_n(&pt.to_array_f64(), k);
            if neighbors.len() < 3 {
                return Covariance::identity();
            }
            let n = neighbors.len() as f64;
            let vs: Vec<na::Vector3<f64>> = neighbors
                .iter()
                .map(|&i| points[i].to_na_vec_f64())
                .collect();
            let mean = vs.iter().sum::<na::Vector3<f64>>() / n;
            let cov = vs.iter().fold(Covariance::zeros(), |acc, v| {
                let d = v - mean;
                acc + d * d.transpose()
            }) / n;
            regularize_plane(&cov)
        })
        .collect()
}

fn regularize_plane(cov: &Covariance) -> Covariance {
    let svd = cov.svd(true, false);
    match svd.u {
        Some(u) => {
            let values = na::Matrix3::from_diagonal(&na::Vector3::new(1.0, 1.0, 1e-3));
            u * values * u.transpose()
        }
        None => Covariance::identity(),
    }
}

/// Rotates covariances into another frame.
pub fn rotate_covariances(rotation: &na::Rotation3<f64>, covariances: &[Covariance]) -> Vec<Covariance> {
    let r = rotation.matrix();
    covariances
        .par_iter()
        .map(|c| r * c * r.transpose())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignOutcome {
    pub transform: na::Isometry3<f64>,
    /// Mean squared distance of the final correspondences.
    pub fitness: f64,
    pub iterations: u16,
    pub converged: bool,
}

struct Correspondence {
    source: usize,
    target: usize,
    distance2: f64,
}

fn find_correspondences(
    source: &[na::Vector3<f64>],
    target: &CovarianceCloud,
    max_correspondence_distance: f64,
) -> Vec<Correspondence> {
    let max2 = max_correspondence_distance * max_correspondence_distance;
    source
        .par_iter()
        .enumerate()
        .filter_map(|(i, p)| {
            let (target, distance2) = target.tree.nearest_one(&[p.x, p.y, p.z])?;
            (distance2 <= max2).then_some(Correspondence {
                source: i,
                target,
                distance2,
            })
        })
        .collect()
}

/// Rigid transform between paired point sets (Kabsch).
fn kabsch(pairs: &[(na::Vector3<f64>, na::Vector3<f64>)]) -> Option<na::Isometry3<f64>> {
    let n = pairs.len() as f64;
    let (cs, ct) = pairs.iter().fold(
        (na::Vector3::zeros(), na::Vector3::zeros()),
        |(a, b), (s, t)| (a + s, b + t),
    );
    let (cs, ct) = (cs / n, ct / n);
    let h = pairs.iter().fold(na::Matrix3::zeros(), |acc, (s, t)| {
        acc + (s - cs) * (t - ct).transpose()
    });
    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut r = v_t.transpose() * u.transpose();
    if r.determinant() < 0.0 {
        let mut v = v_t.transpose();
        v.column_mut(2).neg_mut();
        r = v * u.transpose();
    }
    let rotation = na::UnitQuaternion::from_matrix(&r);
    let translation = ct - rotation * cs;
    Some(na::Isometry3::from_parts(translation.into(), rotation))
}

/// Sample-consensus rejection: keeps the correspondences that agree with the
/// best rigid transform found from random triplets.
fn ransac_reject(
    source: &[na::Vector3<f64>],
    target: &[Point3d],
    correspondences: Vec<Correspondence>,
    iterations: u16,
    inlier_threshold: f64,
    rng: &mut StdRng,
) -> Vec<Correspondence> {
    if iterations == 0 || correspondences.len() < MIN_CORRESPONDENCES {
        return correspondences;
    }
    let pair = |c: &Correspondence| (source[c.source], target[c.target].to_na_vec_f64());
    let threshold2 = inlier_threshold * inlier_threshold;
    let mut best: Option<(usize, na::Isometry3<f64>)> = None;
    for _ in 0..iterations {
        let picks: Vec<_> = (0..3)
            .map(|_| pair(&correspondences[rng.random_range(0..correspondences.len())]))
            .collect();
        let Some(model) = kabsch(&picks) else {
            continue;
        };
        let inliers = correspondences
            .iter()
            .filter(|c| {
                let (s, t) = pair(c);
                (model * na::Point3::from(s) - na::Point3::from(t)).norm_squared() <= threshold2
            })
            .count();
        if best.map_or(true, |(n, _)| inliers > n) {
            best = Some((inliers, model));
        }
    }
    match best {
        Some((n, model)) if n >= MIN_CORRESPONDENCES => correspondences
            .into_iter()
            .filter(|c| {
                let (s, t) = pair(c);
                (model * na::Point3::from(s) - na::Point3::from(t)).norm_squared() <= threshold2
            })
            .collect(),
        _ => correspondences,
    }
}

fn build_linear_system(
    source: &[na::Vector3<f64>],
    source_covs: &[Covariance],
    target: &CovarianceCloud,
    correspondences: &[Correspondence],
    rotation: &na::Matrix3<f64>,
) -> (na::Matrix6<f64>, na::Vector6<f64>) {
    correspondences
        .par_iter()
        .filter_map(|c| {
            let p = source[c.source];
            let q = target.points[c.target].to_na_vec_f64();
            let residual = p - q;
            let combined = target.covariances[c.target]
                + rotation * source_covs[c.source] * rotation.transpose();
            let mahalanobis = (combined + na::Matrix3::identity() * 1e-6).try_inverse()?;

            // [trans 3, rotation 3]
            let mut j_r = na::Matrix3x6::identity();
            j_r.fixed_columns_mut::<3>(3).copy_from(&(-1.0 * p.hat()));

            let j_tw = j_r.transpose() * mahalanobis;
            Some((j_tw * j_r, j_tw * residual))
        })
        .reduce(Default::default, |(j_tj_a, j_tr_a), (j_tj_b, j_tr_b)| {
            (j_tj_a + j_tj_b, j_tr_a + j_tr_b)
        })
}

fn mean_distance2(correspondences: &[Correspondence]) -> f64 {
    if correspondences.is_empty() {
        return f64::INFINITY;
    }
    correspondences.iter().map(|c| c.distance2).sum::<f64>() / correspondences.len() as f64
}

/// Aligns `source` onto `target` starting at `initial_guess`.
///
/// Returns the transform with the lowest fitness seen when the solve does
/// not converge within `params.max_iterations`.
pub fn align(
    source: &CovarianceCloud,
    target: &CovarianceCloud,
    initial_guess: &na::Isometry3<f64>,
    params: &GicpParams,
) -> AlignOutcome {
    let mut rng = StdRng::seed_from_u64(RANSAC_SEED);
    let source_points: Vec<na::Vector3<f64>> =
        source.points.iter().map(|p| p.to_na_vec_f64()).collect();

    let mut estimate = *initial_guess;
    let mut best = AlignOutcome {
        transform: estimate,
        fitness: f64::INFINITY,
        iterations: 0,
        converged: false,
    };
    let mut prev_fitness = f64::INFINITY;

    for i in 0..params.max_iterations {
        let transformed: Vec<na::Vector3<f64>> = source_points
            .par_iter()
            .map(|p| estimate * na::Point3::from(*p))
            .map(|p| p.coords)
            .collect();

        let correspondences =
            find_correspondences(&transformed, target, params.max_correspondence_distance);
        let correspondences = ransac_reject(
            &transformed,
            &target.points,
            correspondences,
            params.ransac_iterations,
            params.ransac_inlier_threshold,
            &mut rng,
        );
        let fitness = mean_distance2(&correspondences);
        if fitness < best.fitness {
            best.transform = estimate;
            best.fitness = fitness;
        }
        best.iterations = i + 1;

        if correspondences.len() < MIN_CORRESPONDENCES {
            debug!("gicp: {} correspondences at iteration {}", correspondences.len(), i);
            break;
        }
        if i > 0 && (prev_fitness - fitness).abs() < params.euclidean_fitness_epsilon {
            best.converged = true;
            break;
        }
        prev_fitness = fitness;

        let rotation = estimate.rotation.to_rotation_matrix().into_inner();
        let (jtj, jtr) = build_linear_system(
            &transformed,
            &source.covariances,
            target,
            &correspondences,
            &rotation,
        );
        let Some(dx) = jtj.qr().solve(&(-jtr)) else {
            debug!("gicp: singular system with {} correspondences", correspondences.len());
            break;
        };
        estimate = dx.exp() * estimate;
        if dx.norm() < params.transformation_epsilon {
            // the step is tiny, score the final estimate once more
            let transformed: Vec<na::Vector3<f64>> = source_points
                .par_iter()
                .map(|p| (estimate * na::Point3::from(*p)).coords)
                .collect();
            let fitness = mean_distance2(&find_correspondences(
                &transformed,
                target,
                params.max_correspondence_distance,
            ));
            if fitness <= best.fitness {
                best.transform = estimate;
                best.fitness = fitness;
            }
            best.converged = true;
            break;
        }
    }
    best
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// A closed room with a few pillars, sampled on a slightly jittered grid.
    pub(crate) fn room_cloud(spacing: f32) -> Vec<Point3d> {
        let mut points = Vec::new();
        let mut jitter_state = 17u32;
        let mut jitter = || {
            jitter_state = jitter_state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            ((jitter_state >> 16) % 1000) as f32 * 1e-5
        };
        let steps = |len: f32| (len / spacing) as i32;
        let (hx, hy, hz) = (8.0f32, 6.0f32, 3.0f32);
        for i in 0..=steps(2.0 * hx) {
            for j in 0..=steps(2.0 * hy) {
                let x = -hx + i as f32 * spacing;
                let y = -hy + j as f32 * spacing;
                points.push(Point3d::new(x + jitter(), y, -1.5 + jitter(), 1.0));
                points.push(Point3d::new(x, y + jitter(), -1.5 + hz + jitter(), 2.0));
            }
        }
        for i in 0..=steps(2.0 * hx) {
            for k in 0..=steps(hz) {
                let x = -hx + i as f32 * spacing;
                let z = -1.5 + k as f32 * spacing;
                points.push(Point3d::new(x, -hy + jitter(), z + jitter(), 3.0));
                points.push(Point3d::new(x + jitter(), hy + jitter(), z, 3.0));
            }
        }
        for j in 0..=steps(2.0 * hy) {
            for k in 0..=steps(hz) {
                let y = -hy + j as f32 * spacing;
                let z = -1.5 + k as f32 * spacing;
                points.push(Point3d::new(-hx + jitter(), y, z + jitter(), 4.0));
                points.push(Point3d::new(hx + jitter(), y + jitter(), z, 4.0));
            }
        }
        // pillars
        for (cx, cy) in [(3.0f32, 2.0f32), (-4.0, -1.5), (1.0, -3.5)] {
            for a in 0..24 {
                let theta = a as f32 / 24.0 * std::f32::consts::TAU;
                for k in 0..=steps(hz) {
                    let z = -1.5 + k as f32 * spacing;
                    points.push(Point3d::new(
                        cx + 0.4 * theta.cos(),
                        cy + 0.4 * theta.sin(),
                        z + jitter(),
                        5.0,
                    ));
                }
            }
        }
        points
    }

    /// Un-jittered room: every wall point shares its exact wall coordinate.
    pub(crate) fn exact_room_cloud(spacing: f32) -> Vec<Point3d> {
        let steps = |len: f32| (len / spacing) as i32;
        let mut points = Vec::new();
        for i in 0..=steps(12.0) {
            for j in 0..=steps(12.0) {
                let (x, y) = (-6.0 + i as f32 * spacing, -6.0 + j as f32 * spacing);
                points.push(Point3d::new(x, y, -1.5, 1.0));
            }
        }
        for i in 0..=steps(12.0) {
            for k in 0..=steps(3.0) {
                let (t, z) = (-6.0 + i as f32 * spacing, -1.5 + k as f32 * spacing);
                points.push(Point3d::new(-6.0, t, z, 2.0));
                points.push(Point3d::new(6.0, t, z, 2.0));
                points.push(Point3d::new(t, 6.0, z, 3.0));
            }
        }
        // a column to break the symmetry along the open side
        for k in 0..=steps(3.0) {
            for a in 0..16 {
                let theta = a as f32 / 16.0 * std::f32::consts::TAU;
                let z = -1.5 + k as f32 * spacing;
                points.push(Point3d::new(2.0 + 0.5 * theta.cos(), 1.0 + 0.5 * theta.sin(), z, 4.0));
            }
        }
        points
    }

    fn params() -> GicpParams {
        GicpParams {
            k_correspondences: 10,
            max_correspondence_distance: 1.0,
            max_iterations: 50,
            transformation_epsilon: 1e-6,
            euclidean_fitness_epsilon: 1e-9,
            ransac_iterations: 0,
            ransac_inlier_threshold: 1.0,
        }
    }

    #[test]
    fn covariances_flatten_on_planes() {
        let points = Arc::new(room_cloud(0.25));
        let cloud = CovarianceCloud::new(points.clone(), 10);
        assert_eq!(cloud.covariances.len(), points.len());
        // a floor point away from the walls: smallest variance along z
        let idx = points
            .iter()
            .position(|p| p.x.abs() < 0.3 && p.y.abs() < 0.3 && p.z < -1.4)
            .unwrap();
        let z = na::Vector3::<f64>::z();
        let along_normal = z.transpose() * cloud.covariances[idx] * z;
        assert!(along_normal[0] < 0.01);
    }

    #[test]
    fn identical_clouds_align_to_identity() {
        let points = Arc::new(room_cloud(0.3));
        let source = CovarianceCloud::new(points.clone(), 10);
        let target = CovarianceCloud::new(points, 10);
        let out = align(&source, &target, &na::Isometry3::identity(), &params());
        assert!(out.converged);
        assert_relative_eq!(out.transform.translation.vector.norm(), 0.0, epsilon = 1e-4);
        assert_relative_eq!(out.transform.rotation.angle(), 0.0, epsilon = 1e-4);
        assert!(out.fitness < 1e-6);
    }

    #[test]
    fn recovers_small_motion() {
        let target_points = Arc::new(room_cloud(0.3));
        let motion = na::Isometry3::new(na::Vector3::new(0.2, -0.1, 0.05), na::Vector3::z() * 0.05);
        // the sensor moved by `motion`: observed points are the inverse motion applied
        let source_points: Vec<Point3d> = target_points
            .iter()
            .map(|p| p.transformed(&motion.inverse()))
            .collect();
        let source = CovarianceCloud::new(Arc::new(source_points), 10);
        let target = CovarianceCloud::new(target_points, 10);
        let mut p = params();
        p.ransac_iterations = 10;
        p.ransac_inlier_threshold = 0.5;
        let out = align(&source, &target, &na::Isometry3::identity(), &p);
        let error = motion.inverse() * out.transform;
        assert!(error.translation.vector.norm() < 0.03, "{}", error.translation.vector);
        assert!(error.rotation.angle() < 0.01);
    }

    #[test]
    fn tree_handles_shared_coordinates_and_duplicates() {
        let mut points = exact_room_cloud(0.1);
        let distinct = PointTree::new(&points).len();
        let copies: Vec<Point3d> = points[..600].to_vec();
        points.extend(copies);
        let tree = PointTree::new(&points);
        assert_eq!(tree.len(), distinct);
        let (idx, d2) = tree.nearest_one(&points[700].to_array_f64()).unwrap();
        assert_eq!(idx, 700);
        assert_eq!(d2, 0.0);
        // a repeated point resolves to its first occurrence
        let last = points.len() - 1;
        assert_eq!(tree.nearest_one(&points[last].to_array_f64()).unwrap().0, 599);
        assert_eq!(tree.nearest_n(&points[10].to_array_f64(), 5).len(), 5);
    }

    #[test]
    fn empty_tree_has_no_neighbours() {
        let tree = PointTree::new(&[]);
        assert!(tree.is_empty());
        assert!(tree.nearest_one(&[0.0, 0.0, 0.0]).is_none());
        assert!(tree.nearest_n(&[0.0, 0.0, 0.0], 4).is_empty());
    }

    #[test]
    fn exact_grid_room_aligns() {
        let target_points = Arc::new(exact_room_cloud(0.1));
        let motion = na::Isometry3::translation(0.15, -0.05, 0.0);
        let source_points: Vec<Point3d> = target_points
            .iter()
            .map(|p| p.transformed(&motion.inverse()))
            .collect();
        let source = CovarianceCloud::new(Arc::new(source_points), 10);
        let target = CovarianceCloud::new(target_points, 10);
        let out = align(&source, &target, &na::Isometry3::identity(), &params());
        let error = motion.inverse() * out.transform;
        assert!(error.translation.vector.norm() < 0.03, "{}", error.translation.vector);
    }

    #[test]
    fn kabsch_recovers_exact_transform() {
        let t = na::Isometry3::new(na::Vector3::new(1.0, 2.0, -0.5), na::Vector3::new(0.1, -0.2, 0.3));
        let pairs: Vec<_> = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 3.0]]
            .iter()
            .map(|p| {
                let s = na::Vector3::new(p[0], p[1], p[2]);
                (s, (t * na::Point3::from(s)).coords)
            })
            .collect();
        let estimate = kabsch(&pairs).unwrap();
        assert_relative_eq!(estimate.to_homogeneous(), t.to_homogeneous(), epsilon = 1e-9);
    }

    #[test]
    fn ransac_drops_gross_outliers() {
        let target: Vec<Point3d> = (0..40)
            .map(|i| Point3d::new(i as f32 * 0.1, (i % 7) as f32 * 0.2, (i % 3) as f32 * 0.3, 0.0))
            .collect();
        let mut source: Vec<na::Vector3<f64>> = target.iter().map(|p| p.to_na_vec_f64()).collect();
        source[5] += na::Vector3::new(3.0, 0.0, 0.0);
        source[17] += na::Vector3::new(0.0, -4.0, 0.0);
        let correspondences = (0..40)
            .map(|i| Correspondence { source: i, target: i, distance2: 0.0 })
            .collect();
        let mut rng = StdRng::seed_from_u64(1);
        let kept = ransac_reject(&source, &target, correspondences, 20, 0.1, &mut rng);
        assert_eq!(kept.len(), 38);
        assert!(kept.iter().all(|c| c.source != 5 && c.source != 17));
    }
}
