use log::{debug, warn};
use nalgebra as na;
use std::sync::Arc;

use crate::{
    config::{self, GicpParams},
    error::{FrameFlag, FrameFlags},
    gicp::{self, CovarianceCloud},
    keyframe::Submap,
    point3d::Point3d,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ScanToScan,
    ScanToMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub transform: na::Isometry3<f64>,
    pub fitness: f64,
    pub iterations: u16,
    pub skipped: bool,
    pub flags: FrameFlags,
}

impl StageOutcome {
    fn passthrough(guess: &na::Isometry3<f64>) -> StageOutcome {
        let mut flags = FrameFlags::default();
        flags.raise(FrameFlag::InsufficientPoints);
        StageOutcome {
            transform: *guess,
            fitness: f64::INFINITY,
            iterations: 0,
            skipped: true,
            flags,
        }
    }
}

/// Scan-to-scan and scan-to-map registration with their own parameters.
///
/// The previous scan stays cached as the scan-to-scan target together with
/// its covariances, and the submap target is only rebuilt when the manager
/// hands over a different submap.
pub struct ScanRegistrar {
    min_num_points: usize,
    max_fitness: f64,
    s2s: GicpParams,
    s2m: GicpParams,
    previous: Option<CovarianceCloud>,
    submap: Option<(Arc<Submap>, CovarianceCloud)>,
}

impl ScanRegistrar {
    pub fn new(config: &config::Config) -> ScanRegistrar {
        ScanRegistrar {
            min_num_points: config.gicp_min_num_points,
            max_fitness: config.max_fitness_score,
            s2s: config.s2s,
            s2m: config.s2m,
            previous: None,
            submap: None,
        }
    }

    pub fn params(&self) -> (GicpParams, GicpParams) {
        (self.s2s, self.s2m)
    }

    pub fn set_params(&mut self, s2s: GicpParams, s2m: GicpParams) {
        self.s2s = s2s;
        self.s2m = s2m;
    }

    /// Builds the search tree and covariances of the current scan.
    pub fn prepare_source(&self, points: Vec<Point3d>) -> CovarianceCloud {
        CovarianceCloud::new(Arc::new(points), self.s2s.k_correspondences)
    }

    pub fn has_previous(&self) -> bool {
        self.previous.is_some()
    }

    /// The current scan becomes the next scan-to-scan target, covariances included.
    pub fn swap_source_and_target(&mut self, source: CovarianceCloud) {
        self.previous = Some(source);
    }

    /// Points the scan-to-map stage at `submap`. Same `Arc` means nothing to rebuild.
    pub fn set_submap(&mut self, submap: &Arc<Submap>) -> bool {
        if let Some((current, _)) = &self.submap {
            if Arc::ptr_eq(current, submap) {
                return false;
            }
        }
        let target =
            CovarianceCloud::with_covariances(submap.points.clone(), submap.normals.clone());
        self.submap = Some((submap.clone(), target));
        true
    }

    pub fn register_s2s(&self, source: &CovarianceCloud, guess: &na::Isometry3<f64>) -> StageOutcome {
        self.register(Stage::ScanToScan, source, self.previous.as_ref(), guess)
    }

    pub fn register_s2m(&self, source: &CovarianceCloud, guess: &na::Isometry3<f64>) -> StageOutcome {
        let target = self.submap.as_ref().map(|(_, cloud)| cloud);
        self.register(Stage::ScanToMap, source, target, guess)
    }

    fn register(
        &self,
        stage: Stage,
        source: &CovarianceCloud,
        target: Option<&CovarianceCloud>,
        guess: &na::Isometry3<f64>,
    ) -> StageOutcome {
        let target_len = target.map_or(0, |t| t.len());
        let (target, params) = match (target, stage) {
            (Some(t), Stage::ScanToScan) => (t, &self.s2s),
            (Some(t), Stage::ScanToMap) => (t, &self.s2m),
            (None, _) => {
                warn!("{:?}: no target, passing initial guess through", stage);
                return StageOutcome::passthrough(guess);
            }
        };
        if source.len() < self.min_num_points || target_len < self.min_num_points {
            warn!(
                "{:?}: low number of points (source {}, target {}), skipped",
                stage,
                source.len(),
                target_len
            );
            return StageOutcome::passthrough(guess);
        }

        let out = gicp::align(source, target, guess, params);
        let mut flags = FrameFlags::default();
        if !out.converged || out.fitness > self.max_fitness {
            warn!(
                "{:?}: not converged after {} iterations, fitness {:.4}",
                stage, out.iterations, out.fitness
            );
            flags.raise(FrameFlag::RegistrationNonConvergence);
        } else {
            debug!(
                "{:?}: converged in {} iterations, fitness {:.5}",
                stage, out.iterations, out.fitness
            );
        }
        StageOutcome {
            transform: out.transform,
            fitness: out.fitness,
            iterations: out.iterations,
            skipped: false,
            flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gicp::tests::room_cloud;
    use std::collections::BTreeSet;

    fn registrar() -> ScanRegistrar {
        let mut config = config::Config::default_values();
        config.gicp_min_num_points = 50;
        ScanRegistrar::new(&config)
    }

    #[test]
    fn s2s_without_previous_passes_guess_through() {
        let reg = registrar();
        let source = reg.prepare_source(room_cloud(0.5));
        let guess = na::Isometry3::translation(1.0, 0.0, 0.0);
        let out = reg.register_s2s(&source, &guess);
        assert!(out.skipped);
        assert_eq!(out.transform, guess);
        assert!(out.flags.contains(FrameFlag::InsufficientPoints));
    }

    #[test]
    fn small_source_is_skipped() {
        let mut reg = registrar();
        let previous = reg.prepare_source(room_cloud(0.5));
        reg.swap_source_and_target(previous);
        let tiny = reg.prepare_source(room_cloud(0.5).into_iter().take(10).collect());
        let guess = na::Isometry3::translation(0.0, 0.3, 0.0);
        let out = reg.register_s2s(&tiny, &guess);
        assert!(out.skipped);
        assert_eq!(out.transform, guess);
        assert!(out.flags.is_degraded());
    }

    #[test]
    fn same_scan_registers_to_identity() {
        let mut reg = registrar();
        let previous = reg.prepare_source(room_cloud(0.4));
        reg.swap_source_and_target(previous);
        let source = reg.prepare_source(room_cloud(0.4));
        let out = reg.register_s2s(&source, &na::Isometry3::identity());
        assert!(!out.skipped);
        assert!(out.flags.is_empty());
        assert!(out.transform.translation.vector.norm() < 1e-4);
    }

    fn shifted(points: &[Point3d], motion: &na::Isometry3<f64>) -> Vec<Point3d> {
        points.iter().map(|p| p.transformed(&motion.inverse())).collect()
    }

    #[test]
    fn iteration_cap_flags_non_convergence() {
        let mut config = config::Config::default_values();
        config.gicp_min_num_points = 50;
        config.s2s.max_iterations = 1;
        let mut reg = ScanRegistrar::new(&config);
        let cloud = room_cloud(0.4);
        let previous = reg.prepare_source(cloud.clone());
        reg.swap_source_and_target(previous);
        let motion = na::Isometry3::translation(0.3, 0.0, 0.0);
        let source = reg.prepare_source(shifted(&cloud, &motion));

        let out = reg.register_s2s(&source, &na::Isometry3::identity());
        assert!(!out.skipped);
        assert_eq!(out.iterations, 1);
        assert!(out.flags.contains(FrameFlag::RegistrationNonConvergence));
        assert!(out.flags.is_degraded());
        // the only scored estimate is the guess
        assert_eq!(out.transform, na::Isometry3::identity());
        assert!(out.fitness.is_finite());
    }

    #[test]
    fn poor_fitness_flags_non_convergence() {
        let mut config = config::Config::default_values();
        config.gicp_min_num_points = 50;
        config.max_fitness_score = 1e-12;
        config.s2s.transformation_epsilon = 1e-6;
        config.s2s.euclidean_fitness_epsilon = 1e-9;
        let mut reg = ScanRegistrar::new(&config);
        let cloud = room_cloud(0.4);
        let previous = reg.prepare_source(cloud.clone());
        reg.swap_source_and_target(previous);
        let motion = na::Isometry3::translation(0.1, 0.05, 0.0);
        let source = reg.prepare_source(shifted(&cloud, &motion));

        let out = reg.register_s2s(&source, &na::Isometry3::identity());
        assert!(out.flags.contains(FrameFlag::RegistrationNonConvergence));
        assert!(out.fitness > 1e-12);
        // the solve itself still moved towards the motion
        let error = motion.inverse() * out.transform;
        assert!(error.translation.vector.norm() < 0.03, "{}", error.translation.vector);
    }

    #[test]
    fn submap_target_reused_for_same_arc() {
        let mut reg = registrar();
        let points = Arc::new(room_cloud(0.5));
        let source = reg.prepare_source(points.as_ref().clone());
        let submap = Arc::new(Submap {
            points: points.clone(),
            normals: source.covariances.clone(),
            members: BTreeSet::from([0]),
        });
        assert!(reg.set_submap(&submap));
        assert!(!reg.set_submap(&submap));
        let out = reg.register_s2m(&source, &na::Isometry3::identity());
        assert!(!out.skipped);
        assert!(out.transform.translation.vector.norm() < 1e-4);
    }
}
