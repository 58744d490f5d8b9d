//! Height and tilt correction against a locally fitted ground plane.

use log::{debug, info};
use nalgebra as na;

use crate::{config::GroundConfig, point3d::Point3d};

// unknowns of the fit: height and two tilts
pub const MIN_GROUND_POINTS: usize = 3;

/// Correction applied on top of a registered pose: an offset along the ground
/// normal plus small rotations about the two in-plane axes, around the pose origin.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GroundPlaneEstimate {
    pub height_offset: f64,
    pub tilt: na::Vector2<f64>,
}

impl GroundPlaneEstimate {
    fn to_vector(self) -> na::Vector3<f64> {
        na::Vector3::new(self.height_offset, self.tilt.x, self.tilt.y)
    }

    fn from_vector(x: &na::Vector3<f64>) -> GroundPlaneEstimate {
        GroundPlaneEstimate {
            height_offset: x[0],
            tilt: na::Vector2::new(x[1], x[2]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroundRefinement {
    pub estimate: GroundPlaneEstimate,
    pub pose: na::Isometry3<f64>,
    pub applied: bool,
    pub num_candidates: usize,
}

pub struct GroundPlaneRefiner {
    normal: na::Unit<na::Vector3<f64>>,
    tangent: (na::Vector3<f64>, na::Vector3<f64>),
    config: GroundConfig,
    reference_height: Option<f64>,
}

fn tangent_basis(n: &na::Vector3<f64>) -> (na::Vector3<f64>, na::Vector3<f64>) {
    let seed = if n.x.abs() < 0.9 {
        na::Vector3::x()
    } else {
        na::Vector3::y()
    };
    let u = (seed - n * n.dot(&seed)).normalize();
    let v = n.cross(&u);
    (u, v)
}

impl GroundPlaneRefiner {
    pub fn new(config: &GroundConfig) -> GroundPlaneRefiner {
        let normal = na::Unit::new_normalize(na::Vector3::from(config.normal));
        GroundPlaneRefiner {
            normal,
            tangent: tangent_basis(&normal),
            config: config.clone(),
            reference_height: None,
        }
    }

    fn min_points(&self) -> usize {
        self.config.min_points.max(MIN_GROUND_POINTS)
    }

    /// Height of the ground plane along the normal, once known.
    pub fn reference_height(&self) -> Option<f64> {
        self.reference_height
    }

    fn establish_reference(&mut self, heights: &mut [f64], origin_height: f64) -> Option<f64> {
        if let Some(h) = self.reference_height {
            return Some(h);
        }
        let h = match self.config.sensor_height {
            Some(sensor_height) => origin_height - sensor_height,
            None => {
                if heights.is_empty() || heights.len() < self.min_points() {
                    return None;
                }
                // median of the lowest decile
                heights.sort_unstable_by(|a, b| a.total_cmp(b));
                let decile = &heights[..(heights.len() / 10).max(1)];
                decile[decile.len() / 2]
            }
        };
        info!("ground reference plane at height {:.3}", h);
        self.reference_height = Some(h);
        Some(h)
    }

    /// Fits the ground seen in `points` (sensor frame) and corrects `pose`,
    /// starting from and smoothing towards `previous`.
    ///
    /// With too few ground candidates the pose is returned untouched and
    /// `previous` is carried forward.
    pub fn refine(
        &mut self,
        points: &[Point3d],
        pose: &na::Isometry3<f64>,
        previous: GroundPlaneEstimate,
    ) -> GroundRefinement {
        let skipped = |num_candidates| GroundRefinement {
            estimate: previous,
            pose: *pose,
            applied: false,
            num_candidates,
        };
        let n = self.normal.into_inner();
        let c = pose.translation.vector;
        let world: Vec<na::Vector3<f64>> = points
            .iter()
            .map(|p| (pose * p.to_na_point3_f64()).coords)
            .collect();
        let mut heights: Vec<f64> = world.iter().map(|p| n.dot(p)).collect();
        let Some(h_ref) = self.establish_reference(&mut heights, n.dot(&c)) else {
            return skipped(0);
        };

        let candidates: Vec<na::Vector3<f64>> = world
            .into_iter()
            .filter(|p| (n.dot(p) - h_ref).abs() < self.config.threshold)
            .collect();
        if candidates.len() < self.min_points() {
            debug!("ground: {} candidates, keeping previous correction", candidates.len());
            return skipped(candidates.len());
        }

        let (u, v) = self.tangent;
        let prior = previous.to_vector();
        let weight = self.config.smoothing_weight * candidates.len() as f64;
        let mut x = prior;
        for _ in 0..self.config.max_iterations {
            let rotation = na::UnitQuaternion::from_scaled_axis(u * x[1] + v * x[2]);
            let (mut h, mut g) = (na::Matrix3::<f64>::zeros(), na::Vector3::<f64>::zeros());
            for p in candidates.iter() {
                let q = rotation * (p - c);
                let r = n.dot(&(q + c)) + x[0] - h_ref;
                let qn = q.cross(&n);
                let j = na::Vector3::new(1.0, u.dot(&qn), v.dot(&qn));
                h += j * j.transpose();
                g += j * r;
            }
            h += na::Matrix3::identity() * weight;
            g += (x - prior) * weight;
            let Some(dx) = h.lu().solve(&(-g)) else {
                return skipped(candidates.len());
            };
            x += dx;
            if dx.norm() < 1e-9 {
                break;
            }
        }

        let estimate = GroundPlaneEstimate::from_vector(&x);
        let rotation = na::UnitQuaternion::from_scaled_axis(u * x[1] + v * x[2]);
        let corrected = na::Isometry3::from_parts(
            na::Translation3::from(c + n * x[0]),
            rotation * pose.rotation,
        );
        GroundRefinement {
            estimate,
            pose: corrected,
            applied: true,
            num_candidates: candidates.len(),
        }
    }
}
