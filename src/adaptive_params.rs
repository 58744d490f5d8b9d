use std::collections::VecDeque;

use crate::{
    config::{self, AdaptiveConfig, GicpParams},
    point3d::Point3d,
};

const HISTORY_CAPACITY: usize = 1000;

/// Everything the tuner is allowed to change between frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TunedParams {
    pub s2s: GicpParams,
    pub s2m: GicpParams,
    pub scan_voxel_res: Option<f32>,
    pub submap_voxel_res: Option<f32>,
    pub keyframe_thresh_dist: f64,
    pub concave_alpha: f64,
}

impl TunedParams {
    pub fn from_config(config: &config::Config) -> TunedParams {
        TunedParams {
            s2s: config.s2s,
            s2m: config.s2m,
            scan_voxel_res: config.vf_scan_use.then_some(config.vf_scan_res),
            submap_voxel_res: config.vf_submap_use.then_some(config.vf_submap_res),
            keyframe_thresh_dist: config.keyframe_thresh_dist,
            concave_alpha: config.submap_concave_alpha,
        }
    }
}

pub struct AdaptiveTuner {
    enabled: bool,
    bounds: AdaptiveConfig,
    base: TunedParams,
    spaciousness: VecDeque<f64>,
}

impl AdaptiveTuner {
    pub fn new(config: &config::Config) -> AdaptiveTuner {
        AdaptiveTuner {
            enabled: config.adaptive_params_use,
            bounds: config.adaptive.clone(),
            base: TunedParams::from_config(config),
            spaciousness: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    pub fn spaciousness_history(&self) -> &VecDeque<f64> {
        &self.spaciousness
    }

    /// Median range of the scan, smoothed against the previous value.
    pub fn compute_spaciousness(&mut self, points: &[Point3d]) -> Option<f64> {
        let mut ranges: Vec<f32> = points.iter().map(|p| p.square().sqrt()).collect();
        if ranges.is_empty() {
            return None;
        }
        let mid = ranges.len() / 2;
        let (_, median, _) = ranges.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
        let median = *median as f64;
        let value = match self.spaciousness.back() {
            Some(prev) => 0.95 * prev + 0.05 * median,
            None => median,
        };
        if self.spaciousness.len() == HISTORY_CAPACITY {
            self.spaciousness.pop_front();
        }
        self.spaciousness.push_back(value);
        Some(value)
    }

    /// Parameters for the next frame, or `None` when nothing should change.
    pub fn set_adaptive_params(&self) -> Option<TunedParams> {
        if !self.enabled || self.spaciousness.is_empty() {
            return None;
        }
        let b = &self.bounds;
        let window = self.spaciousness.len().min(b.window_size);
        let avg = self.spaciousness.iter().rev().take(window).sum::<f64>() / window as f64;
        let scale = (avg / b.reference_spaciousness).clamp(b.min_scale, b.max_scale);

        let corr = |p: &GicpParams| GicpParams {
            max_correspondence_distance: (p.max_correspondence_distance * scale)
                .clamp(b.min_correspondence_distance, b.max_correspondence_distance),
            ..*p
        };
        let voxel = |res: Option<f32>| {
            res.map(|r| (r * scale as f32).clamp(b.min_voxel_res, b.max_voxel_res))
        };
        let keyframe_thresh_dist = keyframe_distance_for(avg);

        Some(TunedParams {
            s2s: corr(&self.base.s2s),
            s2m: corr(&self.base.s2m),
            scan_voxel_res: voxel(self.base.scan_voxel_res),
            submap_voxel_res: voxel(self.base.submap_voxel_res),
            keyframe_thresh_dist,
            concave_alpha: keyframe_thresh_dist / 2.0,
        })
    }
}

fn keyframe_distance_for(spaciousness: f64) -> f64 {
    if spaciousness > 20.0 {
        10.0
    } else if spaciousness > 10.0 {
        5.0
    } else if spaciousness > 5.0 {
        1.0
    } else {
        0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ring(radius: f32) -> Vec<Point3d> {
        (0..360)
            .map(|i| {
                let a = (i as f32).to_radians();
                Point3d::new(radius * a.cos(), radius * a.sin(), 0.0, 0.0)
            })
            .collect()
    }

    #[test]
    fn spaciousness_is_median_range_smoothed() {
        let mut tuner = AdaptiveTuner::new(&config::Config::default_values());
        let first = tuner.compute_spaciousness(&ring(10.0)).unwrap();
        assert_relative_eq!(first, 10.0, epsilon = 1e-4);
        let second = tuner.compute_spaciousness(&ring(30.0)).unwrap();
        assert_relative_eq!(second, 0.95 * first + 0.05 * 30.0, epsilon = 1e-4);
        assert!(tuner.compute_spaciousness(&[]).is_none());
        assert_eq!(tuner.spaciousness_history().len(), 2);
    }

    #[test]
    fn parameters_grow_with_openness_and_stay_bounded() {
        let config = config::Config::default_values();
        let mut cluttered = AdaptiveTuner::new(&config);
        let mut open = AdaptiveTuner::new(&config);
        cluttered.compute_spaciousness(&ring(2.0));
        open.compute_spaciousness(&ring(200.0));
        let small = cluttered.set_adaptive_params().unwrap();
        let large = open.set_adaptive_params().unwrap();
        assert!(small.s2m.max_correspondence_distance < large.s2m.max_correspondence_distance);
        assert!(large.s2s.max_correspondence_distance <= config.adaptive.max_correspondence_distance);
        assert!(small.s2m.max_correspondence_distance >= config.adaptive.min_correspondence_distance);
        assert!(small.scan_voxel_res.unwrap() < large.scan_voxel_res.unwrap());
        assert!(large.submap_voxel_res.unwrap() <= config.adaptive.max_voxel_res);
        assert_eq!(small.keyframe_thresh_dist, 0.5);
        assert_eq!(large.keyframe_thresh_dist, 10.0);
        assert_eq!(large.concave_alpha, 5.0);
        // untouched fields keep their base values
        assert_eq!(large.s2m.max_iterations, config.s2m.max_iterations);
    }

    #[test]
    fn disabled_tuner_changes_nothing() {
        let mut config = config::Config::default_values();
        config.adaptive_params_use = false;
        let mut tuner = AdaptiveTuner::new(&config);
        tuner.compute_spaciousness(&ring(50.0));
        assert!(tuner.set_adaptive_params().is_none());
    }

    #[test]
    fn history_is_bounded() {
        let mut tuner = AdaptiveTuner::new(&config::Config::default_values());
        let cloud = ring(5.0);
        for _ in 0..(HISTORY_CAPACITY + 20) {
            tuner.compute_spaciousness(&cloud);
        }
        assert_eq!(tuner.spaciousness_history().len(), HISTORY_CAPACITY);
    }
}
