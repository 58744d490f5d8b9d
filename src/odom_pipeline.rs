//! Per-scan orchestration: preprocessing, IMU prior, scan-to-scan and
//! scan-to-map registration, adaptive tuning, keyframe and submap upkeep,
//! ground refinement and result assembly.

use log::{debug, info, warn};
use nalgebra as na;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{
    adaptive_params::{AdaptiveTuner, TunedParams},
    bounding_box::{self, BoxSet},
    buffer::{self, BufferConsumer, BufferProducer},
    config::{self, GicpParams},
    error::{FrameFlag, FrameFlags, Result},
    ground::{GroundPlaneEstimate, GroundPlaneRefiner},
    imu::{ImuIntegrator, ImuSample},
    io,
    keyframe::{Keyframe, KeyframeSubmapManager},
    lie_group,
    point3d::{Point3d, Scan},
    preprocess::Preprocessor,
    registrar::ScanRegistrar,
    runtime::CancellationToken,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    /// Waiting for the IMU calibration window to fill.
    GravityAligning,
    SteadyState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StampedPose {
    pub timestamp: f64,
    pub pose: na::Isometry3<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameTimings {
    pub total: Duration,
    pub submap_build: Duration,
    pub ground: Duration,
}

#[derive(Debug, Clone)]
pub struct FrameResult {
    /// Position of this pose in the trajectory.
    pub index: usize,
    pub timestamp: f64,
    pub pose: na::Isometry3<f64>,
    /// Motion since the previous scan, in the previous sensor frame.
    pub increment: na::Isometry3<f64>,
    pub flags: FrameFlags,
    pub keyframe: Option<Arc<Keyframe>>,
    pub submap_rebuilt: bool,
    pub spaciousness: Option<f64>,
    /// Preprocessed scan in the sensor frame, as registered.
    pub points: Arc<Vec<Point3d>>,
    pub timings: FrameTimings,
}

#[derive(Debug)]
pub enum CycleOutcome {
    Cancelled,
    /// The scan arrived before IMU calibration completed and was dropped.
    WaitingForImu,
    Processed(FrameResult),
}

pub struct OdometryPipeline {
    config: config::Config,
    state: PipelineState,

    preprocessor: Preprocessor,
    imu: ImuIntegrator,
    registrar: ScanRegistrar,
    tuner: AdaptiveTuner,
    keyframes: KeyframeSubmapManager,
    ground: Option<GroundPlaneRefiner>,

    imu_input: (BufferProducer<ImuSample>, BufferConsumer<ImuSample>),
    box_input: (BufferProducer<BoxSet>, BufferConsumer<BoxSet>),

    pending: Option<TunedParams>,
    imu_evicted: u64,
    pose: na::Isometry3<f64>,
    increment: na::Isometry3<f64>,
    ground_estimate: GroundPlaneEstimate,
    prev_timestamp: f64,
    trajectory: Vec<StampedPose>,
}

impl OdometryPipeline {
    pub fn new(config: config::Config) -> Result<OdometryPipeline> {
        config.validate()?;
        if config.gravity_align && !config.imu_use {
            warn!("gravity alignment needs the imu, it will be skipped");
        }
        Ok(OdometryPipeline {
            state: PipelineState::Uninitialized,
            preprocessor: Preprocessor::new(&config),
            imu: ImuIntegrator::new(config.imu_calib_time),
            registrar: ScanRegistrar::new(&config),
            tuner: AdaptiveTuner::new(&config),
            keyframes: KeyframeSubmapManager::new(&config),
            ground: config.ground_use.then(|| GroundPlaneRefiner::new(&config.ground)),
            imu_input: buffer::shared_buffer(config.imu_buffer_size),
            box_input: buffer::shared_buffer(config.box_buffer_size),
            pending: None,
            imu_evicted: 0,
            pose: na::Isometry3::identity(),
            increment: na::Isometry3::identity(),
            ground_estimate: GroundPlaneEstimate::default(),
            prev_timestamp: f64::NEG_INFINITY,
            trajectory: Vec::new(),
            config,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Handle for an asynchronous IMU producer.
    pub fn imu_input(&self) -> BufferProducer<ImuSample> {
        self.imu_input.0.clone()
    }

    /// Handle for an asynchronous detector publishing dynamic-object boxes.
    pub fn box_input(&self) -> BufferProducer<BoxSet> {
        self.box_input.0.clone()
    }

    pub fn trajectory(&self) -> &[StampedPose] {
        &self.trajectory
    }

    pub fn keyframes(&self) -> &[Arc<Keyframe>] {
        self.keyframes.keyframes()
    }

    /// Registration pose of the last processed scan, before ground refinement.
    pub fn pose(&self) -> na::Isometry3<f64> {
        self.pose
    }

    pub fn registration_params(&self) -> (GicpParams, GicpParams) {
        self.registrar.params()
    }

    pub fn scan_voxel_res(&self) -> Option<f32> {
        self.preprocessor.voxel_res()
    }

    pub fn spaciousness(&self) -> Option<f64> {
        self.tuner.spaciousness_history().back().copied()
    }

    pub fn spaciousness_history_len(&self) -> usize {
        self.tuner.spaciousness_history().len()
    }

    pub fn save_trajectory(&self, path: &str) -> Result<()> {
        io::save_trajectory(path, &self.trajectory)?;
        info!("saved {} poses to {}", self.trajectory.len(), path);
        Ok(())
    }

    fn apply_pending_params(&mut self) {
        let Some(p) = self.pending.take() else {
            return;
        };
        self.registrar.set_params(p.s2s, p.s2m);
        if let Some(res) = p.scan_voxel_res {
            self.preprocessor.set_voxel_res(res);
        }
        if let Some(res) = p.submap_voxel_res {
            self.keyframes.set_voxel_res(res);
        }
        self.keyframes.set_thresh_dist(p.keyframe_thresh_dist);
        self.keyframes.set_concave_alpha(p.concave_alpha);
    }

    fn initial_pose(&self) -> na::Isometry3<f64> {
        if self.config.initial_pose_use {
            let [x, y, z] = self.config.initial_position;
            let [qw, qx, qy, qz] = self.config.initial_orientation;
            return na::Isometry3::from_parts(
                na::Translation3::new(x, y, z),
                na::UnitQuaternion::from_quaternion(na::Quaternion::new(qw, qx, qy, qz)),
            );
        }
        if self.config.gravity_align && self.config.imu_use {
            if let Some(q) = self.imu.gravity_align() {
                return na::Isometry3::from_parts(na::Translation3::identity(), q);
            }
        }
        na::Isometry3::identity()
    }

    /// Runs one full cycle on `scan`.
    pub fn process_scan(&mut self, scan: &Scan, cancel: &CancellationToken) -> CycleOutcome {
        if cancel.is_cancelled() {
            return CycleOutcome::Cancelled;
        }
        let start = Instant::now();
        self.apply_pending_params();

        if self.config.imu_use {
            let (samples, evicted) = self.imu_input.1.snapshot_with_evicted();
            if evicted > self.imu_evicted {
                debug!("imu buffer full, {} samples evicted", evicted - self.imu_evicted);
                self.imu_evicted = evicted;
            }
            self.imu.ingest(samples);
            if self.state != PipelineState::SteadyState && !self.imu.is_calibrated() {
                if self.state == PipelineState::Uninitialized {
                    info!("waiting for imu calibration ({:.1} s)", self.config.imu_calib_time);
                    self.state = PipelineState::GravityAligning;
                }
                return CycleOutcome::WaitingForImu;
            }
        }

        let box_sets = self.box_input.1.snapshot();
        let boxes =
            bounding_box::nearest_box_set(&box_sets, scan.timestamp, self.config.box_sync_tolerance);
        let preprocessed = self.preprocessor.process(scan, boxes);
        let source = self.registrar.prepare_source(preprocessed.points);
        let mut flags = FrameFlags::default();

        let (pose, keyframe) = if self.state == PipelineState::SteadyState {
            // imu prior
            let imu_rotation = if self.config.imu_use {
                let q = self.imu.integrate_imu(self.prev_timestamp, scan.timestamp);
                if q.is_none() {
                    flags.raise(FrameFlag::StaleImuData);
                }
                q
            } else {
                None
            };
            let s2s_guess = match imu_rotation {
                Some(q) => na::Isometry3::from_parts(self.increment.translation, q),
                None => self.increment,
            };

            let s2s = self.registrar.register_s2s(&source, &s2s_guess);
            let s2m = self.registrar.register_s2m(&source, &(self.pose * s2s.transform));
            for flag in s2s.flags.iter().chain(s2m.flags.iter()) {
                flags.raise(*flag);
            }
            debug!(
                "s2s fitness {:.4} ({} it), s2m fitness {:.4} ({} it)",
                s2s.fitness, s2s.iterations, s2m.fitness, s2m.iterations
            );
            let pose = lie_group::renormalize(&s2m.transform);
            let keyframe = self.keyframes.update_keyframes(scan.timestamp, &pose, &source);
            (pose, keyframe)
        } else {
            let pose = self.initial_pose();
            info!(
                "initialized at [{:.2}, {:.2}, {:.2}] with {} points",
                pose.translation.x,
                pose.translation.y,
                pose.translation.z,
                source.len()
            );
            self.state = PipelineState::SteadyState;
            let keyframe = self.keyframes.insert_keyframe(scan.timestamp, &pose, &source);
            (pose, Some(keyframe))
        };

        let spaciousness = self.tuner.compute_spaciousness(&preprocessed.filtered);
        self.pending = self.tuner.set_adaptive_params();

        let submap_start = Instant::now();
        let submap_rebuilt = match self.keyframes.get_submap_keyframes(&pose) {
            Some(update) => self.registrar.set_submap(&update.submap) && update.rebuilt,
            None => false,
        };
        let submap_build = submap_start.elapsed();

        let ground_start = Instant::now();
        let output_pose = match self.ground.as_mut() {
            Some(refiner) => {
                let refined = refiner.refine(&preprocessed.filtered, &pose, self.ground_estimate);
                if !refined.applied {
                    flags.raise(FrameFlag::GroundFitInsufficientPoints);
                }
                self.ground_estimate = refined.estimate;
                refined.pose
            }
            None => pose,
        };
        let ground = ground_start.elapsed();

        self.increment = if self.trajectory.is_empty() {
            na::Isometry3::identity()
        } else {
            self.pose.inverse() * pose
        };
        self.pose = pose;
        self.prev_timestamp = scan.timestamp;
        self.trajectory.push(StampedPose {
            timestamp: scan.timestamp,
            pose: output_pose,
        });
        let points = source.points.clone();
        self.registrar.swap_source_and_target(source);

        if flags.is_degraded() {
            warn!("frame {:.3} degraded: {:?}", scan.timestamp, flags);
        }
        CycleOutcome::Processed(FrameResult {
            index: self.trajectory.len() - 1,
            timestamp: scan.timestamp,
            pose: output_pose,
            increment: self.increment,
            flags,
            keyframe,
            submap_rebuilt,
            spaciousness,
            points,
            timings: FrameTimings {
                total: start.elapsed(),
                submap_build,
                ground,
            },
        })
    }
}
