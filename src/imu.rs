//! Inertial prior: bias calibration, rotation integration between scans and
//! one-time gravity alignment.

use log::{info, warn};
use nalgebra as na;

use crate::buffer::Stamped;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub timestamp: f64,
    pub angular_velocity: na::Vector3<f64>,
    pub linear_acceleration: na::Vector3<f64>,
}

impl Stamped for ImuSample {
    fn stamp(&self) -> f64 {
        self.timestamp
    }
}

/// Sensor offsets, mean of the calibration window. Set once per session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuBias {
    pub gyro: na::Vector3<f64>,
    pub accel: na::Vector3<f64>,
}

impl ImuBias {
    pub fn zero() -> ImuBias {
        ImuBias {
            gyro: na::Vector3::zeros(),
            accel: na::Vector3::zeros(),
        }
    }
}

pub struct ImuIntegrator {
    calib_time: f64,
    first_stamp: Option<f64>,
    last_ingested: f64,
    gyro_sum: na::Vector3<f64>,
    accel_sum: na::Vector3<f64>,
    num_samples: usize,
    bias: Option<ImuBias>,
    // samples of the current cycle
    samples: Vec<ImuSample>,
}

impl ImuIntegrator {
    pub fn new(calib_time: f64) -> ImuIntegrator {
        ImuIntegrator {
            calib_time,
            first_stamp: None,
            last_ingested: f64::NEG_INFINITY,
            gyro_sum: na::Vector3::zeros(),
            accel_sum: na::Vector3::zeros(),
            num_samples: 0,
            bias: None,
            samples: Vec::new(),
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.bias.is_some()
    }

    pub fn bias(&self) -> Option<ImuBias> {
        self.bias
    }

    /// Takes this cycle's buffer snapshot and advances calibration with the
    /// samples not seen before.
    pub fn ingest(&mut self, snapshot: Vec<ImuSample>) {
        if self.bias.is_none() {
            let last_ingested = self.last_ingested;
            for sample in snapshot.iter().filter(|s| s.timestamp > last_ingested) {
                self.accumulate(sample);
                if self.bias.is_some() {
                    break;
                }
            }
        }
        if let Some(last) = snapshot.last() {
            self.last_ingested = self.last_ingested.max(last.timestamp);
        }
        self.samples = snapshot;
    }

    fn accumulate(&mut self, sample: &ImuSample) {
        let first = *self.first_stamp.get_or_insert(sample.timestamp);
        if sample.timestamp - first < self.calib_time {
            self.gyro_sum += sample.angular_velocity;
            self.accel_sum += sample.linear_acceleration;
            self.num_samples += 1;
            return;
        }
        let bias = if self.num_samples == 0 {
            warn!("imu calibration window held no samples, using zero bias");
            ImuBias::zero()
        } else {
            let n = self.num_samples as f64;
            ImuBias {
                gyro: self.gyro_sum / n,
                accel: self.accel_sum / n,
            }
        };
        info!(
            "imu calibrated over {} samples, gyro bias [{:.5}, {:.5}, {:.5}]",
            self.num_samples, bias.gyro.x, bias.gyro.y, bias.gyro.z
        );
        self.bias = Some(bias);
    }

    /// Bias-corrected rotation from the sensor frame at `t0` to the one at `t1`.
    ///
    /// Returns `None` when no sample of the current snapshot falls in `[t0, t1]`.
    pub fn integrate_imu(&self, t0: f64, t1: f64) -> Option<na::UnitQuaternion<f64>> {
        if t1 < t0 {
            return None;
        }
        let gyro_bias = self.bias.map(|b| b.gyro).unwrap_or_else(na::Vector3::zeros);
        let mut inside: Vec<na::Vector3<f64>> = Vec::new();
        let mut stamps = Vec::new();
        for s in self.samples.iter().filter(|s| s.timestamp >= t0 && s.timestamp <= t1) {
            inside.push(s.angular_velocity - gyro_bias);
            stamps.push(s.timestamp);
        }
        let first_rate = *inside.first()?;

        let mut q = na::UnitQuaternion::identity();
        let mut prev_t = t0;
        let mut prev_w = first_rate;
        for (w, t) in inside.iter().zip(stamps.iter()) {
            let dt = t - prev_t;
            q *= na::UnitQuaternion::from_scaled_axis((prev_w + w) * 0.5 * dt);
            prev_t = *t;
            prev_w = *w;
        }
        q *= na::UnitQuaternion::from_scaled_axis(prev_w * (t1 - prev_t));
        Some(q)
    }

    /// Rotation taking the mean calibration acceleration onto world +Z.
    pub fn gravity_align(&self) -> Option<na::UnitQuaternion<f64>> {
        let accel = self.bias?.accel;
        if accel.norm() < 1e-6 {
            warn!("no gravity observed during calibration, skipping alignment");
            return None;
        }
        let up = na::Vector3::z();
        let q = na::UnitQuaternion::rotation_between(&accel, &up).unwrap_or_else(|| {
            // upside down
            na::UnitQuaternion::from_axis_angle(&na::Vector3::x_axis(), std::f64::consts::PI)
        });
        let (roll, pitch, yaw) = q.euler_angles();
        info!(
            "gravity aligned, roll {:.3} pitch {:.3} yaw {:.3} deg",
            roll.to_degrees(),
            pitch.to_degrees(),
            yaw.to_degrees()
        );
        Some(q)
    }
}
