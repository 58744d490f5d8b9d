use nalgebra as na;

pub trait Hat {
    fn hat(&self) -> na::Matrix3<f64>;
}

impl Hat for na::Vector3<f64> {
    fn hat(&self) -> na::Matrix3<f64> {
        na::Matrix3::new(
            0.0, -self.z, self.y, //
            self.z, 0.0, -self.x, //
            -self.y, self.x, 0.0,
        )
    }
}

/// Maps a [trans 3, rotation 3] increment onto a left-applied rigid transform.
pub trait Exp {
    fn exp(&self) -> na::Isometry3<f64>;
}

impl Exp for na::Vector6<f64> {
    fn exp(&self) -> na::Isometry3<f64> {
        let translation = na::Translation3::new(self[0], self[1], self[2]);
        let rotation = na::UnitQuaternion::from_scaled_axis(na::Vector3::new(
            self[3], self[4], self[5],
        ));
        na::Isometry3::from_parts(translation, rotation)
    }
}

/// Rotation angle of a relative rotation in degrees, always in [0, 180].
pub fn rotation_angle_deg(a: &na::UnitQuaternion<f64>, b: &na::UnitQuaternion<f64>) -> f64 {
    a.angle_to(b).to_degrees()
}

/// Renormalizes the rotation to keep drift from accumulating over many compositions.
pub fn renormalize(pose: &na::Isometry3<f64>) -> na::Isometry3<f64> {
    na::Isometry3::from_parts(
        pose.translation,
        na::UnitQuaternion::from_quaternion(pose.rotation.into_inner().normalize()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn hat_is_cross_product() {
        let a = na::Vector3::new(1.0, -2.0, 0.5);
        let b = na::Vector3::new(0.3, 0.7, -1.1);
        assert_relative_eq!(a.hat() * b, a.cross(&b), epsilon = 1e-12);
    }

    #[test]
    fn zero_increment_is_identity() {
        let t = na::Vector6::<f64>::zeros().exp();
        assert_relative_eq!(t.to_homogeneous(), na::Matrix4::identity(), epsilon = 1e-12);
    }

    #[test]
    fn rotation_angle_is_symmetric() {
        let a = na::UnitQuaternion::from_euler_angles(0.0, 0.0, 0.3);
        let b = na::UnitQuaternion::from_euler_angles(0.0, 0.0, -0.2);
        assert_relative_eq!(rotation_angle_deg(&a, &b), 0.5f64.to_degrees(), epsilon = 1e-9);
        assert_relative_eq!(rotation_angle_deg(&b, &a), 0.5f64.to_degrees(), epsilon = 1e-9);
    }
}
