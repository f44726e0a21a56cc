//! Sim3: 7-DOF similarity transformation (rotation + translation + scale).
//!
//! Relative poses between keyframes carry a scale factor because monocular
//! depth is only defined up to scale; the promote-time re-normalization of
//! the depth map folds its correction into this scale.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

use super::SE3;

/// 7-DOF similarity transformation.
///
/// Transforms points as: p' = s * R * p + t
#[derive(Debug, Clone, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    /// Identity transformation (no rotation, no translation, scale = 1).
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    /// Construct from SE3 with scale = 1.0.
    pub fn from_se3(se3: &SE3) -> Self {
        Self {
            rotation: se3.rotation,
            translation: se3.translation,
            scale: 1.0,
        }
    }

    /// Construct from SE3 with explicit scale.
    pub fn from_se3_with_scale(se3: &SE3, scale: f64) -> Self {
        Self {
            rotation: se3.rotation,
            translation: se3.translation,
            scale,
        }
    }

    /// Drop the scale, keeping rotation and translation.
    pub fn se3(&self) -> SE3 {
        SE3 {
            rotation: self.rotation,
            translation: self.translation,
        }
    }

    /// Inverse transformation: p = (1/s) * R⁻¹ * (p' - t).
    pub fn inverse(&self) -> Self {
        let inv_rotation = self.rotation.inverse();
        let inv_scale = 1.0 / self.scale;
        Self {
            rotation: inv_rotation,
            translation: -(inv_rotation * self.translation) * inv_scale,
            scale: inv_scale,
        }
    }

    /// Composition: (self ∘ other)(p) = self(other(p)).
    pub fn compose(&self, other: &Sim3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.scale * (self.rotation * other.translation) + self.translation,
            scale: self.scale * other.scale,
        }
    }

    /// Apply the transformation to a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    /// Rotation as a 3×3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_se3_round_trip_keeps_scale_one() {
        let se3 = SE3::new(
            UnitQuaternion::from_euler_angles(0.1, 0.2, -0.1),
            Vector3::new(1.0, 2.0, 3.0),
        );
        let sim3 = Sim3::from_se3(&se3);
        assert_relative_eq!(sim3.scale, 1.0, epsilon = 1e-12);
        assert_relative_eq!(sim3.se3().translation, se3.translation, epsilon = 1e-12);
    }

    #[test]
    fn test_inverse_round_trip_with_scale() {
        let t = Sim3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.3, 0.1),
            translation: Vector3::new(-1.0, 0.5, 2.0),
            scale: 1.7,
        };
        let p = Vector3::new(0.2, -0.4, 1.5);
        let back = t.inverse().transform_point(&t.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_applies_scales_multiplicatively() {
        let a = Sim3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 2.0,
        };
        let b = Sim3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(1.0, 0.0, 0.0),
            scale: 3.0,
        };
        let c = a.compose(&b);
        assert_relative_eq!(c.scale, 6.0, epsilon = 1e-12);
        assert_relative_eq!(
            c.transform_point(&Vector3::new(1.0, 1.0, 1.0)),
            Vector3::new(8.0, 6.0, 6.0),
            epsilon = 1e-12
        );
    }
}
