//! Pinhole camera intrinsics with cached inverses.

use nalgebra::{Matrix3, Vector2, Vector3};

/// Pinhole intrinsics (fx, fy, cx, cy) and the inverse mapping.
///
/// The inverse coefficients are cached because unprojection runs once per
/// pixel in the propagation and stereo sweeps.
#[derive(Debug, Clone, Copy)]
pub struct CameraModel {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    pub fxi: f32,
    pub fyi: f32,
    pub cxi: f32,
    pub cyi: f32,
}

impl CameraModel {
    pub fn new(fx: f32, fy: f32, cx: f32, cy: f32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            fxi: 1.0 / fx,
            fyi: 1.0 / fy,
            cxi: -cx / fx,
            cyi: -cy / fy,
        }
    }

    /// The intrinsic matrix K.
    #[rustfmt::skip]
    pub fn matrix(&self) -> Matrix3<f32> {
        Matrix3::new(
            self.fx, 0.0,     self.cx,
            0.0,     self.fy, self.cy,
            0.0,     0.0,     1.0,
        )
    }

    /// Back-project a pixel to the ray K⁻¹ · (x, y, 1).
    #[inline]
    pub fn unproject(&self, x: f32, y: f32) -> Vector3<f32> {
        Vector3::new(x * self.fxi + self.cxi, y * self.fyi + self.cyi, 1.0)
    }

    /// Perspective projection of a camera-frame point onto the image.
    #[inline]
    pub fn project(&self, p: &Vector3<f32>) -> Vector2<f32> {
        Vector2::new(
            self.fx * p.x / p.z + self.cx,
            self.fy * p.y / p.z + self.cy,
        )
    }
}

/// Dehomogenize a point already expressed in pixel-scaled coordinates,
/// i.e. a product K · p: returns (v.x / v.z, v.y / v.z).
#[inline]
pub fn homogeneous_projection(v: &Vector3<f32>) -> Vector2<f32> {
    Vector2::new(v.x / v.z, v.y / v.z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_project_unproject_round_trip() {
        let cam = CameraModel::new(100.0, 100.0, 32.0, 32.0);
        let pixel = (40.0, 27.0);
        let ray = cam.unproject(pixel.0, pixel.1);
        let back = cam.project(&(ray * 2.5));
        assert_relative_eq!(back.x, pixel.0, epsilon = 1e-4);
        assert_relative_eq!(back.y, pixel.1, epsilon = 1e-4);
    }

    #[test]
    fn test_principal_point_maps_to_optical_axis() {
        let cam = CameraModel::new(250.0, 260.0, 320.0, 240.0);
        let ray = cam.unproject(320.0, 240.0);
        assert_relative_eq!(ray.x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(ray.y, 0.0, epsilon = 1e-6);
    }
}
