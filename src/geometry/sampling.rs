//! Subpixel bilinear sampling of intensity and gradient buffers.

use nalgebra::Vector2;

/// Bilinear interpolation of a scalar image at a subpixel position.
///
/// Reads the 2×2 neighbourhood of `point`; the caller guarantees the
/// position lies at least one pixel inside the image.
#[inline]
pub fn interpolate(image: &[f32], point: &Vector2<f32>, width: usize) -> f32 {
    let ix = point.x as usize;
    let iy = point.y as usize;
    let dx = point.x - ix as f32;
    let dy = point.y - iy as f32;
    let dxdy = dx * dy;
    let idx = ix + iy * width;

    dxdy * image[idx + 1 + width]
        + (dy - dxdy) * image[idx + width]
        + (dx - dxdy) * image[idx + 1]
        + (1.0 - dx - dy + dxdy) * image[idx]
}

/// Bilinear interpolation of a two-channel gradient buffer, returning the
/// interpolated (gx, gy).
#[inline]
pub fn interpolate_gradient(
    gradients: &[[f32; 2]],
    point: &Vector2<f32>,
    width: usize,
) -> Vector2<f32> {
    let ix = point.x as usize;
    let iy = point.y as usize;
    let dx = point.x - ix as f32;
    let dy = point.y - iy as f32;
    let dxdy = dx * dy;
    let idx = ix + iy * width;

    let w00 = 1.0 - dx - dy + dxdy;
    let w10 = dx - dxdy;
    let w01 = dy - dxdy;
    let w11 = dxdy;

    let g00 = gradients[idx];
    let g10 = gradients[idx + 1];
    let g01 = gradients[idx + width];
    let g11 = gradients[idx + 1 + width];

    Vector2::new(
        w00 * g00[0] + w10 * g10[0] + w01 * g01[0] + w11 * g11[0],
        w00 * g00[1] + w10 * g10[1] + w01 * g01[1] + w11 * g11[1],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_interpolate_at_integer_position_is_exact() {
        let image = vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let v = interpolate(&image, &Vector2::new(1.0, 1.0), 3);
        assert_relative_eq!(v, 4.0, epsilon = 1e-6);
    }

    #[test]
    fn test_interpolate_is_linear_between_neighbours() {
        #[rustfmt::skip]
        let image = vec![
            0.0, 10.0, 20.0,
            0.0, 10.0, 20.0,
            0.0, 10.0, 20.0,
        ];
        let v = interpolate(&image, &Vector2::new(0.25, 1.0), 3);
        assert_relative_eq!(v, 2.5, epsilon = 1e-5);
    }

    #[test]
    fn test_interpolate_gradient_blends_channels() {
        let gradients = vec![[1.0, -1.0]; 9];
        let g = interpolate_gradient(&gradients, &Vector2::new(0.5, 0.5), 3);
        assert_relative_eq!(g.x, 1.0, epsilon = 1e-6);
        assert_relative_eq!(g.y, -1.0, epsilon = 1e-6);
    }
}
