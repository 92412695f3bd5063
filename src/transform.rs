//! Homogeneous 4x4 transform helpers.
//!
//! All matrices are column-major [`Mat4`]s in a right-handed coordinate
//! system, angles are in radians. The projection builders follow the OpenGL
//! clip-space convention (z in `[-1, 1]`), which is what the ray casting
//! kernels unproject against.

use glam::{Mat4, Vec3};
use thiserror::Error;

/// Determinants with a magnitude below this are treated as singular.
pub const SINGULAR_EPSILON: f32 = 1e-8;

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum TransformError {
    #[error("Matrix is singular (determinant {determinant})")]
    SingularMatrix { determinant: f32 },
}

pub fn identity() -> Mat4 {
    Mat4::IDENTITY
}

pub fn scale(sx: f32, sy: f32, sz: f32) -> Mat4 {
    Mat4::from_scale(Vec3::new(sx, sy, sz))
}

pub fn translate(x: f32, y: f32, z: f32) -> Mat4 {
    Mat4::from_translation(Vec3::new(x, y, z))
}

pub fn rotate_x(angle: f32) -> Mat4 {
    Mat4::from_rotation_x(angle)
}

pub fn rotate_y(angle: f32) -> Mat4 {
    Mat4::from_rotation_y(angle)
}

pub fn rotate_z(angle: f32) -> Mat4 {
    Mat4::from_rotation_z(angle)
}

/// Rotation around an arbitrary axis. The axis does not need to be normalized
/// but must not be zero; a zero axis yields the identity.
pub fn rotate_axis(axis: Vec3, angle: f32) -> Mat4 {
    match axis.try_normalize() {
        Some(axis) => Mat4::from_axis_angle(axis, angle),
        None => Mat4::IDENTITY,
    }
}

/// Perspective projection with a vertical field of view `fov_y`.
pub fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    Mat4::perspective_rh_gl(fov_y, aspect, near, far)
}

pub fn orthographic(left: f32, right: f32, bottom: f32, top: f32, near: f32, far: f32) -> Mat4 {
    Mat4::orthographic_rh_gl(left, right, bottom, top, near, far)
}

/// `a × b`, i.e. `b` is applied first.
pub fn multiply(a: &Mat4, b: &Mat4) -> Mat4 {
    *a * *b
}

/// Inverts `m`, refusing matrices whose determinant is within
/// [`SINGULAR_EPSILON`] of zero.
pub fn invert(m: &Mat4) -> Result<Mat4, TransformError> {
    let determinant = m.determinant();
    if !determinant.is_finite() || determinant.abs() < SINGULAR_EPSILON {
        return Err(TransformError::SingularMatrix { determinant });
    }
    Ok(m.inverse())
}

/// Transposes `m` and drops the last row, giving the row-major 3x4 matrix the
/// orthographic projection kernels consume.
pub fn truncate_transposed(m: &Mat4) -> [f32; 12] {
    // Rows of the transpose are the columns of `m`.
    let mut out = [0.0; 12];
    for (row, column) in [m.x_axis, m.y_axis, m.z_axis].iter().enumerate() {
        out[row * 4..row * 4 + 4].copy_from_slice(&column.to_array());
    }
    out
}

/// Row-major flattening of `m` for the kernels.
pub fn to_kernel_array(m: &Mat4) -> [f32; 16] {
    m.transpose().to_cols_array()
}

pub fn approx_eq(a: &Mat4, b: &Mat4, eps: f32) -> bool {
    a.abs_diff_eq(*b, eps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;
    use proptest::prelude::*;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn test_rotate_x_quarter_turn() {
        let m = rotate_x(FRAC_PI_2);
        let p = m * Vec4::new(0.0, 1.0, 0.0, 1.0);
        assert!(p.abs_diff_eq(Vec4::new(0.0, 0.0, 1.0, 1.0), 1e-6));
    }

    #[test]
    fn test_multiply_applies_right_operand_first() {
        let m = multiply(&translate(1.0, 0.0, 0.0), &scale(2.0, 2.0, 2.0));
        let p = m * Vec4::new(1.0, 1.0, 1.0, 1.0);
        assert!(p.abs_diff_eq(Vec4::new(3.0, 2.0, 2.0, 1.0), 1e-6));
    }

    #[test]
    fn test_invert_zero_scale_is_singular() {
        let result = invert(&scale(1.0, 0.0, 1.0));
        assert!(matches!(result, Err(TransformError::SingularMatrix { .. })));
    }

    #[test]
    fn test_rotate_axis_zero_axis() {
        assert_eq!(rotate_axis(Vec3::ZERO, 1.0), Mat4::IDENTITY);
    }

    #[test]
    fn test_truncate_transposed_layout() {
        let m = translate(1.0, 2.0, 3.0);
        let t = truncate_transposed(&m);
        // The translation ends up in the bottom row of the transpose, which
        // is the row being dropped.
        assert_eq!(t, [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_to_kernel_array_is_row_major() {
        let m = translate(1.0, 2.0, 3.0);
        let a = to_kernel_array(&m);
        assert_eq!(a[3], 1.0);
        assert_eq!(a[7], 2.0);
        assert_eq!(a[11], 3.0);
        assert_eq!(a[15], 1.0);
    }

    #[test]
    fn test_perspective_round_trip() {
        let m = multiply(
            &perspective(1.0, 1.0, 0.1, 10.0),
            &multiply(&translate(0.0, 0.0, -4.0), &rotate_y(0.3)),
        );
        let inv = invert(&m).expect("perspective view should be invertible");
        assert!(approx_eq(&(inv * m), &Mat4::IDENTITY, 1e-4));
    }

    #[test]
    fn test_orthographic_maps_box_to_clip_cube() {
        let m = orthographic(-2.0, 2.0, -1.0, 1.0, 0.5, 4.5);
        let corner = m * Vec4::new(2.0, -1.0, -4.5, 1.0);
        assert!(corner.abs_diff_eq(Vec4::new(1.0, -1.0, 1.0, 1.0), 1e-6));
        let near = m * Vec4::new(-2.0, 1.0, -0.5, 1.0);
        assert!(near.abs_diff_eq(Vec4::new(-1.0, 1.0, -1.0, 1.0), 1e-6));
    }

    proptest! {
        #[test]
        fn prop_invert_projected_view_is_identity(
            ay in -3.2f32..3.2,
            s in 0.2f32..4.0,
            half_width in 0.5f32..4.0,
            tz in -8.0f32..-2.0,
        ) {
            let modelview = multiply(&translate(0.0, 0.0, tz), &multiply(&rotate_y(ay), &scale(s, s, s)));
            let m = multiply(
                &orthographic(-half_width, half_width, -1.0, 1.0, 0.1, 20.0),
                &modelview,
            );
            let inv = invert(&m).expect("orthographic view should be invertible");
            prop_assert!(approx_eq(&(inv * m), &Mat4::IDENTITY, 1e-3));
        }

        #[test]
        fn prop_invert_times_matrix_is_identity(
            ax in -3.2f32..3.2,
            ay in -3.2f32..3.2,
            az in -3.2f32..3.2,
            s in 0.2f32..4.0,
            tx in -5.0f32..5.0,
            tz in -5.0f32..5.0,
        ) {
            let m = multiply(
                &translate(tx, 0.0, tz),
                &multiply(
                    &rotate_z(az),
                    &multiply(&rotate_y(ay), &multiply(&rotate_x(ax), &scale(s, s * 0.5, s))),
                ),
            );
            let inv = invert(&m).expect("non-degenerate transform");
            prop_assert!(approx_eq(&(inv * m), &Mat4::IDENTITY, 1e-3));
        }
    }
}
