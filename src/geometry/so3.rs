//! SO(3) helpers shared by the two-view initializer and the optimizers.

use nalgebra::{Matrix3, Vector3};

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Closest rotation matrix (Frobenius norm) to an arbitrary 3x3 matrix.
///
/// Returns `None` when the SVD does not produce both factors.
pub fn nearest_rotation(m: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = m.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut d = Matrix3::identity();
        d[(2, 2)] = -1.0;
        r = u * d * v_t;
    }
    Some(r)
}
