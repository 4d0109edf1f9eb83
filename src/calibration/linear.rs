//! Closed-form calibration initialization.
//!
//! Normalized DLT homography estimation, Zhang's closed-form intrinsics from
//! a set of plane homographies, and planar pose decomposition. Together these
//! produce the starting point the nonlinear refinement polishes.

use nalgebra::{
    DMatrix, Isometry3, Matrix3, Rotation3, Translation3, UnitQuaternion, Vector2, Vector3,
};

use crate::calibration::CalibrationError;
use crate::camera::Intrinsics;

/// Hartley normalization: zero-mean, average distance sqrt(2).
///
/// Returns the normalized points and the similarity transform `T` with
/// `p_norm = T p`. `None` when the points are (near) coincident.
fn normalize_points(points: &[Vector2<f64>]) -> Option<(Vec<Vector2<f64>>, Matrix3<f64>)> {
    if points.is_empty() {
        return None;
    }

    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;

    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    if mean_dist < 1e-12 {
        return None;
    }

    let scale = std::f64::consts::SQRT_2 / mean_dist;
    let transform = Matrix3::new(
        scale,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        -scale * centroid.y,
        0.0,
        0.0,
        1.0,
    );

    let normalized = points.iter().map(|p| (p - centroid) * scale).collect();
    Some((normalized, transform))
}

/// Estimate a homography `H` such that `x' ~ H x` using the normalized DLT.
///
/// `world` are planar board points (x, y of the z=0 grid), `image` are their
/// pixel coordinates. The result is scaled so that `H[2,2] == 1`.
pub fn dlt_homography(
    world: &[Vector2<f64>],
    image: &[Vector2<f64>],
) -> Result<Matrix3<f64>, CalibrationError> {
    let n = world.len();
    if n < 4 || image.len() != n {
        return Err(CalibrationError::DegenerateGeometry(format!(
            "need at least 4 point correspondences, got {}",
            n
        )));
    }

    let (world_n, t_w) = normalize_points(world).ok_or_else(|| {
        CalibrationError::DegenerateGeometry("coincident board points".to_string())
    })?;
    let (image_n, t_i) = normalize_points(image).ok_or_else(|| {
        CalibrationError::DegenerateGeometry("coincident image points".to_string())
    })?;

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);

    for (i, (pw, pi)) in world_n.iter().zip(image_n.iter()).enumerate() {
        let x = pw.x;
        let y = pw.y;
        let u = pi.x;
        let v = pi.y;

        let r0 = 2 * i;
        let r1 = 2 * i + 1;

        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let h_vec = smallest_singular_vector(a)?;

    let mut h_mat = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            h_mat[(r, c)] = h_vec[3 * r + c];
        }
    }

    let t_i_inv = t_i.try_inverse().ok_or_else(|| {
        CalibrationError::NumericalFailure("normalization transform not invertible".to_string())
    })?;
    h_mat = t_i_inv * h_mat * t_w;

    // normalise such that H[2,2] = 1
    let scale = h_mat[(2, 2)];
    if scale.abs() > f64::EPSILON {
        h_mat /= scale;
    }

    Ok(h_mat)
}

/// Solve `A x = 0`: the right singular vector of the smallest singular value.
/// Pads `A` with zero rows when underdetermined so the SVD exposes a full V.
fn smallest_singular_vector(a: DMatrix<f64>) -> Result<Vec<f64>, CalibrationError> {
    let mut a_work = a;
    if a_work.nrows() < a_work.ncols() {
        let rows = a_work.nrows();
        let cols = a_work.ncols();
        let mut a_pad = DMatrix::<f64>::zeros(cols, cols);
        a_pad.view_mut((0, 0), (rows, cols)).copy_from(&a_work);
        a_work = a_pad;
    }

    let svd = a_work.svd(true, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| CalibrationError::NumericalFailure("svd failed".to_string()))?;
    let row = v_t.row(v_t.nrows() - 1);
    Ok(row.iter().copied().collect())
}

/// Build the 6-vector v_ij(H) of Zhang's method.
fn v_ij(hmtx: &Matrix3<f64>, i: usize, j: usize) -> nalgebra::SVector<f64, 6> {
    let hi = hmtx.column(i);
    let hj = hmtx.column(j);

    nalgebra::SVector::<f64, 6>::from_row_slice(&[
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    ])
}

/// Estimate camera intrinsics from plane homographies using Zhang's
/// closed-form solution (no distortion, zero skew assumed downstream).
///
/// Requires at least 3 homographies for a stable solution.
pub fn intrinsics_from_homographies(
    hmtxs: &[Matrix3<f64>],
) -> Result<Intrinsics, CalibrationError> {
    if hmtxs.len() < 3 {
        return Err(CalibrationError::InsufficientData {
            views: hmtxs.len(),
            required: 3,
        });
    }

    let m = hmtxs.len();
    let mut vmtx = DMatrix::<f64>::zeros(2 * m, 6);

    for (k, hmtx) in hmtxs.iter().enumerate() {
        let v11 = v_ij(hmtx, 0, 0);
        let v22 = v_ij(hmtx, 1, 1);
        let v12 = v_ij(hmtx, 0, 1);

        vmtx.row_mut(2 * k).copy_from(&v12.transpose());
        vmtx.row_mut(2 * k + 1).copy_from(&(v11 - v22).transpose());
    }

    let b_vec = smallest_singular_vector(vmtx)?;

    // The sign of the null vector is arbitrary; B must be positive definite.
    let flip = if b_vec[0] < 0.0 { -1.0 } else { 1.0 };
    let b11 = flip * b_vec[0];
    let b12 = flip * b_vec[1];
    let b22 = flip * b_vec[2];
    let b13 = flip * b_vec[3];
    let b23 = flip * b_vec[4];
    let b33 = flip * b_vec[5];

    // From Zhang's paper:
    //
    // v0 = (B12 B13 - B11 B23) / (B11 B22 - B12^2)
    // λ  = B33 - (B13^2 + v0 (B12 B13 - B11 B23)) / B11
    // α  = sqrt(λ / B11)
    // β  = sqrt(λ B11 / (B11 B22 - B12^2))
    // γ  = -B12 α^2 β / λ
    // u0 = γ v0 / β - B13 α^2 / λ

    let denom = b11 * b22 - b12 * b12;
    let denom_norm = b11 * b11 + b22 * b22;
    let denom_rel = if denom_norm > 0.0 {
        denom.abs() / denom_norm
    } else {
        0.0
    };
    if denom_rel < 1e-10 {
        return Err(CalibrationError::DegenerateGeometry(
            "degenerate configuration in intrinsics estimation".to_string(),
        ));
    }

    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;

    if lambda / b11 <= 0.0 {
        return Err(CalibrationError::DegenerateGeometry(
            "invalid sign for lambda in intrinsics estimation".to_string(),
        ));
    }

    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / denom).sqrt();

    if !alpha.is_finite() || !beta.is_finite() {
        return Err(CalibrationError::NumericalFailure(
            "non-finite focal length estimate".to_string(),
        ));
    }

    let gamma = -b12 * alpha * alpha * beta / lambda;
    let u0 = gamma * v0 / beta - b13 * alpha * alpha / lambda;

    // Skew is dropped: the camera model is zero-skew and the refinement
    // absorbs any residual.
    Ok(Intrinsics {
        fx: alpha,
        fy: beta,
        cx: u0,
        cy: v0,
    })
}

/// Decompose a plane-to-image homography into a board-to-camera pose,
/// assuming the board lies on `Z = 0` in its own coordinates.
///
/// The rotation is projected onto SO(3) via polar decomposition; the
/// translation is scaled so the first two rotation columns have unit norm.
pub fn pose_from_homography(
    kmtx: &Matrix3<f64>,
    hmtx: &Matrix3<f64>,
) -> Result<Isometry3<f64>, CalibrationError> {
    let k_inv = kmtx.try_inverse().ok_or_else(|| {
        CalibrationError::NumericalFailure("intrinsics matrix is not invertible".to_string())
    })?;

    let h1 = hmtx.column(0);
    let h2 = hmtx.column(1);
    let h3 = hmtx.column(2).into_owned();

    let k_inv_h1 = k_inv * h1;
    let k_inv_h2 = k_inv * h2;

    // Scale factor: normalize first two columns (average for robustness)
    let norm1 = k_inv_h1.norm();
    let norm2 = k_inv_h2.norm();
    if norm1 <= 1e-12 || norm2 <= 1e-12 {
        return Err(CalibrationError::DegenerateGeometry(
            "degenerate homography for planar pose extraction".to_string(),
        ));
    }
    let lambda = 2.0 / (norm1 + norm2);

    let mut r1 = (lambda * k_inv_h1).into_owned();
    let mut r2 = (lambda * k_inv_h2).into_owned();
    let mut t_vec: Vector3<f64> = (lambda * (k_inv * h3)).into_owned();
    // The board must be in front of the camera
    if t_vec.z < 0.0 {
        r1 = -r1;
        r2 = -r2;
        t_vec = -t_vec;
    }
    let r3 = r1.cross(&r2);
    if r3.norm() <= 1e-12 {
        return Err(CalibrationError::DegenerateGeometry(
            "degenerate homography for planar pose extraction".to_string(),
        ));
    }

    let mut r_mat = Matrix3::<f64>::zeros();
    r_mat.set_column(0, &r1);
    r_mat.set_column(1, &r2);
    r_mat.set_column(2, &r3);

    // Project onto SO(3) (polar decomposition via SVD)
    let svd = r_mat.svd(true, true);
    let u = svd.u.ok_or_else(|| {
        CalibrationError::NumericalFailure("svd failed during planar pose extraction".to_string())
    })?;
    let v_t = svd.v_t.ok_or_else(|| {
        CalibrationError::NumericalFailure("svd failed during planar pose extraction".to_string())
    })?;
    let r_orth = u * v_t;

    // Ensure det(R) > 0
    let r_orth = if r_orth.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        u_flipped * v_t
    } else {
        r_orth
    };

    let rot = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r_orth));
    Ok(Isometry3::from_parts(Translation3::from(t_vec), rot))
}
