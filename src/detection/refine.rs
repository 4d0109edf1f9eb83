//! Sub-pixel corner refinement.
//!
//! Gradient-orthogonality iteration: for every pixel q in a window around
//! the corner estimate p, the image gradient at q is orthogonal to (q - p)
//! when p sits exactly on the saddle point. Each step solves the weighted
//! normal equations `sum(G) p = sum(G q)` with `G = grad * grad^T` and moves
//! p to the solution, until the shift drops below the termination epsilon.

use image::GrayImage;
use nalgebra::{Matrix2, Vector2};

use crate::detection::response::sample_bilinear;

/// Iteration termination: whichever of the two limits is hit first.
#[derive(Debug, Clone, Copy)]
pub struct TermCriteria {
    pub max_iters: u32,
    pub eps: f64,
}

impl Default for TermCriteria {
    fn default() -> Self {
        Self {
            max_iters: 30,
            eps: 1e-3,
        }
    }
}

/// Refine corner positions in place.
///
/// `half_window` is the half size of the square search window in pixels
/// (a value of 5 inspects an 11x11 neighborhood). Corners whose window
/// leaves the image, or whose gradient structure is degenerate, keep their
/// input position.
pub fn refine_corners(
    image: &GrayImage,
    corners: &mut [Vector2<f64>],
    half_window: u32,
    criteria: TermCriteria,
) {
    for corner in corners.iter_mut() {
        *corner = refine_one(image, *corner, half_window, criteria);
    }
}

fn refine_one(
    image: &GrayImage,
    start: Vector2<f64>,
    half_window: u32,
    criteria: TermCriteria,
) -> Vector2<f64> {
    let width = image.width() as f64;
    let height = image.height() as f64;
    let win = half_window as f64;
    let sigma2 = (win * 0.5).max(1.0).powi(2);

    let mut p = start;

    for _ in 0..criteria.max_iters {
        // The window plus one pixel of gradient support must stay inside
        if p.x - win < 2.0 || p.y - win < 2.0 || p.x + win >= width - 2.0 || p.y + win >= height - 2.0
        {
            return start;
        }

        let mut a = Matrix2::zeros();
        let mut b = Vector2::zeros();

        let steps = (2 * half_window + 1) as i64;
        for wy in 0..steps {
            for wx in 0..steps {
                let dx = wx as f64 - win;
                let dy = wy as f64 - win;
                let qx = p.x + dx;
                let qy = p.y + dy;

                // Central-difference gradient at q
                let gx = (sample_bilinear(image, qx + 1.0, qy)
                    - sample_bilinear(image, qx - 1.0, qy))
                    * 0.5;
                let gy = (sample_bilinear(image, qx, qy + 1.0)
                    - sample_bilinear(image, qx, qy - 1.0))
                    * 0.5;

                let weight = (-(dx * dx + dy * dy) / sigma2).exp();

                let gxx = weight * gx * gx;
                let gxy = weight * gx * gy;
                let gyy = weight * gy * gy;

                a[(0, 0)] += gxx;
                a[(0, 1)] += gxy;
                a[(1, 0)] += gxy;
                a[(1, 1)] += gyy;

                b.x += gxx * qx + gxy * qy;
                b.y += gxy * qx + gyy * qy;
            }
        }

        let solved = match a.try_inverse() {
            Some(a_inv) => a_inv * b,
            None => return p,
        };

        let shift = solved - p;
        // A large jump means the window caught a neighboring structure
        if shift.norm() > win {
            return start;
        }
        p = solved;
        if shift.norm() < criteria.eps {
            break;
        }
    }

    p
}
