//! Recovery of the row-major grid structure from unordered corner candidates.
//!
//! Candidates are projected onto the principal axes of their scatter, split
//! into rows along the secondary axis and sorted along the primary axis
//! within each row. Both row/column assignments are tried; a candidate
//! ordering is accepted only when a board-to-image homography reproduces it
//! with a small residual.

use log::debug;
use nalgebra::{Matrix2, Vector2};

use crate::calibration::linear::dlt_homography;
use crate::detection::PatternSize;

/// Mean homography residual (pixels) above which an ordering is rejected.
const MAX_MEAN_RESIDUAL: f64 = 2.0;

/// Order `points` into a row-major `pattern.rows` x `pattern.cols` grid.
///
/// Returns `None` when no consistent grid structure is found. The 180-degree
/// (and, for square patterns, 90-degree) labeling ambiguity is left as is:
/// any consistent relabeling corresponds to a different but equally valid
/// board pose.
pub fn order_grid(points: &[Vector2<f64>], pattern: PatternSize) -> Option<Vec<Vector2<f64>>> {
    let needed = pattern.corner_count();
    if points.len() != needed {
        return None;
    }

    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;

    // Principal axes of the candidate scatter
    let mut cov = Matrix2::zeros();
    for p in points {
        let d = p - centroid;
        let dt = d.transpose();
        cov += d * dt;
    }
    cov /= n;

    let eigen = cov.symmetric_eigen();
    let (major_idx, minor_idx) = if eigen.eigenvalues[0] >= eigen.eigenvalues[1] {
        (0, 1)
    } else {
        (1, 0)
    };
    let major = eigen.eigenvectors.column(major_idx).into_owned();
    let minor = eigen.eigenvectors.column(minor_idx).into_owned();

    // Coordinates of each point in the principal frame
    let coords: Vec<(f64, f64)> = points
        .iter()
        .map(|p| {
            let d = p - centroid;
            (d.dot(&major), d.dot(&minor))
        })
        .collect();

    // The grid's row direction usually aligns with one principal axis, but
    // foreshortening can make either one the minor axis, so rows are chunked
    // along each axis in turn. The output shape is always rows x cols: the
    // caller pairs it index for index with the board's object point grid.
    for swap_axes in [false, true] {
        if let Some(ordered) = try_ordering(
            points,
            &coords,
            pattern.rows as usize,
            pattern.cols as usize,
            swap_axes,
        ) {
            return Some(ordered);
        }
    }

    debug!("no consistent grid ordering for {} candidates", points.len());
    None
}

/// Chunk the points into `rows` runs of `cols` along one principal axis
/// (`swap_axes` picks which), sort each run along the other, and keep the
/// result only if a homography from the ideal grid fits it tightly.
fn try_ordering(
    points: &[Vector2<f64>],
    coords: &[(f64, f64)],
    rows: usize,
    cols: usize,
    swap_axes: bool,
) -> Option<Vec<Vector2<f64>>> {
    let across = |i: usize| if swap_axes { coords[i].0 } else { coords[i].1 };
    let along = |i: usize| if swap_axes { coords[i].1 } else { coords[i].0 };

    let mut indices: Vec<usize> = (0..points.len()).collect();
    indices.sort_by(|&a, &b| {
        across(a)
            .partial_cmp(&across(b))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut ordered = Vec::with_capacity(points.len());
    for row_chunk in indices.chunks(cols) {
        if row_chunk.len() != cols {
            return None;
        }
        let mut row: Vec<usize> = row_chunk.to_vec();
        row.sort_by(|&a, &b| {
            along(a)
                .partial_cmp(&along(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for idx in row {
            ordered.push(points[idx]);
        }
    }

    // Validate: an ideal unit grid must map onto the ordering
    let mut board = Vec::with_capacity(points.len());
    for r in 0..rows {
        for c in 0..cols {
            board.push(Vector2::new(c as f64, r as f64));
        }
    }

    let h = dlt_homography(&board, &ordered).ok()?;

    let mut total_residual = 0.0;
    for (b, img) in board.iter().zip(ordered.iter()) {
        let p = h * nalgebra::Vector3::new(b.x, b.y, 1.0);
        if p.z.abs() < 1e-12 {
            return None;
        }
        let projected = Vector2::new(p.x / p.z, p.y / p.z);
        total_residual += (projected - img).norm();
    }
    let mean_residual = total_residual / points.len() as f64;

    if mean_residual > MAX_MEAN_RESIDUAL {
        debug!(
            "grid ordering rejected, mean homography residual {:.2} px",
            mean_residual
        );
        return None;
    }

    Some(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern() -> PatternSize {
        PatternSize { cols: 7, rows: 6 }
    }

    /// A mildly rotated, perspective-free grid with shuffled point order.
    fn scrambled_grid(angle: f64) -> (Vec<Vector2<f64>>, Vec<Vector2<f64>>) {
        let p = pattern();
        let (sin, cos) = angle.sin_cos();
        let mut expected = Vec::new();
        for r in 0..p.rows {
            for c in 0..p.cols {
                let x = 100.0 + 30.0 * c as f64;
                let y = 80.0 + 30.0 * r as f64;
                expected.push(Vector2::new(
                    cos * x - sin * y + 50.0,
                    sin * x + cos * y + 20.0,
                ));
            }
        }

        // Deterministic shuffle
        let mut scrambled = expected.clone();
        scrambled.reverse();
        scrambled.swap(3, 27);
        scrambled.swap(11, 40);
        (scrambled, expected)
    }

    #[test]
    fn test_orders_axis_aligned_grid() {
        let (scrambled, expected) = scrambled_grid(0.0);
        let ordered = order_grid(&scrambled, pattern()).unwrap();

        // Accept the expected order or its 180-degree relabeling
        let reversed: Vec<_> = expected.iter().rev().cloned().collect();
        let matches_forward = ordered
            .iter()
            .zip(expected.iter())
            .all(|(a, b)| (a - b).norm() < 1e-9);
        let matches_reversed = ordered
            .iter()
            .zip(reversed.iter())
            .all(|(a, b)| (a - b).norm() < 1e-9);
        assert!(matches_forward || matches_reversed);
    }

    #[test]
    fn test_orders_rotated_grid() {
        let (scrambled, _) = scrambled_grid(0.15);
        let ordered = order_grid(&scrambled, pattern()).unwrap();

        // Consecutive points within a row must be evenly spaced
        let p = pattern();
        for r in 0..p.rows as usize {
            for c in 1..p.cols as usize {
                let a = ordered[r * p.cols as usize + c - 1];
                let b = ordered[r * p.cols as usize + c];
                let gap = (b - a).norm();
                assert!((gap - 30.0).abs() < 1e-6, "uneven gap {}", gap);
            }
        }
    }

    #[test]
    fn test_orders_foreshortened_grid_row_major() {
        // The 7-corner direction is compressed to 20 px spacing while the
        // 6-corner direction spans 40 px, so the principal axes no longer
        // follow the longer grid side. The ordering must still come back as
        // 6 rows of 7, aligned with the board's object point grid.
        let p = pattern();
        let mut expected = Vec::new();
        for r in 0..p.rows {
            for c in 0..p.cols {
                expected.push(Vector2::new(
                    120.0 + 20.0 * c as f64,
                    60.0 + 40.0 * r as f64,
                ));
            }
        }

        let mut scrambled = expected.clone();
        scrambled.reverse();
        scrambled.swap(5, 31);
        scrambled.swap(17, 38);

        let ordered = order_grid(&scrambled, p).unwrap();

        // Neighbors within a row sit 20 px apart, rows 40 px apart; a
        // transposed ordering would show 40 px gaps inside a row.
        for r in 0..p.rows as usize {
            for c in 1..p.cols as usize {
                let a = ordered[r * p.cols as usize + c - 1];
                let b = ordered[r * p.cols as usize + c];
                let gap = (b - a).norm();
                assert!(
                    (gap - 20.0).abs() < 1e-6,
                    "row {} col {}: gap {} px, expected 20",
                    r,
                    c,
                    gap
                );
            }
        }
        for r in 1..p.rows as usize {
            let a = ordered[(r - 1) * p.cols as usize];
            let b = ordered[r * p.cols as usize];
            let gap = (b - a).norm();
            assert!((gap - 40.0).abs() < 1e-6, "row gap {} px, expected 40", gap);
        }
    }

    #[test]
    fn test_rejects_wrong_count() {
        let (mut scrambled, _) = scrambled_grid(0.0);
        scrambled.pop();
        assert!(order_grid(&scrambled, pattern()).is_none());
    }

    #[test]
    fn test_rejects_structureless_points() {
        // Points on a circle: right count, no grid structure
        let p = pattern();
        let n = p.corner_count();
        let points: Vec<Vector2<f64>> = (0..n)
            .map(|i| {
                let a = i as f64 / n as f64 * std::f64::consts::TAU;
                Vector2::new(200.0 + 90.0 * a.cos(), 200.0 + 90.0 * a.sin())
            })
            .collect();
        assert!(order_grid(&points, p).is_none());
    }
}
