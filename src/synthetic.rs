//! Synthetic board data for tests and examples.
//!
//! Deterministic board poses, noise-free projection of board views through a
//! ground-truth camera, and supersampled rendering of chessboard images.
//! The renderer is pinhole-only (no distortion): pixels are inverse-mapped
//! through the board-to-image homography and averaged over a 3x3 subgrid.

use image::{GrayImage, Luma};
use nalgebra::{Isometry3, Matrix3, Rotation3, Translation3, Vector2, Vector3};

use crate::calibration::{CalibrationError, CalibrationView};
use crate::camera::{CameraModel, RadTanModel, Resolution};
use crate::detection::PatternSize;

/// Deterministic board poses with enough rotation diversity for a stable
/// calibration. The board center is placed in front of the camera at a
/// slowly varying offset and depth.
pub fn board_poses(n: usize, pattern: PatternSize, square_size: f64) -> Vec<Isometry3<f64>> {
    let center = Vector3::new(
        (pattern.cols - 1) as f64 * square_size * 0.5,
        (pattern.rows - 1) as f64 * square_size * 0.5,
        0.0,
    );

    (0..n)
        .map(|i| {
            let i = i as f64;
            let rx = 0.28 * (1.7 * i + 0.4).sin();
            let ry = 0.28 * (1.3 * i + 0.9).cos();
            let rz = 0.12 * (0.7 * i).sin();

            let dx = 0.03 * (0.9 * i).sin();
            let dy = 0.025 * (1.1 * i).cos();
            let z = 0.6 + 0.03 * (i % 4.0);

            let rot = Rotation3::from_euler_angles(rx, ry, rz);
            let t = Vector3::new(dx, dy, z) - rot * center;
            Isometry3::from_parts(Translation3::from(t), rot.into())
        })
        .collect()
}

/// Project the board's corner grid through `model` at each pose, producing
/// noise-free calibration views.
pub fn project_board_views(
    model: &RadTanModel,
    poses: &[Isometry3<f64>],
    pattern: PatternSize,
    square_size: f64,
) -> Result<Vec<CalibrationView>, CalibrationError> {
    let object_points = pattern.object_points(square_size);

    let mut views = Vec::with_capacity(poses.len());
    for pose in poses {
        let mut image_points = Vec::with_capacity(object_points.len());
        for obj in &object_points {
            let p_cam = pose.rotation * obj + pose.translation.vector;
            image_points.push(model.project(&p_cam)?);
        }
        views.push(CalibrationView::new(object_points.clone(), image_points)?);
    }
    Ok(views)
}

/// Ideal projections of the corner grid for a single pose; the ground truth
/// the detector is measured against.
pub fn project_corners(
    k: &Matrix3<f64>,
    pose: &Isometry3<f64>,
    pattern: PatternSize,
    square_size: f64,
) -> Vec<Vector2<f64>> {
    pattern
        .object_points(square_size)
        .iter()
        .map(|obj| {
            let p = k * (pose.rotation * obj + pose.translation.vector);
            Vector2::new(p.x / p.z, p.y / p.z)
        })
        .collect()
}

/// Render a chessboard image seen through a distortion-free camera `k` at
/// `pose`. The board carries one extra ring of squares around the inner
/// corner grid; everything beyond it is white. Returns `None` when the
/// board-to-image homography is not invertible.
pub fn render_chessboard(
    k: &Matrix3<f64>,
    resolution: &Resolution,
    pose: &Isometry3<f64>,
    pattern: PatternSize,
    square_size: f64,
) -> Option<GrayImage> {
    // For the z=0 plane, H = K [r1 r2 t]
    let r_binding = pose.rotation.to_rotation_matrix();
    let r_mat = r_binding.matrix();
    let mut h = Matrix3::zeros();
    h.set_column(0, &(k * r_mat.column(0)));
    h.set_column(1, &(k * r_mat.column(1)));
    h.set_column(2, &(k * pose.translation.vector));

    let h_inv = h.try_inverse()?;

    // 3x3 supersampling per pixel
    const SUB: u32 = 3;
    let sub_offsets: Vec<f64> = (0..SUB)
        .map(|s| (s as f64 + 0.5) / SUB as f64 - 0.5)
        .collect();

    let cols = pattern.cols as i64;
    let rows = pattern.rows as i64;

    let image = GrayImage::from_fn(resolution.width, resolution.height, |x, y| {
        let mut acc = 0.0;
        for oy in &sub_offsets {
            for ox in &sub_offsets {
                let p = h_inv * Vector3::new(x as f64 + ox, y as f64 + oy, 1.0);
                let shade = if p.z.abs() < 1e-12 {
                    255.0
                } else {
                    let bx = p.x / p.z;
                    let by = p.y / p.z;
                    let i = (bx / square_size).floor() as i64;
                    let j = (by / square_size).floor() as i64;
                    let on_board = i >= -1 && i < cols && j >= -1 && j < rows;
                    if on_board && (i + j).rem_euclid(2) == 0 {
                        0.0
                    } else {
                        255.0
                    }
                };
                acc += shade;
            }
        }
        Luma([(acc / (SUB * SUB) as f64).round() as u8])
    });

    Some(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Intrinsics;
    use crate::detection::{self, DetectionParams, TermCriteria};

    fn test_camera() -> RadTanModel {
        RadTanModel {
            intrinsics: Intrinsics {
                fx: 520.0,
                fy: 510.0,
                cx: 320.0,
                cy: 240.0,
            },
            resolution: Resolution {
                width: 640,
                height: 480,
            },
            distortions: [0.0; 5],
        }
    }

    #[test]
    fn test_poses_keep_board_in_view() {
        let model = test_camera();
        let pattern = PatternSize { cols: 7, rows: 6 };
        let poses = board_poses(10, pattern, 0.03);
        let views = project_board_views(&model, &poses, pattern, 0.03).unwrap();

        assert_eq!(views.len(), 10);
        for view in &views {
            assert_eq!(view.len(), 42);
            for p in view.image_points() {
                assert!(p.x > 10.0 && p.x < 630.0, "x out of view: {}", p.x);
                assert!(p.y > 10.0 && p.y < 470.0, "y out of view: {}", p.y);
            }
        }
    }

    #[test]
    fn test_rendered_board_matches_projection() {
        let model = test_camera();
        let pattern = PatternSize { cols: 7, rows: 6 };
        let square = 0.03;
        let k = model.intrinsics.to_matrix();
        let pose = board_poses(3, pattern, square)[2];

        let image =
            render_chessboard(&k, &model.resolution, &pose, pattern, square).unwrap();
        let expected = project_corners(&k, &pose, pattern, square);

        let mut corners =
            detection::find_chessboard_corners(&image, pattern, &DetectionParams::default())
                .expect("pattern not found in rendered board");
        detection::refine_corners(&image, &mut corners, 5, TermCriteria::default());

        assert_eq!(corners.len(), expected.len());

        // The detector may return a consistently relabeled grid; match each
        // detected corner to its nearest ground-truth projection instead.
        for corner in &corners {
            let nearest = expected
                .iter()
                .map(|e| (corner - e).norm())
                .fold(f64::INFINITY, f64::min);
            assert!(nearest < 0.5, "corner off by {} px", nearest);
        }
    }

    #[test]
    fn test_render_fills_margin_white() {
        let model = test_camera();
        let pattern = PatternSize { cols: 7, rows: 6 };
        let k = model.intrinsics.to_matrix();
        let pose = board_poses(1, pattern, 0.03)[0];

        let image = render_chessboard(&k, &model.resolution, &pose, pattern, 0.03).unwrap();
        assert_eq!(image.get_pixel(5, 5)[0], 255);
        assert_eq!(image.get_pixel(634, 474)[0], 255);
    }
}
