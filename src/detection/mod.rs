//! Chessboard corner detection.
//!
//! The detector runs three stages: a ring-filter corner response with
//! non-maximum suppression ([`response`]), recovery of the row-major grid
//! structure from the surviving candidates ([`grid`]), and sub-pixel
//! refinement ([`refine`]). A pattern that cannot be found is a `None`,
//! not an error: the caller skips the image and moves on.

use image::GrayImage;
use log::debug;
use nalgebra::{Vector2, Vector3};

pub mod grid;
pub mod refine;
pub mod response;

pub use refine::{refine_corners, TermCriteria};

/// Inner-corner grid dimensions of the chessboard pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternSize {
    /// Corners per row.
    pub cols: u32,
    /// Corners per column.
    pub rows: u32,
}

impl PatternSize {
    /// Total number of inner corners.
    pub fn corner_count(&self) -> usize {
        self.cols as usize * self.rows as usize
    }

    /// The board-frame point set matching a detected corner grid: row-major
    /// points on the z=0 plane, `square_size` apart. Identical for every
    /// image of the same board.
    pub fn object_points(&self, square_size: f64) -> Vec<Vector3<f64>> {
        let mut points = Vec::with_capacity(self.corner_count());
        for r in 0..self.rows {
            for c in 0..self.cols {
                points.push(Vector3::new(
                    c as f64 * square_size,
                    r as f64 * square_size,
                    0.0,
                ));
            }
        }
        points
    }
}

/// Detector tuning knobs.
#[derive(Debug, Clone)]
pub struct DetectionParams {
    /// Minimum ring response for a corner candidate.
    pub min_response: f64,
    /// Non-maximum suppression radius in pixels.
    pub nms_radius: u32,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            min_response: 100.0,
            nms_radius: 5,
        }
    }
}

/// Find the chessboard's inner corners in a grayscale image.
///
/// On success returns exactly `pattern.corner_count()` corners in row-major
/// order, index-aligned with [`PatternSize::object_points`]. Returns `None`
/// when the pattern is not found, for whatever reason: too few corner
/// candidates, or no candidate subset with a consistent grid structure.
///
/// The returned positions are pixel-accurate; run [`refine_corners`] for
/// sub-pixel accuracy.
pub fn find_chessboard_corners(
    image: &GrayImage,
    pattern: PatternSize,
    params: &DetectionParams,
) -> Option<Vec<Vector2<f64>>> {
    let needed = pattern.corner_count();
    if needed == 0 {
        return None;
    }

    let width = image.width() as usize;
    let height = image.height() as usize;

    let map = response::response_map(image);
    let candidates =
        response::find_candidates(&map, width, height, params.min_response, params.nms_radius);

    if candidates.len() < needed {
        debug!(
            "chessboard not found: {} corner candidates, need {}",
            candidates.len(),
            needed
        );
        return None;
    }

    // Candidates are strongest-first; spurious responses rank below the
    // board's own corners.
    let strongest: Vec<Vector2<f64>> = candidates[..needed].iter().map(|(p, _)| *p).collect();

    grid::order_grid(&strongest, pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_points_row_major() {
        let pattern = PatternSize { cols: 7, rows: 6 };
        let points = pattern.object_points(0.025);

        assert_eq!(points.len(), 42);
        assert_eq!(points[0], Vector3::new(0.0, 0.0, 0.0));
        assert_eq!(points[1], Vector3::new(0.025, 0.0, 0.0));
        assert_eq!(points[7], Vector3::new(0.0, 0.025, 0.0));
        assert_eq!(points[41], Vector3::new(6.0 * 0.025, 5.0 * 0.025, 0.0));
        assert!(points.iter().all(|p| p.z == 0.0));
    }

    #[test]
    fn test_no_pattern_in_flat_image() {
        let image = GrayImage::from_pixel(640, 480, image::Luma([200u8]));
        let pattern = PatternSize { cols: 7, rows: 6 };
        assert!(find_chessboard_corners(&image, pattern, &DetectionParams::default()).is_none());
    }

    // Detection on rendered boards is covered in the synthetic module and
    // the end-to-end pipeline tests.
}
