//! Ring-sample corner response and non-maximum suppression.
//!
//! The response at a pixel compares 8 bilinear samples on a ring around it.
//! At a chessboard corner opposite samples agree and adjacent quadrants
//! alternate, which makes the sum response large and the difference response
//! small; on an edge the signs flip. The score is their difference, so
//! corners score high, edges negative, flat regions near zero.

use image::GrayImage;
use nalgebra::Vector2;

/// Ring radius in pixels.
const RING_RADIUS: f64 = 4.0;

/// Sample offsets at 22.5 + 45k degrees, away from both the axes and the
/// diagonals so moderate board rotations keep samples inside their quadrant.
fn ring_offsets() -> [(f64, f64); 8] {
    let mut offsets = [(0.0, 0.0); 8];
    for (n, offset) in offsets.iter_mut().enumerate() {
        let angle = (22.5 + 45.0 * n as f64).to_radians();
        *offset = (RING_RADIUS * angle.cos(), RING_RADIUS * angle.sin());
    }
    offsets
}

/// Bilinear sample of a grayscale image at a real-valued position.
/// The caller guarantees the position is at least one pixel inside the image.
pub(crate) fn sample_bilinear(image: &GrayImage, x: f64, y: f64) -> f64 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let x0 = x0 as u32;
    let y0 = y0 as u32;

    let p00 = image.get_pixel(x0, y0)[0] as f64;
    let p10 = image.get_pixel(x0 + 1, y0)[0] as f64;
    let p01 = image.get_pixel(x0, y0 + 1)[0] as f64;
    let p11 = image.get_pixel(x0 + 1, y0 + 1)[0] as f64;

    p00 * (1.0 - fx) * (1.0 - fy) + p10 * fx * (1.0 - fy) + p01 * (1.0 - fx) * fy + p11 * fx * fy
}

/// Corner response map of the whole image. Pixels too close to the border
/// for the ring get a zero response.
pub fn response_map(image: &GrayImage) -> Vec<f64> {
    let width = image.width() as usize;
    let height = image.height() as usize;
    let mut map = vec![0.0; width * height];

    let offsets = ring_offsets();
    let margin = RING_RADIUS.ceil() as usize + 1;
    if width <= 2 * margin || height <= 2 * margin {
        return map;
    }

    for y in margin..height - margin {
        for x in margin..width - margin {
            let mut samples = [0.0; 8];
            for (n, (dx, dy)) in offsets.iter().enumerate() {
                samples[n] = sample_bilinear(image, x as f64 + dx, y as f64 + dy);
            }

            let mut sum_response = 0.0;
            let mut diff_response = 0.0;
            for n in 0..4 {
                sum_response +=
                    (samples[n] + samples[n + 4] - samples[(n + 2) % 8] - samples[(n + 6) % 8])
                        .abs();
                diff_response += (samples[n] - samples[n + 4]).abs();
            }

            map[y * width + x] = sum_response - diff_response;
        }
    }

    map
}

/// Local maxima of the response map above `min_response`, greedily thinned
/// so no two kept candidates are within `nms_radius` of each other.
/// Candidates come back strongest first.
pub fn find_candidates(
    map: &[f64],
    width: usize,
    height: usize,
    min_response: f64,
    nms_radius: u32,
) -> Vec<(Vector2<f64>, f64)> {
    let mut maxima: Vec<(usize, usize, f64)> = Vec::new();

    for y in 1..height.saturating_sub(1) {
        for x in 1..width.saturating_sub(1) {
            let r = map[y * width + x];
            if r < min_response {
                continue;
            }
            let mut is_max = true;
            'neigh: for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = (x as i64 + dx) as usize;
                    let ny = (y as i64 + dy) as usize;
                    if map[ny * width + nx] > r {
                        is_max = false;
                        break 'neigh;
                    }
                }
            }
            if is_max {
                maxima.push((x, y, r));
            }
        }
    }

    maxima.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

    let radius2 = (nms_radius as f64).powi(2);
    let mut kept: Vec<(Vector2<f64>, f64)> = Vec::new();
    for (x, y, r) in maxima {
        let p = Vector2::new(x as f64, y as f64);
        let close = kept
            .iter()
            .any(|(q, _)| (p - q).norm_squared() <= radius2);
        if !close {
            kept.push((p, r));
        }
    }

    kept
}
