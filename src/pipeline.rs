//! The end-to-end calibration procedure.
//!
//! One synchronous pass: enumerate images, detect and refine corners per
//! image (skipping images without a detectable pattern), calibrate, write
//! the coefficients file, reload it to verify the round trip, and report
//! the mean reprojection error computed from the reloaded coefficients.

use log::{debug, info, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::calibration::{
    calibrate, mean_reprojection_error, per_view_reprojection_errors, CalibrationError,
    CalibrationOptions, CalibrationView, ViewSummary,
};
use crate::camera::{CameraModelError, RadTanModel, Resolution};
use crate::detection::{
    find_chessboard_corners, refine_corners, DetectionParams, PatternSize, TermCriteria,
};
use crate::storage::{load_coefficients, save_coefficients, StorageError};

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("Cannot read image directory {path}: {source}")]
    ImageDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Image resolution mismatch: {path} is {got:?}, expected {expected:?}")]
    ResolutionMismatch {
        path: String,
        got: Resolution,
        expected: Resolution,
    },
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Camera(#[from] CameraModelError),
}

/// Everything the procedure needs, as explicit configuration.
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    /// Inner-corner grid of the printed board.
    pub pattern: PatternSize,
    /// Side length of one board square, in the caller's length unit.
    pub square_size: f64,
    /// Directory holding the calibration images.
    pub image_dir: PathBuf,
    /// Accepted file extensions, lowercase without the dot.
    pub extensions: Vec<String>,
    /// Where the coefficients file is written.
    pub output_path: PathBuf,
    /// Corner detector tuning.
    pub detection: DetectionParams,
    /// Half size of the sub-pixel refinement window.
    pub refine_window: u32,
    /// Sub-pixel refinement termination.
    pub criteria: TermCriteria,
    /// Solver options.
    pub options: CalibrationOptions,
}

impl CalibrationConfig {
    /// Configuration with the conventional defaults: 11x11 refinement
    /// window, 30-iteration / 1e-3 termination, jpg and png inputs.
    pub fn new(
        pattern: PatternSize,
        square_size: f64,
        image_dir: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pattern,
            square_size,
            image_dir: image_dir.into(),
            extensions: vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()],
            output_path: output_path.into(),
            detection: DetectionParams::default(),
            refine_window: 5,
            criteria: TermCriteria::default(),
            options: CalibrationOptions::default(),
        }
    }
}

/// Outcome of a calibration run.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationReport {
    /// The calibrated camera, rebuilt from the reloaded coefficients.
    pub model: RadTanModel,
    /// Number of images that contributed a view.
    pub views_used: usize,
    /// Number of images skipped (undetected pattern or unreadable file).
    pub images_skipped: usize,
    /// Per-view point counts and reprojection errors, in input order.
    pub per_view: Vec<ViewSummary>,
    /// Mean of the per-view reprojection errors, in pixels.
    pub mean_error: f64,
}

/// Matching image files in `dir`, sorted by file name.
fn list_images(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>, PipelineError> {
    let entries = fs::read_dir(dir).map_err(|source| PipelineError::ImageDir {
        path: dir.display().to_string(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
                .unwrap_or(false)
        })
        .collect();

    files.sort();
    Ok(files)
}

/// Run the full calibration procedure described by `config`.
///
/// # Errors
///
/// Fails with [`CalibrationError::InsufficientData`] (wrapped) when fewer
/// than 3 images yield a detected pattern, including the zero-image case;
/// with a [`StorageError`] when the coefficients file cannot be written or
/// read back; and with [`PipelineError::ResolutionMismatch`] when the input
/// images disagree on resolution.
pub fn run_calibration(config: &CalibrationConfig) -> Result<CalibrationReport, PipelineError> {
    let files = list_images(&config.image_dir, &config.extensions)?;
    info!(
        "Found {} candidate images in {}",
        files.len(),
        config.image_dir.display()
    );

    let object_points = config.pattern.object_points(config.square_size);

    let mut views: Vec<CalibrationView> = Vec::new();
    let mut view_names: Vec<String> = Vec::new();
    let mut images_skipped = 0usize;
    let mut resolution: Option<Resolution> = None;

    for path in &files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let image = match image::open(path) {
            Ok(image) => image.to_luma8(),
            Err(e) => {
                warn!("Skipping unreadable image {}: {}", name, e);
                images_skipped += 1;
                continue;
            }
        };

        let this_resolution = Resolution {
            width: image.width(),
            height: image.height(),
        };
        match &resolution {
            None => resolution = Some(this_resolution),
            Some(expected) if *expected != this_resolution => {
                return Err(PipelineError::ResolutionMismatch {
                    path: name,
                    got: this_resolution,
                    expected: expected.clone(),
                });
            }
            Some(_) => {}
        }

        let corners = match find_chessboard_corners(&image, config.pattern, &config.detection) {
            Some(corners) => corners,
            None => {
                debug!("No chessboard in {}, skipping", name);
                images_skipped += 1;
                continue;
            }
        };

        let mut corners = corners;
        refine_corners(&image, &mut corners, config.refine_window, config.criteria);
        if log::log_enabled!(log::Level::Debug) {
            let formatted: Vec<String> = corners
                .iter()
                .map(|c| format!("({:.3}, {:.3})", c.x, c.y))
                .collect();
            debug!("{}: {} corners: [{}]", name, corners.len(), formatted.join(", "));
        }

        views.push(CalibrationView::new(object_points.clone(), corners)?);
        view_names.push(name);
    }

    info!(
        "Accumulated {} views, skipped {} images",
        views.len(),
        images_skipped
    );

    let resolution = resolution.ok_or(CalibrationError::InsufficientData {
        views: 0,
        required: 3,
    })?;

    let result = calibrate(&views, resolution.clone(), &config.options)?;

    // Persist, then reload to verify the round trip. The reported error is
    // computed from the reloaded coefficients, not the in-memory ones.
    save_coefficients(
        &result.intrinsic_matrix(),
        &result.distortion_vector(),
        &config.output_path,
    )?;
    let (k_loaded, d_loaded) = load_coefficients(&config.output_path)?;
    info!("Coefficients written to {}", config.output_path.display());

    let reloaded = RadTanModel::from_matrices(&k_loaded, &d_loaded, resolution)?;
    let per_view_errors = per_view_reprojection_errors(&views, &reloaded, &result.poses)?;
    let mean_error = mean_reprojection_error(&per_view_errors);

    let per_view = view_names
        .iter()
        .zip(views.iter())
        .zip(per_view_errors.iter())
        .map(|((name, view), error)| ViewSummary {
            image: name.clone(),
            points: view.len(),
            error: *error,
        })
        .collect();

    Ok(CalibrationReport {
        model: reloaded,
        views_used: views.len(),
        images_skipped,
        per_view,
        mean_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_images_filters_and_sorts() {
        let dir = std::env::temp_dir().join("chessboard_tools_list_images");
        fs::create_dir_all(&dir).unwrap();
        for name in ["b.jpg", "a.JPG", "c.png", "notes.txt", "d.bmp"] {
            fs::write(dir.join(name), b"x").unwrap();
        }

        let extensions = vec!["jpg".to_string(), "png".to_string()];
        let files = list_images(&dir, &extensions).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.JPG", "b.jpg", "c.png"]);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_directory_fails() {
        let config = CalibrationConfig::new(
            PatternSize { cols: 7, rows: 6 },
            0.03,
            "/nonexistent/chessboard_tools_test_dir",
            std::env::temp_dir().join("chessboard_tools_unused.yaml"),
        );
        assert!(matches!(
            run_calibration(&config),
            Err(PipelineError::ImageDir { .. })
        ));
    }

    #[test]
    fn test_empty_directory_is_insufficient_data() {
        let dir = std::env::temp_dir().join("chessboard_tools_empty_dir");
        fs::create_dir_all(&dir).unwrap();

        let config = CalibrationConfig::new(
            PatternSize { cols: 7, rows: 6 },
            0.03,
            &dir,
            std::env::temp_dir().join("chessboard_tools_empty_out.yaml"),
        );
        let result = run_calibration(&config);
        assert!(matches!(
            result,
            Err(PipelineError::Calibration(
                CalibrationError::InsufficientData { .. }
            ))
        ));

        fs::remove_dir_all(&dir).unwrap();
    }

    // Full runs over rendered images live in tests/pipeline.rs.
}
