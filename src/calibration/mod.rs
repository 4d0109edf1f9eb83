//! Planar calibration solver.
//!
//! Consumes the per-view point correspondences accumulated by the detection
//! pass and produces a [`RadTanModel`] plus per-view board poses. The solve
//! runs in two stages: closed-form initialization ([`linear`]) followed by a
//! joint Levenberg-Marquardt refinement ([`bundle`]).

use log::info;
use nalgebra::{Isometry3, Vector2, Vector3};
use serde::Serialize;

use crate::camera::{CameraModel, CameraModelError, RadTanModel, Resolution};

pub mod bundle;
pub mod linear;

/// Board-to-camera transform of a single calibration view.
pub type ViewPose = Isometry3<f64>;

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("Insufficient calibration data: {views} usable views, need at least {required}")]
    InsufficientData { views: usize, required: usize },
    #[error("Point count mismatch: {object} object points vs {image} image points")]
    PointCountMismatch { object: usize, image: usize },
    #[error("Degenerate geometry: {0}")]
    DegenerateGeometry(String),
    #[error("Numerical failure: {0}")]
    NumericalFailure(String),
    #[error(transparent)]
    Camera(#[from] CameraModelError),
}

/// One view's correspondences: board points on the z=0 plane and their
/// observed pixel positions, index-aligned.
#[derive(Debug, Clone)]
pub struct CalibrationView {
    object_points: Vec<Vector3<f64>>,
    image_points: Vec<Vector2<f64>>,
}

impl CalibrationView {
    /// Builds a view, enforcing equally sized, non-empty point sets.
    pub fn new(
        object_points: Vec<Vector3<f64>>,
        image_points: Vec<Vector2<f64>>,
    ) -> Result<Self, CalibrationError> {
        if object_points.len() != image_points.len() || object_points.is_empty() {
            return Err(CalibrationError::PointCountMismatch {
                object: object_points.len(),
                image: image_points.len(),
            });
        }
        Ok(Self {
            object_points,
            image_points,
        })
    }

    pub fn object_points(&self) -> &[Vector3<f64>] {
        &self.object_points
    }

    pub fn image_points(&self) -> &[Vector2<f64>] {
        &self.image_points
    }

    pub fn len(&self) -> usize {
        self.object_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_points.is_empty()
    }
}

/// Solver options.
#[derive(Debug, Clone)]
pub struct CalibrationOptions {
    /// Run the nonlinear refinement after the closed-form stage.
    pub refine: bool,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self { refine: true }
    }
}

/// Output of a calibration solve. Immutable once produced.
#[derive(Debug, Clone)]
pub struct CalibrationResult {
    /// The calibrated camera model.
    pub model: RadTanModel,
    /// Board-to-camera pose of each input view, index-aligned with the views.
    pub poses: Vec<ViewPose>,
    /// Mean per-view reprojection error in pixels.
    pub mean_error: f64,
}

/// Calibrate a camera from planar chessboard views.
///
/// Runs per-view DLT homographies, Zhang's closed-form intrinsics, planar
/// pose decomposition, then (unless disabled) a joint bundle refinement of
/// intrinsics, distortion and poses.
///
/// # Errors
///
/// [`CalibrationError::InsufficientData`] when fewer than 3 views are given;
/// degenerate or numerically unstable configurations produce the
/// corresponding error variants.
pub fn calibrate(
    views: &[CalibrationView],
    resolution: Resolution,
    options: &CalibrationOptions,
) -> Result<CalibrationResult, CalibrationError> {
    if views.len() < 3 {
        return Err(CalibrationError::InsufficientData {
            views: views.len(),
            required: 3,
        });
    }

    info!("Calibrating from {} views", views.len());

    // Per-view plane-to-image homographies
    let mut homographies = Vec::with_capacity(views.len());
    for view in views {
        let board: Vec<Vector2<f64>> = view
            .object_points
            .iter()
            .map(|p| Vector2::new(p.x, p.y))
            .collect();
        homographies.push(linear::dlt_homography(&board, &view.image_points)?);
    }

    let intrinsics = linear::intrinsics_from_homographies(&homographies)?;
    info!(
        "Closed-form intrinsics: fx={:.2} fy={:.2} cx={:.2} cy={:.2}",
        intrinsics.fx, intrinsics.fy, intrinsics.cx, intrinsics.cy
    );

    let kmtx = intrinsics.to_matrix();
    let mut poses = Vec::with_capacity(views.len());
    for h in &homographies {
        poses.push(linear::pose_from_homography(&kmtx, h)?);
    }

    let initial = RadTanModel {
        intrinsics,
        resolution: resolution.clone(),
        distortions: [0.0; 5],
    };
    initial.validate_params()?;

    let (model, poses) = if options.refine {
        bundle::refine(views, &initial, &poses, resolution)?
    } else {
        (initial, poses)
    };

    let per_view = per_view_reprojection_errors(views, &model, &poses)?;
    let mean_error = mean_reprojection_error(&per_view);
    info!("Mean reprojection error: {:.4} px", mean_error);

    Ok(CalibrationResult {
        model,
        poses,
        mean_error,
    })
}

/// Per-view reprojection error: the L2 norm of the view's stacked residual
/// vector divided by its point count.
pub fn per_view_reprojection_errors(
    views: &[CalibrationView],
    model: &RadTanModel,
    poses: &[ViewPose],
) -> Result<Vec<f64>, CalibrationError> {
    if views.len() != poses.len() {
        return Err(CalibrationError::NumericalFailure(
            "view and pose counts must match".to_string(),
        ));
    }

    let mut errors = Vec::with_capacity(views.len());
    for (view, pose) in views.iter().zip(poses.iter()) {
        let mut squared_sum = 0.0;
        for (obj, obs) in view.object_points.iter().zip(view.image_points.iter()) {
            let p_cam = pose.rotation * obj + pose.translation.vector;
            let projected = model.project(&p_cam)?;
            squared_sum += (projected - obs).norm_squared();
        }
        errors.push(squared_sum.sqrt() / view.len() as f64);
    }
    Ok(errors)
}

/// Mean of the per-view errors; 0 for an empty slice.
pub fn mean_reprojection_error(per_view: &[f64]) -> f64 {
    if per_view.is_empty() {
        return 0.0;
    }
    per_view.iter().sum::<f64>() / per_view.len() as f64
}

/// Serializable summary of one view's contribution, used in reports.
#[derive(Debug, Clone, Serialize)]
pub struct ViewSummary {
    pub image: String,
    pub points: usize,
    pub error: f64,
}

pub use linear::{dlt_homography, intrinsics_from_homographies, pose_from_homography};

impl CalibrationResult {
    /// Intrinsic matrix `K` of the calibrated model.
    pub fn intrinsic_matrix(&self) -> nalgebra::Matrix3<f64> {
        self.model.intrinsics.to_matrix()
    }

    /// Distortion vector `D` of the calibrated model.
    pub fn distortion_vector(&self) -> nalgebra::DVector<f64> {
        self.model.distortion_vector()
    }
}
