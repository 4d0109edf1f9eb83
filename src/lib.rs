//! Chessboard Tools Library
//!
//! Planar chessboard camera calibration: detect a chessboard's inner corners
//! in a set of images, refine them to sub-pixel accuracy, and solve for a
//! pinhole + radial-tangential camera model with per-view board poses.
//! The nonlinear refinement is driven by the tiny-solver optimization
//! framework.
//!
//! The typical entry point is [`pipeline::run_calibration`], which runs the
//! whole procedure from an image directory to a verified coefficients file.
//! The individual stages (detection, solving, persistence) are usable on
//! their own.

pub mod calibration;
pub mod camera;
pub mod detection;
pub mod pipeline;
pub mod storage;
pub mod synthetic;

// Re-export commonly used types
pub use calibration::{
    calibrate, CalibrationError, CalibrationOptions, CalibrationResult, CalibrationView, ViewPose,
};
pub use camera::{CameraModel, CameraModelError, Intrinsics, RadTanModel, Resolution};
pub use detection::{
    find_chessboard_corners, refine_corners, DetectionParams, PatternSize, TermCriteria,
};
pub use pipeline::{run_calibration, CalibrationConfig, CalibrationReport, PipelineError};
pub use storage::{load_coefficients, save_coefficients, StorageError};
