//! Pinhole camera with radial-tangential (Brown-Conrady) distortion.
//!
//! This is the model produced by the calibration solver: four pinhole
//! intrinsics plus the five distortion coefficients `[k1, k2, p1, p2, k3]`.
//! It implements the [`CameraModel`] trait from the parent module.

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use nalgebra::{DVector, Matrix2, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pinhole + radial-tangential distortion camera model.
///
/// Distortion coefficients in order:
/// *   `k1`, `k2`, `k3`: radial terms.
/// *   `p1`, `p2`: tangential terms.
///
/// # Examples
///
/// ```rust
/// use nalgebra::DVector;
/// use chessboard_tools::camera::rad_tan::RadTanModel;
/// use chessboard_tools::camera::Resolution;
///
/// // Parameters: fx, fy, cx, cy, k1, k2, p1, p2, k3
/// let params = DVector::from_vec(vec![
///     500.0, 500.0, 320.0, 240.0,
///     0.1, -0.05, 0.001, 0.001, 0.02,
/// ]);
/// let model = RadTanModel::new(&params, Resolution { width: 640, height: 480 }).unwrap();
///
/// assert_eq!(model.intrinsics.fx, 500.0);
/// assert_eq!(model.distortions[0], 0.1); // k1
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct RadTanModel {
    /// The intrinsic parameters of the camera, [`Intrinsics`] (fx, fy, cx, cy).
    pub intrinsics: Intrinsics,
    /// The resolution of the camera image, [`Resolution`] (width, height).
    pub resolution: Resolution,
    /// The 5 distortion coefficients: `[k1, k2, p1, p2, k3]`.
    pub distortions: [f64; 5], // k1, k2, p1, p2, k3
}

impl RadTanModel {
    /// Creates a new [`RadTanModel`] from a parameter vector.
    ///
    /// # Arguments
    ///
    /// * `parameters` - camera parameters in the order
    ///   `fx, fy, cx, cy, k1, k2, p1, p2, k3`.
    /// * `resolution` - image resolution the model applies to.
    ///
    /// # Errors
    ///
    /// Returns a [`CameraModelError`] when the parameter vector is not 9 long
    /// or the intrinsics fail validation (non-positive focal length,
    /// non-finite principal point).
    pub fn new(
        parameters: &DVector<f64>,
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        if parameters.len() != 9 {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected 9 parameters, got {}",
                parameters.len()
            )));
        }

        let model = RadTanModel {
            intrinsics: Intrinsics {
                fx: parameters[0],
                fy: parameters[1],
                cx: parameters[2],
                cy: parameters[3],
            },
            resolution,
            distortions: [
                parameters[4], // k1
                parameters[5], // k2
                parameters[6], // p1
                parameters[7], // p2
                parameters[8], // k3
            ],
        };

        model.validate_params()?;
        Ok(model)
    }

    /// Builds a model from an intrinsic matrix and a distortion vector,
    /// the shape the coefficients file stores.
    ///
    /// # Errors
    ///
    /// Fails when `d` is not 5 long or the intrinsics are invalid.
    pub fn from_matrices(
        k: &Matrix3<f64>,
        d: &DVector<f64>,
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        if d.len() != 5 {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected 5 distortion coefficients, got {}",
                d.len()
            )));
        }

        let model = RadTanModel {
            intrinsics: Intrinsics::from_matrix(k),
            resolution,
            distortions: [d[0], d[1], d[2], d[3], d[4]],
        };

        model.validate_params()?;
        Ok(model)
    }

    /// Full parameter vector `fx, fy, cx, cy, k1, k2, p1, p2, k3`,
    /// the block layout the optimizer refines.
    pub fn parameters(&self) -> DVector<f64> {
        let mut params = vec![
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
        ];
        params.extend_from_slice(&self.distortions);
        DVector::from_vec(params)
    }

    /// Distortion coefficients as a dynamic vector (the `D` of the
    /// coefficients file).
    pub fn distortion_vector(&self) -> DVector<f64> {
        DVector::from_vec(self.distortions.to_vec())
    }
}

impl fmt::Debug for RadTanModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadTanModel [fx: {} fy: {} cx: {} cy: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
        )
    }
}

impl CameraModel for RadTanModel {
    /// Projects a 3D point from camera coordinates to pixel coordinates,
    /// applying radial and tangential distortion.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`]: the Z-coordinate is too close to zero.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        // If z is very small, the point is at the camera center
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }

        let k1 = self.distortions[0];
        let k2 = self.distortions[1];
        let p1 = self.distortions[2];
        let p2 = self.distortions[3];
        let k3 = self.distortions[4];

        // Normalized image coordinates
        let x_prime = point_3d.x / point_3d.z;
        let y_prime = point_3d.y / point_3d.z;

        let r2 = x_prime * x_prime + y_prime * y_prime;
        let r4 = r2 * r2;
        let r6 = r4 * r2;

        // Radial and tangential distortion
        let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;
        let x_distorted =
            x_prime * radial + 2.0 * p1 * x_prime * y_prime + p2 * (r2 + 2.0 * x_prime * x_prime);
        let y_distorted =
            y_prime * radial + p1 * (r2 + 2.0 * y_prime * y_prime) + 2.0 * p2 * x_prime * y_prime;

        let u = self.intrinsics.fx * x_distorted + self.intrinsics.cx;
        let v = self.intrinsics.fy * y_distorted + self.intrinsics.cy;

        Ok(Vector2::new(u, v))
    }

    /// Unprojects a pixel coordinate to a unit 3D ray by iteratively
    /// inverting the distortion (Newton's method on the 2x2 Jacobian).
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointIsOutSideImage`]: the pixel is outside the resolution.
    /// * [`CameraModelError::NumericalError`]: the iteration failed to converge
    ///   or the Jacobian became singular.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        if point_2d.x < 0.0
            || point_2d.x >= self.resolution.width as f64
            || point_2d.y < 0.0
            || point_2d.y >= self.resolution.height as f64
        {
            return Err(CameraModelError::PointIsOutSideImage);
        }

        let fx = self.intrinsics.fx;
        let fy = self.intrinsics.fy;
        let cx = self.intrinsics.cx;
        let cy = self.intrinsics.cy;

        let k1 = self.distortions[0];
        let k2 = self.distortions[1];
        let p1 = self.distortions[2];
        let p2 = self.distortions[3];
        let k3 = self.distortions[4];

        // Normalized coordinates of the distorted point; this is the target
        // the undistorted estimate has to reproduce.
        let target = Vector2::new((point_2d.x - cx) / fx, (point_2d.y - cy) / fy);

        // Start the iteration from the distorted point itself.
        let mut point = target;

        const EPS: f64 = 1e-6;
        const MAX_ITERATIONS: u32 = 100;

        for iteration in 0..MAX_ITERATIONS {
            let x = point.x;
            let y = point.y;
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;

            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;

            // Distorted position predicted by the current undistorted estimate
            let x_est = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let y_est = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

            let error = Vector2::new(x_est, y_est) - target;
            if error.norm() < EPS {
                break;
            }

            // Jacobian of the distortion map at (x, y)
            let dr_dx = 2.0 * x;
            let dr_dy = 2.0 * y;
            let d_radial = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;

            let j00 = radial + x * d_radial * dr_dx + 2.0 * p1 * y + p2 * (dr_dx + 4.0 * x);
            let j01 = x * d_radial * dr_dy + 2.0 * p1 * x + p2 * dr_dy;
            let j10 = y * d_radial * dr_dx + p1 * dr_dx + 2.0 * p2 * y;
            let j11 = radial + y * d_radial * dr_dy + p1 * (dr_dy + 4.0 * y) + 2.0 * p2 * x;

            let jacobian = Matrix2::new(j00, j01, j10, j11);

            if let Some(inv_jacobian) = jacobian.try_inverse() {
                let delta = inv_jacobian * error;
                point -= delta;
                if delta.norm() < EPS {
                    break;
                }
            } else {
                return Err(CameraModelError::NumericalError(
                    "Jacobian is singular".to_string(),
                ));
            }

            if iteration == MAX_ITERATIONS - 1 {
                return Err(CameraModelError::NumericalError(format!(
                    "Unprojection did not converge after {} iterations",
                    MAX_ITERATIONS
                )));
            }
        }

        let point3d = Vector3::new(point.x, point.y, 1.0);
        Ok(point3d.normalize())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution.clone()
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics.clone()
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.distortions.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_model() -> RadTanModel {
        let params = DVector::from_vec(vec![
            461.629,
            460.152,
            362.680,
            246.049,
            -0.28340811,
            0.07395907,
            0.00019359,
            1.76187114e-05,
            0.0,
        ]);
        RadTanModel::new(
            &params,
            Resolution {
                width: 752,
                height: 480,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_radtan_new_rejects_wrong_length() {
        let params = DVector::from_vec(vec![500.0, 500.0, 320.0, 240.0]);
        assert!(RadTanModel::new(
            &params,
            Resolution {
                width: 640,
                height: 480
            }
        )
        .is_err());
    }

    #[test]
    fn test_radtan_from_matrices() {
        let model = sample_model();
        let rebuilt = RadTanModel::from_matrices(
            &model.intrinsics.to_matrix(),
            &model.distortion_vector(),
            model.resolution.clone(),
        )
        .unwrap();

        assert_eq!(rebuilt.intrinsics.fx, model.intrinsics.fx);
        assert_eq!(rebuilt.intrinsics.cy, model.intrinsics.cy);
        for i in 0..5 {
            assert_eq!(rebuilt.distortions[i], model.distortions[i]);
        }
    }

    #[test]
    fn test_radtan_project_unproject() {
        let model = sample_model();

        // A 3D point in camera coordinates, somewhat forward and to the side
        let point_3d = Vector3::new(0.5, -0.3, 2.0);
        let norm_3d = point_3d.normalize();

        let point_2d = model.project(&point_3d).unwrap();

        assert!(point_2d.x >= 0.0 && point_2d.x < model.resolution.width as f64);
        assert!(point_2d.y >= 0.0 && point_2d.y < model.resolution.height as f64);

        let point_3d_unprojected = model.unproject(&point_2d).unwrap();

        assert!((norm_3d.x - point_3d_unprojected.x).abs() < 1e-6);
        assert!((norm_3d.y - point_3d_unprojected.y).abs() < 1e-6);
        assert!((norm_3d.z - point_3d_unprojected.z).abs() < 1e-6);
    }

    #[test]
    fn test_radtan_multiple_points() {
        let model = sample_model();

        // Points covering different parts of the field of view
        let test_points = vec![
            Vector3::new(0.0, 0.0, 1.0),   // Center
            Vector3::new(0.5, 0.0, 1.0),   // Right
            Vector3::new(-0.5, 0.0, 1.0),  // Left
            Vector3::new(0.0, 0.5, 1.0),   // Top
            Vector3::new(0.0, -0.5, 1.0),  // Bottom
            Vector3::new(0.3, 0.4, 1.0),   // Top-right
            Vector3::new(-0.3, 0.4, 1.0),  // Top-left
            Vector3::new(0.3, -0.4, 1.0),  // Bottom-right
            Vector3::new(-0.3, -0.4, 1.0), // Bottom-left
            Vector3::new(0.1, 0.1, 2.0),   // Further away
        ];

        for (i, original_point) in test_points.iter().enumerate() {
            let pixel_point = match model.project(original_point) {
                Ok(p) => p,
                Err(e) => {
                    println!(
                        "Point {} at {:?} failed projection: {:?}",
                        i, original_point, e
                    );
                    continue;
                }
            };

            if pixel_point.x < 0.0
                || pixel_point.x >= model.resolution.width as f64
                || pixel_point.y < 0.0
                || pixel_point.y >= model.resolution.height as f64
            {
                continue;
            }

            let ray_direction = match model.unproject(&pixel_point) {
                Ok(r) => r,
                Err(e) => {
                    println!(
                        "Point {} at pixel {:?} failed unprojection: {:?}",
                        i, pixel_point, e
                    );
                    continue;
                }
            };

            let original_direction = original_point.normalize();
            let dot_product = original_direction.dot(&ray_direction);

            assert!(dot_product > 0.99,
                    "Test point {}: Direction mismatch. Original: {:?}, Unprojected: {:?}, Dot product: {}",
                    i, original_direction, ray_direction, dot_product);
        }
    }

    #[test]
    fn test_radtan_rejects_point_behind_camera() {
        let model = sample_model();
        let behind = Vector3::new(0.1, 0.1, -1.0);
        assert!(matches!(
            model.project(&behind),
            Err(CameraModelError::PointAtCameraCenter)
        ));
    }
}
