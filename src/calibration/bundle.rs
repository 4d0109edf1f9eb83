//! Nonlinear refinement of camera parameters and board poses.
//!
//! Uses the `tiny_solver` Levenberg-Marquardt optimizer: one residual block
//! per view, each coupling the shared 9-parameter camera block
//! (`fx, fy, cx, cy, k1, k2, p1, p2, k3`) with that view's 6-dof
//! axis-angle pose block.

use log::{debug, info};
use nalgebra::{DVector, Isometry3, Translation3, UnitQuaternion, Vector2, Vector3};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

use crate::calibration::{CalibrationError, CalibrationView};
use crate::camera::{RadTanModel, Resolution};

/// Residual block for one view: reprojection error of every corner in that
/// view, as a function of the shared camera block and the view's pose block.
#[derive(Debug, Clone)]
struct ViewReprojectionCost {
    /// Board points on the z=0 plane.
    object_points: Vec<Vector3<f64>>,
    /// Observed corner positions in pixels.
    image_points: Vec<Vector2<f64>>,
}

impl ViewReprojectionCost {
    fn new(view: &CalibrationView) -> Self {
        Self {
            object_points: view.object_points.clone(),
            image_points: view.image_points.clone(),
        }
    }
}

/// Rotate `p` by the axis-angle vector `rvec` (Rodrigues), generic over the
/// solver's scalar type.
fn rotate_axis_angle<T: nalgebra::RealField>(
    rvec: &Vector3<T>,
    p: &Vector3<T>,
) -> Vector3<T> {
    let theta2 = rvec.dot(rvec);
    if theta2 > T::from_f64(1e-14).unwrap() {
        let theta = theta2.clone().sqrt();
        let axis = rvec / theta.clone();
        let cos_t = theta.clone().cos();
        let sin_t = theta.sin();
        let one = T::from_f64(1.0).unwrap();

        axis.cross(p) * sin_t.clone()
            + p * cos_t.clone()
            + axis.clone() * (axis.dot(p) * (one - cos_t))
    } else {
        // Small-angle approximation
        p + rvec.cross(p)
    }
}

impl<T: nalgebra::RealField> Factor<T> for ViewReprojectionCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let cam = &params[0];
        let pose = &params[1];

        let fx = cam[0].clone();
        let fy = cam[1].clone();
        let cx = cam[2].clone();
        let cy = cam[3].clone();
        let k1 = cam[4].clone();
        let k2 = cam[5].clone();
        let p1 = cam[6].clone();
        let p2 = cam[7].clone();
        let k3 = cam[8].clone();

        let rvec = Vector3::new(pose[0].clone(), pose[1].clone(), pose[2].clone());
        let tvec = Vector3::new(pose[3].clone(), pose[4].clone(), pose[5].clone());

        let one = T::from_f64(1.0).unwrap();
        let two = T::from_f64(2.0).unwrap();

        let mut residuals = DVector::zeros(self.image_points.len() * 2);

        for i in 0..self.image_points.len() {
            let obj = &self.object_points[i];
            let obs = &self.image_points[i];

            let p_board = Vector3::new(
                T::from_f64(obj.x).unwrap(),
                T::from_f64(obj.y).unwrap(),
                T::from_f64(obj.z).unwrap(),
            );
            let gt_u = T::from_f64(obs.x).unwrap();
            let gt_v = T::from_f64(obs.y).unwrap();

            // Board frame -> camera frame
            let p_cam = rotate_axis_angle(&rvec, &p_board) + tvec.clone();

            let x = p_cam.x.clone() / p_cam.z.clone();
            let y = p_cam.y.clone() / p_cam.z.clone();

            let r2 = x.clone() * x.clone() + y.clone() * y.clone();
            let r4 = r2.clone() * r2.clone();
            let r6 = r4.clone() * r2.clone();

            let radial =
                one.clone() + k1.clone() * r2.clone() + k2.clone() * r4 + k3.clone() * r6;

            let x_d = x.clone() * radial.clone()
                + two.clone() * p1.clone() * x.clone() * y.clone()
                + p2.clone() * (r2.clone() + two.clone() * x.clone() * x.clone());
            let y_d = y.clone() * radial
                + p1.clone() * (r2.clone() + two.clone() * y.clone() * y.clone())
                + two.clone() * p2.clone() * x.clone() * y.clone();

            let u = fx.clone() * x_d + cx.clone();
            let v = fy.clone() * y_d + cy.clone();

            residuals[i * 2] = u - gt_u;
            residuals[i * 2 + 1] = v - gt_v;
        }
        residuals
    }
}

fn pose_block_name(view_index: usize) -> String {
    format!("pose_{}", view_index)
}

fn pose_to_block(pose: &Isometry3<f64>) -> DVector<f64> {
    let rvec = pose.rotation.scaled_axis();
    let tvec = pose.translation.vector;
    DVector::from_vec(vec![rvec.x, rvec.y, rvec.z, tvec.x, tvec.y, tvec.z])
}

fn block_to_pose(block: &DVector<f64>) -> Isometry3<f64> {
    let rvec = Vector3::new(block[0], block[1], block[2]);
    let tvec = Vector3::new(block[3], block[4], block[5]);
    Isometry3::from_parts(
        Translation3::from(tvec),
        UnitQuaternion::from_scaled_axis(rvec),
    )
}

/// Jointly refine the camera parameters and the per-view poses by minimizing
/// total reprojection error over all views.
///
/// `initial_model` and `initial_poses` come from the closed-form stage; the
/// distortion part of the initial model is typically all zeros.
pub fn refine(
    views: &[CalibrationView],
    initial_model: &RadTanModel,
    initial_poses: &[Isometry3<f64>],
    resolution: Resolution,
) -> Result<(RadTanModel, Vec<Isometry3<f64>>), CalibrationError> {
    if views.len() != initial_poses.len() {
        return Err(CalibrationError::NumericalFailure(
            "view and pose counts must match".to_string(),
        ));
    }

    let mut problem = tiny_solver::Problem::new();
    let mut initial_values = HashMap::new();

    initial_values.insert("camera".to_string(), initial_model.parameters());

    for (i, (view, pose)) in views.iter().zip(initial_poses.iter()).enumerate() {
        let block = pose_block_name(i);
        let cost = ViewReprojectionCost::new(view);
        let num_residuals = view.image_points.len() * 2;
        problem.add_residual_block(
            num_residuals,
            &["camera", block.as_str()],
            Box::new(cost),
            None,
        );
        initial_values.insert(block, pose_to_block(pose));
    }

    info!(
        "Refining camera parameters over {} views with Levenberg-Marquardt",
        views.len()
    );

    let optimizer = LevenbergMarquardtOptimizer::default();
    let result = optimizer
        .optimize(&problem, &initial_values, None)
        .ok_or_else(|| {
            CalibrationError::NumericalFailure("bundle refinement failed to converge".to_string())
        })?;

    let cam = result.get("camera").ok_or_else(|| {
        CalibrationError::NumericalFailure("optimizer returned no camera block".to_string())
    })?;
    let model = RadTanModel::new(cam, resolution)?;
    debug!("Refined model: {:?}", model);

    let mut poses = Vec::with_capacity(views.len());
    for i in 0..views.len() {
        let block = result.get(&pose_block_name(i)).ok_or_else(|| {
            CalibrationError::NumericalFailure(format!("optimizer returned no pose block {}", i))
        })?;
        poses.push(block_to_pose(block));
    }

    Ok((model, poses))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraModel, Intrinsics};
    use crate::synthetic;
    use approx::assert_relative_eq;

    #[test]
    fn test_rotate_axis_angle_matches_quaternion() {
        let rvec = Vector3::new(0.2, -0.1, 0.3);
        let p = Vector3::new(0.5, -0.7, 2.0);

        let rotated = rotate_axis_angle(&rvec, &p);
        let expected = UnitQuaternion::from_scaled_axis(rvec) * p;

        assert_relative_eq!(rotated.x, expected.x, epsilon = 1e-12);
        assert_relative_eq!(rotated.y, expected.y, epsilon = 1e-12);
        assert_relative_eq!(rotated.z, expected.z, epsilon = 1e-12);
    }

    #[test]
    fn test_rotate_axis_angle_identity() {
        let rvec = Vector3::zeros();
        let p = Vector3::new(1.0, 2.0, 3.0);
        let rotated = rotate_axis_angle(&rvec, &p);
        assert_relative_eq!((rotated - p).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_pose_block_round_trip() {
        let pose = Isometry3::from_parts(
            Translation3::new(0.1, -0.2, 1.5),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.3, 0.1, -0.2)),
        );
        let back = block_to_pose(&pose_to_block(&pose));
        assert_relative_eq!(
            (back.translation.vector - pose.translation.vector).norm(),
            0.0,
            epsilon = 1e-12
        );
        assert!(back.rotation.angle_to(&pose.rotation) < 1e-12);
    }

    #[test]
    fn test_refine_recovers_distortion_from_perturbed_start() {
        let resolution = Resolution {
            width: 640,
            height: 480,
        };
        let gt = RadTanModel {
            intrinsics: Intrinsics {
                fx: 520.0,
                fy: 510.0,
                cx: 320.0,
                cy: 240.0,
            },
            resolution: resolution.clone(),
            distortions: [-0.15, 0.05, 0.0005, -0.0003, 0.0],
        };

        let pattern = crate::detection::PatternSize { cols: 7, rows: 6 };
        let poses = synthetic::board_poses(6, pattern, 0.03);
        let views = synthetic::project_board_views(&gt, &poses, pattern, 0.03).unwrap();

        // Perturbed, distortion-free start
        let start = RadTanModel {
            intrinsics: Intrinsics {
                fx: 505.0,
                fy: 525.0,
                cx: 317.0,
                cy: 243.0,
            },
            resolution: resolution.clone(),
            distortions: [0.0; 5],
        };

        let (refined, refined_poses) = refine(&views, &start, &poses, resolution).unwrap();

        assert_relative_eq!(refined.intrinsics.fx, gt.intrinsics.fx, epsilon = 0.5);
        assert_relative_eq!(refined.intrinsics.fy, gt.intrinsics.fy, epsilon = 0.5);
        assert_relative_eq!(refined.intrinsics.cx, gt.intrinsics.cx, epsilon = 0.5);
        assert_relative_eq!(refined.intrinsics.cy, gt.intrinsics.cy, epsilon = 0.5);
        assert_relative_eq!(refined.distortions[0], gt.distortions[0], epsilon = 1e-2);

        // Residuals at the refined parameters must be small
        for (view, pose) in views.iter().zip(refined_poses.iter()) {
            for (obj, obs) in view.object_points.iter().zip(view.image_points.iter()) {
                let p_cam = pose.rotation * obj + pose.translation.vector;
                let projected = refined.project(&p_cam).unwrap();
                assert!((projected - obs).norm() < 0.1);
            }
        }
    }
}
