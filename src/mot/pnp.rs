use std::collections::HashMap;

use rand::seq::index::sample;

extern crate nalgebra as na;

use crate::camera::CameraParameters;
use crate::feature::{Feature, Match};
use crate::track::{Landmark, LandmarkId};
use crate::utils::rotation_jacobian;

/// Maximum number of RANSAC iterations.
pub const PNP_RANSAC_MAX_ITERATIONS: usize = 400;

/// Inlier threshold on the reprojection error, in pixels.
pub const PNP_REPROJECTION_THRESHOLD: f64 = 2.0;

const PNP_MIN_MATCHES: usize = 4;
const PNP_MIN_INLIER_RATIO: f64 = 0.25;
const RANSAC_CONFIDENCE: f64 = 0.99;

/// Jacobian of the pinhole projection with respect to the camera-frame point.
pub(crate) fn projection_jacobian(
    params: &CameraParameters,
    pt_cam: &na::Vector3<f64>,
) -> na::Matrix2x3<f64> {
    let z = pt_cam.z;
    na::Matrix2x3::new(
        params.fx / z, 0.0, -params.fx * pt_cam.x / (z * z),
        0.0, params.fy / z, -params.fy * pt_cam.y / (z * z),
    )
}

fn reprojection_cost(
    pts_3d: &[na::Vector3<f64>],
    pts_2d: &[na::Vector2<f64>],
    params: &CameraParameters,
    rotation: &na::Rotation3<f64>,
    translation: &na::Vector3<f64>,
) -> Option<f64> {
    let mut cost = 0.0;
    for (pt_3d, pt_2d) in pts_3d.iter().zip(pts_2d) {
        let pt_cam = rotation * pt_3d + translation;
        if pt_cam.z <= 1e-6 {
            return None;
        }
        cost += (params.project(&pt_cam) - pt_2d).norm_squared();
    }
    Some(cost)
}

/// Refine an object pose by minimizing the reprojection error of 2D-3D
/// correspondences with damped Gauss-Newton iterations, starting from
/// `initial`. Returns `None` when the optimization diverges (e.g. points end
/// up behind the camera).
pub(crate) fn refine_pose(
    pts_3d: &[na::Vector3<f64>],
    pts_2d: &[na::Vector2<f64>],
    params: &CameraParameters,
    initial: &na::Isometry3<f64>,
    max_iterations: usize,
) -> Option<na::Isometry3<f64>> {
    let mut omega = na::Rotation3::from(initial.rotation).scaled_axis();
    let mut translation = initial.translation.vector;
    let mut rotation = na::Rotation3::from_scaled_axis(omega);
    let mut cost = reprojection_cost(pts_3d, pts_2d, params, &rotation, &translation)?;
    let mut lambda = 1e-3;

    for _ in 0..max_iterations {
        let n = pts_3d.len();
        let mut jacobian = na::DMatrix::zeros(2 * n, 6);
        let mut residual = na::DVector::zeros(2 * n);
        for (i, (pt_3d, pt_2d)) in pts_3d.iter().zip(pts_2d).enumerate() {
            let pt_cam = rotation * pt_3d + translation;
            if pt_cam.z <= 1e-6 {
                return None;
            }
            let d_proj = projection_jacobian(params, &pt_cam);
            // columns 0..3: translation, columns 3..6: rotation vector
            jacobian
                .view_mut((2 * i, 0), (2, 3))
                .copy_from(&d_proj);
            jacobian
                .view_mut((2 * i, 3), (2, 3))
                .copy_from(&(d_proj * rotation_jacobian(&rotation, pt_3d)));
            residual
                .rows_mut(2 * i, 2)
                .copy_from(&(params.project(&pt_cam) - pt_2d));
        }
        let gradient = jacobian.transpose() * &residual;
        if gradient.norm() < 1e-10 {
            break;
        }
        let hessian = jacobian.transpose() * &jacobian;
        let mut improved = false;
        for _ in 0..10 {
            let damped = &hessian + na::DMatrix::identity(6, 6) * lambda;
            let Some(delta) = damped.cholesky().map(|chol| chol.solve(&(-&gradient))) else {
                lambda *= 10.0;
                continue;
            };
            let new_translation = translation + delta.fixed_rows::<3>(0).clone_owned();
            let new_omega = omega + delta.fixed_rows::<3>(3).clone_owned();
            let new_rotation = na::Rotation3::from_scaled_axis(new_omega);
            match reprojection_cost(pts_3d, pts_2d, params, &new_rotation, &new_translation) {
                Some(new_cost) if new_cost < cost => {
                    translation = new_translation;
                    omega = new_omega;
                    rotation = new_rotation;
                    cost = new_cost;
                    lambda = (lambda / 10.0).max(1e-12);
                    improved = true;
                    break;
                }
                _ => lambda *= 10.0,
            }
            if lambda > 1e8 {
                break;
            }
        }
        if !improved {
            break;
        }
    }
    Some(na::Isometry3::from_parts(
        na::Translation3::from(translation),
        na::UnitQuaternion::from_scaled_axis(omega),
    ))
}

fn count_inliers(
    pts_3d: &[na::Vector3<f64>],
    pts_2d: &[na::Vector2<f64>],
    params: &CameraParameters,
    pose: &na::Isometry3<f64>,
) -> Vec<usize> {
    pts_3d
        .iter()
        .zip(pts_2d)
        .enumerate()
        .filter_map(|(i, (pt_3d, pt_2d))| {
            let pt_cam = pose * na::Point3::from(*pt_3d);
            if pt_cam.z <= 1e-6 {
                return None;
            }
            let error = (params.project(&pt_cam.coords) - pt_2d).norm();
            (error < PNP_REPROJECTION_THRESHOLD).then_some(i)
        })
        .collect()
}

/// Robustly estimate the object-to-camera pose from 2D-3D correspondences.
///
/// `track_matches` pairs indices into `left_features` with indices into
/// `landmark_ids`; landmark positions are taken from `landmarks` in the
/// object frame. The estimation is seeded from `t_cam_obj`.
///
/// Stage 1 runs RANSAC (up to [`PNP_RANSAC_MAX_ITERATIONS`] hypotheses, each
/// a minimal-sample refinement of the seed) with a reprojection threshold of
/// [`PNP_REPROJECTION_THRESHOLD`] pixels; the result is accepted only with an
/// inlier ratio above 0.25. Stage 2 re-optimizes over the inliers only.
///
/// Returns the refined pose, a success flag, and the inlier ratio; on failure
/// the input pose is returned unchanged with a ratio of zero.
pub fn localize_object(
    left_features: &[Feature],
    track_matches: &[Match],
    landmark_ids: &[LandmarkId],
    landmarks: &HashMap<LandmarkId, Landmark>,
    t_cam_obj: &na::Isometry3<f64>,
    params: &CameraParameters,
) -> (na::Isometry3<f64>, bool, f64) {
    if track_matches.len() < PNP_MIN_MATCHES {
        log::debug!(
            "Too few matches ({}) for PnP (minimum {})",
            track_matches.len(),
            PNP_MIN_MATCHES
        );
        return (*t_cam_obj, false, 0.0);
    }
    log::debug!(
        "Localizing object based on {} point correspondences",
        track_matches.len()
    );
    let mut pts_3d = Vec::with_capacity(track_matches.len());
    let mut pts_2d = Vec::with_capacity(track_matches.len());
    for &(feature_idx, landmark_idx) in track_matches {
        pts_3d.push(landmarks[&landmark_ids[landmark_idx]].pt_3d);
        pts_2d.push(left_features[feature_idx].pt());
    }

    let n = pts_3d.len();
    let mut rng = rand::rng();
    let mut best_pose = None;
    let mut best_inliers: Vec<usize> = Vec::new();
    let mut needed_iterations = PNP_RANSAC_MAX_ITERATIONS;
    let mut iteration = 0;
    while iteration < needed_iterations.min(PNP_RANSAC_MAX_ITERATIONS) {
        iteration += 1;
        let indices = sample(&mut rng, n, PNP_MIN_MATCHES);
        let sample_3d: Vec<_> = indices.iter().map(|i| pts_3d[i]).collect();
        let sample_2d: Vec<_> = indices.iter().map(|i| pts_2d[i]).collect();
        let Some(hypothesis) = refine_pose(&sample_3d, &sample_2d, params, t_cam_obj, 10) else {
            continue;
        };
        let inliers = count_inliers(&pts_3d, &pts_2d, params, &hypothesis);
        if inliers.len() > best_inliers.len() {
            best_inliers = inliers;
            best_pose = Some(hypothesis);
            let inlier_fraction = best_inliers.len() as f64 / n as f64;
            if inlier_fraction >= 1.0 {
                break;
            }
            // standard adaptive termination at the configured confidence
            let denominator = (1.0 - inlier_fraction.powi(PNP_MIN_MATCHES as i32)).ln();
            if denominator < 0.0 {
                needed_iterations =
                    ((1.0 - RANSAC_CONFIDENCE).ln() / denominator).ceil() as usize;
            }
        }
    }

    let inlier_ratio = best_inliers.len() as f64 / n as f64;
    log::debug!("Inlier ratio for PnP: {:.2}", inlier_ratio);
    if let Some(pose) = best_pose
        && inlier_ratio > PNP_MIN_INLIER_RATIO
    {
        log::debug!(
            "Optimization successful! Found {} inliers, running optimization with inliers...",
            best_inliers.len()
        );
        let inlier_3d: Vec<_> = best_inliers.iter().map(|&i| pts_3d[i]).collect();
        let inlier_2d: Vec<_> = best_inliers.iter().map(|&i| pts_2d[i]).collect();
        if let Some(optimized) = refine_pose(&inlier_3d, &inlier_2d, params, &pose, 30) {
            log::debug!("Inlier optimization successful!");
            return (optimized, true, inlier_ratio);
        }
    }
    log::debug!("Optimization failed...");
    (*t_cam_obj, false, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{ImagePoint, Observation};

    fn test_params() -> CameraParameters {
        CameraParameters::new(700.0, 700.0, 600.0, 180.0)
    }

    /// A box-shaped cloud of object-frame points.
    fn object_points() -> Vec<na::Vector3<f64>> {
        let mut points = Vec::new();
        for x in [-1.0, 0.0, 1.0] {
            for y in [-0.5, 0.5] {
                for z in [-1.0, 1.0] {
                    points.push(na::Vector3::new(x, y, z));
                }
            }
        }
        points
    }

    fn build_landmarks(
        points: &[na::Vector3<f64>],
    ) -> (HashMap<LandmarkId, Landmark>, Vec<LandmarkId>) {
        let mut landmarks = HashMap::new();
        let mut ids = Vec::new();
        for (i, pt) in points.iter().enumerate() {
            let id = i as LandmarkId;
            landmarks.insert(
                id,
                Landmark::new(
                    *pt,
                    Observation {
                        descriptor: na::DVector::zeros(4),
                        pt: ImagePoint::Mono { u: 0.0, v: 0.0 },
                        img_id: 0,
                    },
                ),
            );
            ids.push(id);
        }
        (landmarks, ids)
    }

    fn project_into_features(
        points: &[na::Vector3<f64>],
        pose: &na::Isometry3<f64>,
        params: &CameraParameters,
    ) -> Vec<Feature> {
        points
            .iter()
            .map(|pt| {
                let pt_cam = pose * na::Point3::from(*pt);
                let pt_2d = params.project(&pt_cam.coords);
                Feature::new(pt_2d.x, pt_2d.y, na::DVector::zeros(4))
            })
            .collect()
    }

    fn perturbed(pose: &na::Isometry3<f64>) -> na::Isometry3<f64> {
        na::Isometry3::new(
            pose.translation.vector + na::Vector3::new(0.3, -0.2, 0.4),
            na::Rotation3::from(pose.rotation).scaled_axis() + na::Vector3::new(0.02, -0.03, 0.01),
        )
    }

    #[test]
    fn test_refine_pose_converges() {
        let params = test_params();
        let points = object_points();
        let truth = na::Isometry3::new(
            na::Vector3::new(0.5, -0.3, 12.0),
            na::Vector3::new(0.0, 0.1, 0.05),
        );
        let pts_2d: Vec<_> = project_into_features(&points, &truth, &params)
            .iter()
            .map(Feature::pt)
            .collect();
        let refined = refine_pose(&points, &pts_2d, &params, &perturbed(&truth), 50).unwrap();
        assert!((refined.translation.vector - truth.translation.vector).norm() < 1e-4);
        assert!(refined.rotation.angle_to(&truth.rotation) < 1e-4);
    }

    #[test]
    fn test_localize_returns_input_with_too_few_matches() {
        let params = test_params();
        let (landmarks, ids) = build_landmarks(&object_points());
        let initial = na::Isometry3::translation(0.0, 0.0, 10.0);
        let features = vec![
            Feature::new(0.0, 0.0, na::DVector::zeros(4)),
            Feature::new(1.0, 1.0, na::DVector::zeros(4)),
            Feature::new(2.0, 2.0, na::DVector::zeros(4)),
        ];
        let matches = vec![(0, 0), (1, 1), (2, 2)];
        let (pose, success, ratio) =
            localize_object(&features, &matches, &ids, &landmarks, &initial, &params);
        assert_eq!(pose, initial);
        assert!(!success);
        assert_eq!(ratio, 0.0);
    }

    #[test]
    fn test_localize_recovers_pose() {
        let params = test_params();
        let points = object_points();
        let (landmarks, ids) = build_landmarks(&points);
        let truth = na::Isometry3::new(
            na::Vector3::new(-0.5, 0.2, 15.0),
            na::Vector3::new(0.05, -0.1, 0.0),
        );
        let features = project_into_features(&points, &truth, &params);
        let matches: Vec<Match> = (0..points.len()).map(|i| (i, i)).collect();
        let (pose, success, ratio) =
            localize_object(&features, &matches, &ids, &landmarks, &perturbed(&truth), &params);
        assert!(success);
        assert!(ratio > 0.99);
        assert!((pose.translation.vector - truth.translation.vector).norm() < 1e-3);
        assert!(pose.rotation.angle_to(&truth.rotation) < 1e-3);
    }

    #[test]
    fn test_localize_rejects_outliers() {
        let params = test_params();
        let points = object_points();
        let (landmarks, ids) = build_landmarks(&points);
        let truth = na::Isometry3::new(
            na::Vector3::new(0.0, 0.0, 12.0),
            na::Vector3::new(0.0, 0.05, 0.0),
        );
        let mut features = project_into_features(&points, &truth, &params);
        // corrupt two correspondences far beyond the inlier threshold
        features[0].u += 80.0;
        features[5].v -= 60.0;
        let matches: Vec<Match> = (0..points.len()).map(|i| (i, i)).collect();
        let (pose, success, ratio) =
            localize_object(&features, &matches, &ids, &landmarks, &perturbed(&truth), &params);
        assert!(success);
        let expected_ratio = (points.len() - 2) as f64 / points.len() as f64;
        assert!((ratio - expected_ratio).abs() < 1e-9);
        assert!((pose.translation.vector - truth.translation.vector).norm() < 1e-3);
    }
}
