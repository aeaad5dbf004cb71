use std::collections::HashMap;

extern crate nalgebra as na;

use crate::camera::StereoCamera;
use crate::config::Config;
use crate::mot::motion;
use crate::mot::pnp::projection_jacobian;
use crate::track::{ImageId, ImagePoint, LandmarkId, ObjectTrack};
use crate::utils::rotation_jacobian;

/// Scale of the Cauchy robust kernel, in pixels.
const CAUCHY_SCALE: f64 = 2.0;

/// Iterations of the per-frame sliding-window optimization.
pub const BA_DEFAULT_ITERATIONS: usize = 10;

/// Iterations of the final full optimization at shutdown.
pub const BA_FULL_ITERATIONS: usize = 20;

#[derive(Clone, Copy)]
struct ObservationRef {
    landmark_idx: usize,
    frame: ImageId,
    pt: ImagePoint,
}

#[derive(Clone)]
struct BaState {
    /// (translation, rotation vector) of `T_world_obj` per optimized frame.
    poses: Vec<(na::Vector3<f64>, na::Vector3<f64>)>,
    /// Landmark positions in the object frame.
    points: Vec<na::Vector3<f64>>,
}

impl BaState {
    fn apply_step(&self, delta: &na::DVector<f64>) -> BaState {
        let mut next = self.clone();
        for (i, (translation, omega)) in next.poses.iter_mut().enumerate() {
            *translation += delta.fixed_rows::<3>(6 * i).clone_owned();
            *omega += delta.fixed_rows::<3>(6 * i + 3).clone_owned();
        }
        let pose_params = 6 * self.poses.len();
        for (i, point) in next.points.iter_mut().enumerate() {
            *point += delta.fixed_rows::<3>(pose_params + 3 * i).clone_owned();
        }
        next
    }
}

struct BaProblem<'a> {
    track: &'a ObjectTrack,
    all_poses: &'a [na::Isometry3<f64>],
    stereo_cam: &'a StereoCamera,
    optimized: Vec<ImageId>,
    optimized_index: HashMap<ImageId, usize>,
    landmark_ids: Vec<LandmarkId>,
    observations: Vec<ObservationRef>,
}

impl BaProblem<'_> {
    fn world_obj_pose(&self, frame: ImageId, state: &BaState) -> na::Isometry3<f64> {
        match self.optimized_index.get(&frame) {
            Some(&idx) => {
                let (translation, omega) = state.poses[idx];
                na::Isometry3::from_parts(
                    na::Translation3::from(translation),
                    na::UnitQuaternion::from_scaled_axis(omega),
                )
            }
            None => self.track.poses[&frame],
        }
    }

    /// Residual of a single observation, or `None` when the landmark falls
    /// behind the camera in the current state. For mono observations the
    /// third component is unused.
    fn block_residual(
        &self,
        obs: &ObservationRef,
        state: &BaState,
    ) -> Option<(na::Vector3<f64>, bool)> {
        let t_world_obj = self.world_obj_pose(obs.frame, state);
        let t_cam_world = self.all_poses[obs.frame as usize].inverse();
        let pt_obj = state.points[obs.landmark_idx];
        let pt_cam = t_cam_world * (t_world_obj * na::Point3::from(pt_obj));
        if pt_cam.z <= 1e-6 {
            return None;
        }
        let projected = self.stereo_cam.left.project(&pt_cam.coords);
        match obs.pt {
            ImagePoint::Mono { u, v } => {
                Some((na::Vector3::new(projected.x - u, projected.y - v, 0.0), false))
            }
            ImagePoint::Stereo { u, v, u_right } => {
                let pt_right = self.stereo_cam.t_left_right.inverse() * pt_cam;
                if pt_right.z <= 1e-6 {
                    return None;
                }
                let projected_right = self.stereo_cam.right.project(&pt_right.coords);
                Some((
                    na::Vector3::new(
                        projected.x - u,
                        projected.y - v,
                        projected_right.x - u_right,
                    ),
                    true,
                ))
            }
        }
    }

    /// Total robust cost: the Cauchy kernel applied to each observation's
    /// squared residual norm.
    fn cost(&self, state: &BaState) -> f64 {
        let c2 = CAUCHY_SCALE * CAUCHY_SCALE;
        self.observations
            .iter()
            .filter_map(|obs| self.block_residual(obs, state))
            .map(|(residual, stereo)| {
                let squared = if stereo {
                    residual.norm_squared()
                } else {
                    residual.x * residual.x + residual.y * residual.y
                };
                c2 * (1.0 + squared / c2).ln()
            })
            .sum()
    }

    /// Assemble the IRLS-weighted Jacobian and residual vector.
    fn linearize(&self, state: &BaState) -> (na::DMatrix<f64>, na::DVector<f64>) {
        let c2 = CAUCHY_SCALE * CAUCHY_SCALE;
        let pose_params = 6 * state.poses.len();
        let num_params = pose_params + 3 * state.points.len();
        let residual_dim: usize = self
            .observations
            .iter()
            .map(|obs| if obs.pt.is_stereo() { 3 } else { 2 })
            .sum();
        let mut jacobian = na::DMatrix::zeros(residual_dim, num_params);
        let mut residuals = na::DVector::zeros(residual_dim);

        let mut row = 0;
        for obs in &self.observations {
            let rows = if obs.pt.is_stereo() { 3 } else { 2 };
            let Some((residual, stereo)) = self.block_residual(obs, state) else {
                row += rows;
                continue;
            };
            let t_world_obj = self.world_obj_pose(obs.frame, state);
            let t_cam_world = self.all_poses[obs.frame as usize].inverse();
            let rotation_wo = na::Rotation3::from(t_world_obj.rotation);
            let rotation_cw = na::Rotation3::from(t_cam_world.rotation).matrix().clone_owned();
            let pt_obj = state.points[obs.landmark_idx];
            let pt_cam = t_cam_world * (t_world_obj * na::Point3::from(pt_obj));

            // chain rule through p_cam = T_cam_world * (R_wo * p + t_wo)
            let d_cam_d_translation = rotation_cw;
            let d_cam_d_omega = rotation_cw * rotation_jacobian(&rotation_wo, &pt_obj);
            let d_cam_d_point = rotation_cw * rotation_wo.matrix();

            let squared = if stereo {
                residual.norm_squared()
            } else {
                residual.x * residual.x + residual.y * residual.y
            };
            let weight = (1.0 / (1.0 + squared / c2)).sqrt();

            let d_proj = projection_jacobian(&self.stereo_cam.left, &pt_cam.coords);
            let left_d_translation = d_proj * d_cam_d_translation;
            let left_d_omega = d_proj * d_cam_d_omega;
            let left_d_point = d_proj * d_cam_d_point;

            let point_col = pose_params + 3 * obs.landmark_idx;
            let pose_col = self.optimized_index.get(&obs.frame).map(|&idx| 6 * idx);
            if let Some(col) = pose_col {
                jacobian
                    .view_mut((row, col), (2, 3))
                    .copy_from(&(left_d_translation * weight));
                jacobian
                    .view_mut((row, col + 3), (2, 3))
                    .copy_from(&(left_d_omega * weight));
            }
            jacobian
                .view_mut((row, point_col), (2, 3))
                .copy_from(&(left_d_point * weight));
            residuals[row] = residual.x * weight;
            residuals[row + 1] = residual.y * weight;

            if stereo {
                let t_right_left = self.stereo_cam.t_left_right.inverse();
                let pt_right = t_right_left * pt_cam;
                let rotation_rl = na::Rotation3::from(t_right_left.rotation)
                    .matrix()
                    .clone_owned();
                let d_proj_right =
                    projection_jacobian(&self.stereo_cam.right, &pt_right.coords);
                // only the u row of the right projection contributes
                let u_row = d_proj_right.row(0) * rotation_rl;
                if let Some(col) = pose_col {
                    jacobian
                        .view_mut((row + 2, col), (1, 3))
                        .copy_from(&(u_row * d_cam_d_translation * weight));
                    jacobian
                        .view_mut((row + 2, col + 3), (1, 3))
                        .copy_from(&(u_row * d_cam_d_omega * weight));
                }
                jacobian
                    .view_mut((row + 2, point_col), (1, 3))
                    .copy_from(&(u_row * d_cam_d_point * weight));
                residuals[row + 2] = residual.z * weight;
            }
            row += rows;
        }
        (jacobian, residuals)
    }
}

/// Sliding-window bundle adjustment of a single track.
///
/// Optimizes the latest `SLIDING_WINDOW_BA` object poses (all poses with
/// `full_ba`) and all landmark positions, minimizing the Cauchy-robustified
/// reprojection error of every observation against the fixed ego pose of its
/// frame. Stereo observations contribute a three-component residual, mono
/// observations two. Landmark ids and counts are preserved.
///
/// If the optimized trajectory's latest step exceeds the plausible-motion
/// bound derived from `median_translation`, the input track is returned
/// unchanged.
pub fn object_bundle_adjustment(
    track: &ObjectTrack,
    all_poses: &[na::Isometry3<f64>],
    stereo_cam: &StereoCamera,
    median_translation: Option<f64>,
    max_iterations: usize,
    full_ba: bool,
    config: &Config,
) -> ObjectTrack {
    let mut result = track.clone();
    if track.landmarks.is_empty() {
        return result;
    }
    let frames: Vec<ImageId> = track
        .poses
        .keys()
        .copied()
        .filter(|id| (*id as usize) < all_poses.len())
        .collect();
    if frames.is_empty() {
        return result;
    }
    let window = if full_ba {
        frames.len()
    } else {
        config.sliding_window_ba.min(frames.len())
    };
    let optimized: Vec<ImageId> = frames[frames.len() - window..].to_vec();
    let optimized_index: HashMap<ImageId, usize> = optimized
        .iter()
        .enumerate()
        .map(|(i, f)| (*f, i))
        .collect();

    let mut landmark_ids: Vec<LandmarkId> = track.landmarks.keys().copied().collect();
    landmark_ids.sort_unstable();
    let mut observations = Vec::new();
    for (landmark_idx, id) in landmark_ids.iter().enumerate() {
        for obs in &track.landmarks[id].observations {
            if !track.poses.contains_key(&obs.img_id) || obs.img_id as usize >= all_poses.len() {
                continue;
            }
            observations.push(ObservationRef {
                landmark_idx,
                frame: obs.img_id,
                pt: obs.pt,
            });
        }
    }
    if observations.is_empty() {
        return result;
    }

    let problem = BaProblem {
        track,
        all_poses,
        stereo_cam,
        optimized: optimized.clone(),
        optimized_index,
        landmark_ids: landmark_ids.clone(),
        observations,
    };
    let mut state = BaState {
        poses: optimized
            .iter()
            .map(|f| {
                let pose = track.poses[f];
                (
                    pose.translation.vector,
                    na::Rotation3::from(pose.rotation).scaled_axis(),
                )
            })
            .collect(),
        points: landmark_ids.iter().map(|id| track.landmarks[id].pt_3d).collect(),
    };

    let mut cost = problem.cost(&state);
    let mut lambda = 1e-4;
    let num_params = 6 * state.poses.len() + 3 * state.points.len();
    for _ in 0..max_iterations {
        let (jacobian, residuals) = problem.linearize(&state);
        let gradient = jacobian.transpose() * &residuals;
        if gradient.norm() < 1e-9 {
            break;
        }
        let hessian = jacobian.transpose() * &jacobian;
        let mut improved = false;
        for _ in 0..10 {
            let damped = &hessian + na::DMatrix::identity(num_params, num_params) * lambda;
            let Some(delta) = damped.cholesky().map(|chol| chol.solve(&(-&gradient))) else {
                lambda *= 10.0;
                continue;
            };
            let candidate = state.apply_step(&delta);
            let candidate_cost = problem.cost(&candidate);
            if candidate_cost < cost {
                state = candidate;
                cost = candidate_cost;
                lambda = (lambda / 10.0).max(1e-12);
                improved = true;
                break;
            }
            lambda *= 10.0;
            if lambda > 1e8 {
                break;
            }
        }
        if !improved {
            break;
        }
    }

    for (i, frame) in problem.optimized.iter().enumerate() {
        let (translation, omega) = state.poses[i];
        result.poses.insert(
            *frame,
            na::Isometry3::from_parts(
                na::Translation3::from(translation),
                na::UnitQuaternion::from_scaled_axis(omega),
            ),
        );
    }
    for (i, id) in problem.landmark_ids.iter().enumerate() {
        result
            .landmarks
            .get_mut(id)
            .expect("landmark ids unchanged")
            .pt_3d = state.points[i];
    }

    // reject optimized trajectories whose latest step is implausible
    let poses: Vec<&na::Isometry3<f64>> = result.poses.values().collect();
    if poses.len() >= 2 {
        let step = (poses[poses.len() - 1].translation.vector
            - poses[poses.len() - 2].translation.vector)
            .norm();
        let bound = motion::max_valid_translation(
            config,
            track.cls,
            track.badly_tracked_frames,
            stereo_cam,
            median_translation,
            track.dist_from_cam,
            track.poses.len(),
        );
        if step >= bound {
            log::debug!(
                "Discarding bundle adjustment result: step {:.2} exceeds bound {:.2}",
                step,
                bound
            );
            return track.clone();
        }
    }
    result
}
