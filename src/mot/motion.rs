use crate::camera::StereoCamera;
use crate::config::Config;
use crate::track::{ObjectClass, ObjectTrack};
use crate::utils;

extern crate nalgebra as na;

/// Average per-frame world-frame translation of a track over its last
/// `num_frames` poses.
pub fn direction_vector(track: &ObjectTrack, num_frames: usize) -> na::Vector3<f64> {
    let poses: Vec<&na::Isometry3<f64>> = track.poses.values().collect();
    if poses.len() < 2 {
        return na::Vector3::zeros();
    }
    let num = num_frames.min(poses.len());
    let last = poses[poses.len() - 1].translation.vector;
    let first = poses[poses.len() - num].translation.vector;
    (last - first) / (num as f64)
}

/// Constant-velocity pose extrapolation.
///
/// The predicted pose keeps the rotation of the last pose and advances the
/// translation by the average per-frame translation over the last
/// `window` poses. With fewer than two poses the last pose is returned
/// unchanged.
pub fn estimate_next_pose(track: &ObjectTrack, window: usize) -> na::Isometry3<f64> {
    let Some((_, last)) = track.last_pose() else {
        return na::Isometry3::identity();
    };
    if track.poses.len() < 2 {
        return *last;
    }
    let rel_translation = direction_vector(track, window);
    log::debug!("Relative translation: {:?}", rel_translation);
    na::Isometry3::from_parts(
        na::Translation3::from(last.translation.vector + rel_translation),
        last.rotation,
    )
}

/// Median norm of consecutive online-location differences within the last
/// `2 * window` frames. `None` when the track has fewer than two locations.
pub fn median_translation(track: &ObjectTrack, window: usize) -> Option<f64> {
    let frames: Vec<u64> = track.poses.keys().copied().collect();
    let start = frames.len().saturating_sub(2 * window);
    let recent = &frames[start..];
    let mut translations = Vec::new();
    for pair in recent.windows(2) {
        let (Some(location0), Some(location1)) =
            (track.locations.get(&pair[0]), track.locations.get(&pair[1]))
        else {
            continue;
        };
        translations.push((location0 - location1).norm());
    }
    utils::median(&translations)
}

/// Upper bound on a plausible inter-frame translation of a track.
///
/// The class speed limit is tightened to four times the track's median step
/// once it has at least five well-tracked poses; the bound is then relaxed
/// for distant and badly tracked objects, clamped by
/// `MAX_MAX_DIST_MULTIPLIER`.
pub fn max_valid_translation(
    config: &Config,
    cls: ObjectClass,
    badly_tracked_frames: usize,
    cam: &StereoCamera,
    median_translation: Option<f64>,
    dist_from_cam: f64,
    num_poses: usize,
) -> f64 {
    let class_speed = config.max_speed(cls);
    // allow for some motion even if previous estimates had none
    let min_speed = class_speed / 10.0;
    let max_translation = match median_translation {
        Some(step) if num_poses.saturating_sub(badly_tracked_frames) >= 5 => {
            log::debug!("Using max speed based on median translation");
            let max_speed = class_speed.min(4.0 * step * config.frame_rate);
            (min_speed / config.frame_rate).max(max_speed / config.frame_rate)
        }
        _ => {
            log::debug!("Using max speed of object type");
            class_speed / config.frame_rate
        }
    };
    let dist_factor = (dist_from_cam / (40.0 * cam.baseline())).max(1.0);
    config
        .max_max_dist_multiplier
        .min((0.75 * badly_tracked_frames as f64 + 1.0) * dist_factor)
        * max_translation
}

/// Whether the relative transform between two adjacent object poses is a
/// plausible motion.
#[allow(clippy::too_many_arguments)]
pub fn is_valid_motion(
    config: &Config,
    t_rel: &na::Isometry3<f64>,
    cls: ObjectClass,
    badly_tracked_frames: usize,
    cam: &StereoCamera,
    median_translation: Option<f64>,
    dist_from_cam: f64,
    num_poses: usize,
) -> bool {
    let curr_translation = t_rel.translation.vector.norm();
    let max_dist = max_valid_translation(
        config,
        cls,
        badly_tracked_frames,
        cam,
        median_translation,
        dist_from_cam,
        num_poses,
    );
    log::debug!(
        "Current translation: {:.2}, max. allowed translation: {:.2}",
        curr_translation,
        max_dist
    );
    curr_translation < max_dist
}

/// Heading angle of a track in camera coordinates: the angle between the
/// camera-projected direction of motion, restricted to the (x, z) ground
/// plane, and the camera x axis. Negative when the direction's second ground
/// plane component is positive; zero for degenerate directions or tracks with
/// fewer than two poses.
pub fn rotation_of_track(
    track: &ObjectTrack,
    t_world_cam: &na::Isometry3<f64>,
    window: usize,
) -> f64 {
    if track.poses.len() < 2 {
        return 0.0;
    }
    let dir_world = direction_vector(track, window);
    let dir_cam = t_world_cam.rotation.inverse() * dir_world;
    let ground = na::Vector2::new(dir_cam.x, dir_cam.z);
    let norm = ground.norm();
    if norm < 1e-12 {
        return 0.0;
    }
    let ground = ground / norm;
    let mut angle = ground.x.clamp(-1.0, 1.0).acos();
    if ground.y > 0.0 {
        angle = -angle;
    }
    if angle.is_finite() { angle } else { 0.0 }
}
