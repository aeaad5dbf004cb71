use std::collections::{HashMap, HashSet};

extern crate nalgebra as na;

use crate::camera::StereoCamera;
use crate::config::Config;
use crate::feature::{Feature, Match};
use crate::geometry::{self, EPIPOLAR_TOLERANCE, MIN_DEPTH};
use crate::track::{
    ImageId, ImagePoint, Landmark, LandmarkId, ObjectClass, Observation, next_landmark_id,
};
use crate::utils;

/// Add observations to existing landmarks and triangulate new landmarks from
/// unclaimed stereo matches.
///
/// Observations are only added when the landmark's back-projection into the
/// camera frame has a depth of at least [`MIN_DEPTH`] and lies within
/// `max_dist` of the camera. An observation is stereo iff the left feature is
/// paired in `stereo_matches` and the rectified rows agree within
/// [`EPIPOLAR_TOLERANCE`]; otherwise it is mono. Stereo matches that fail
/// triangulation are removed from `stereo_matches` in place.
///
/// Returns the object-frame positions of all landmarks touched this frame
/// (observed or newly created).
#[allow(clippy::too_many_arguments)]
pub fn add_new_landmarks_and_observations(
    landmarks: &mut HashMap<LandmarkId, Landmark>,
    track_matches: &[Match],
    landmark_ids: &[LandmarkId],
    stereo_matches: &mut Vec<Match>,
    left_features: &[Feature],
    right_features: &[Feature],
    stereo_cam: &StereoCamera,
    t_cam_obj: &na::Isometry3<f64>,
    img_id: ImageId,
    max_dist: f64,
) -> Vec<na::Vector3<f64>> {
    let stereo_match_map: HashMap<usize, usize> = stereo_matches.iter().copied().collect();
    let mut current_landmarks = Vec::new();
    let mut already_added: HashSet<usize> = HashSet::new();

    // add new observations to existing landmarks
    for &(feature_idx, landmark_idx) in track_matches {
        let feature = &left_features[feature_idx];
        let landmark_id = landmark_ids[landmark_idx];
        let pt_obj = landmarks[&landmark_id].pt_3d;
        let pt_cam = (t_cam_obj * na::Point3::from(pt_obj)).coords;
        // don't add landmarks that are behind/very close to the camera or far away
        if pt_cam.z < MIN_DEPTH || pt_cam.norm() > max_dist {
            continue;
        }
        let pt = match stereo_match_map.get(&feature_idx) {
            Some(&right_idx) => {
                let right_feature = &right_features[right_idx];
                if (feature.v - right_feature.v).abs() <= EPIPOLAR_TOLERANCE {
                    ImagePoint::Stereo {
                        u: feature.u,
                        v: feature.v,
                        u_right: right_feature.u,
                    }
                } else {
                    ImagePoint::Mono {
                        u: feature.u,
                        v: feature.v,
                    }
                }
            }
            None => ImagePoint::Mono {
                u: feature.u,
                v: feature.v,
            },
        };
        let observation = Observation {
            descriptor: feature.descriptor.clone(),
            pt,
            img_id,
        };
        current_landmarks.push(pt_obj);
        already_added.insert(feature_idx);
        landmarks
            .get_mut(&landmark_id)
            .expect("landmark id from mapping")
            .observations
            .push(observation);
    }
    log::debug!("Added {} observations", already_added.len());

    // triangulate new landmarks from unclaimed stereo matches
    let t_obj_cam = t_cam_obj.inverse();
    let mut created_landmarks = 0;
    let mut bad_matches: HashSet<Match> = HashSet::new();
    for &(left_idx, right_idx) in stereo_matches.iter() {
        if already_added.contains(&left_idx) {
            continue;
        }
        let left_feature = &left_features[left_idx];
        let right_feature = &right_features[right_idx];
        let pt_obj = match geometry::triangulate_stereo_match(
            left_feature,
            right_feature,
            stereo_cam,
            &t_obj_cam,
            max_dist,
        ) {
            Ok(pt) => pt,
            Err(err) => {
                log::debug!("Dropping stereo match: {}", err);
                bad_matches.insert((left_idx, right_idx));
                continue;
            }
        };
        let observation = Observation {
            descriptor: left_feature.descriptor.clone(),
            pt: ImagePoint::Stereo {
                u: left_feature.u,
                v: left_feature.v,
                u_right: right_feature.u,
            },
            img_id,
        };
        current_landmarks.push(pt_obj);
        landmarks.insert(next_landmark_id(), Landmark::new(pt_obj, observation));
        created_landmarks += 1;
    }
    stereo_matches.retain(|m| !bad_matches.contains(m));
    log::debug!("Created {} landmarks", created_landmarks);
    current_landmarks
}

/// Remove landmarks that lie outside the current landmark cluster.
///
/// The cluster center is the per-axis median of this frame's landmark
/// positions; the pruning radius is the per-class cluster radius scaled by a
/// distance factor (or, in MAD mode, the scaled median absolute deviation).
/// Returns the cluster center (object frame) and the distance of the center
/// from the camera.
pub fn remove_outlier_landmarks(
    landmarks: &mut HashMap<LandmarkId, Landmark>,
    current_landmarks: &[na::Vector3<f64>],
    cls: ObjectClass,
    t_cam_obj: &na::Isometry3<f64>,
    config: &Config,
) -> Option<(na::Vector3<f64>, f64)> {
    let cluster_median_center = utils::median_point(current_landmarks)?;
    let dist_from_cam = (t_cam_obj * na::Point3::from(cluster_median_center))
        .coords
        .norm();
    let radius = if config.using_median_cluster {
        config.mad_scale_factor * utils::mad_radius(current_landmarks)?
    } else {
        let dist_factor = 1.0 + (dist_from_cam - 15.0).max(0.0) / 30.0;
        config.cluster_radius(cls) * dist_factor
    };
    let before = landmarks.len();
    landmarks.retain(|_, lm| (lm.pt_3d - cluster_median_center).norm() <= radius);
    log::debug!("Removing {} outlier landmarks", before - landmarks.len());
    Some((cluster_median_center, dist_from_cam))
}
