use std::collections::{BTreeMap, HashMap, HashSet};

use lapjv::{Matrix, lapjv};

extern crate nalgebra as na;

use crate::camera::StereoCamera;
use crate::config::{Config, TrustLevel};
use crate::feature::{FeatureMatcher, landmark_descriptor_features};
use crate::geometry;
use crate::mot::{extract_features, motion, pnp};
use crate::track::{
    ImageId, ObjectTrack, StereoImage, StereoObjectDetection, TrackId, TrackMatch,
    next_fresh_track_id,
};
use crate::utils;

/// Result of the per-frame data association.
pub struct AssociationResult {
    pub matches: Vec<TrackMatch>,
    pub unmatched_tracks: HashSet<TrackId>,
    /// PnP poses computed during stage A, reusable by process-match.
    pub pnp_poses: HashMap<TrackId, na::Isometry3<f64>>,
}

/// Median of the stereo-triangulated feature cloud of a detection, in world
/// coordinates. Populates the detection's feature and stereo-match caches.
/// `None` when no stereo match triangulates.
#[allow(clippy::too_many_arguments)]
pub fn stereo_pointcloud_center(
    detection: &mut StereoObjectDetection,
    stereo_image: &StereoImage,
    img_id: ImageId,
    track_id: TrackId,
    stereo_cam: &StereoCamera,
    t_world_cam: &na::Isometry3<f64>,
    matcher: &dyn FeatureMatcher,
    config: &Config,
) -> Option<na::Vector3<f64>> {
    let (left_features, right_features) = extract_features(
        detection,
        stereo_image,
        img_id,
        track_id,
        matcher,
        config.force_new_detections,
    );
    let stereo_matches = match &detection.stereo_matches {
        Some(matches) => matches.clone(),
        None => {
            let matches = matcher.match_features(&left_features, &right_features);
            detection.stereo_matches = Some(matches.clone());
            matches
        }
    };
    let mut pcl = Vec::new();
    for (left_idx, right_idx) in stereo_matches {
        match geometry::triangulate_stereo_match(
            &left_features[left_idx],
            &right_features[right_idx],
            stereo_cam,
            t_world_cam,
            config.max_dist,
        ) {
            Ok(pt_world) => pcl.push(pt_world),
            Err(_) => continue,
        }
    }
    utils::median_point(&pcl)
}

/// Maximum-weight assignment on a score matrix; entries with zero score are
/// never assigned. Returns accepted (row, column) pairs.
fn max_weight_assignment(scores: &na::DMatrix<f64>) -> Vec<(usize, usize)> {
    let (rows, cols) = scores.shape();
    if rows == 0 || cols == 0 {
        return Vec::new();
    }
    // lapjv minimizes over a square matrix: negate the scores and pad with
    // zeros, which are never better than a positive score
    let size = rows.max(cols);
    let mut data = vec![0.0f64; size * size];
    for i in 0..rows {
        for j in 0..cols {
            data[i * size + j] = -scores[(i, j)];
        }
    }
    let matrix = Matrix::from_shape_vec((size, size), data).expect("square cost matrix");
    let Ok((row_assignment, _)) = lapjv(&matrix) else {
        log::warn!("Assignment failed, no matches this frame");
        return Vec::new();
    };
    row_assignment
        .iter()
        .enumerate()
        .filter(|&(i, &j)| i < rows && j < cols && scores[(i, j)] > 0.0)
        .map(|(i, &j)| (i, j))
        .collect()
}

/// Three-stage data association between the frame's detections and the active
/// tracks.
///
/// Stage A scores (detection, track) pairs of matching class by PnP inlier
/// ratio, gated by motion plausibility, and solves a maximum-weight
/// assignment. Stage B corroborates still-unmatched detections through their
/// external 2D-tracker ids (unless `TRUST_2D` is `"no"`). Stage C assigns the
/// remainder purely by inverse 3D distance. With `TRUST_2D == "no"`, leftover
/// detections spawn new tracks with monotonically increasing ids.
///
/// Marks tracks that project outside the image as not in view, and maintains
/// the external-to-internal id mapping.
#[allow(clippy::too_many_arguments)]
pub fn improve_association(
    detections: &mut [StereoObjectDetection],
    tracks: &mut BTreeMap<TrackId, ObjectTrack>,
    t_world_cam: &na::Isometry3<f64>,
    stereo_cam: &StereoCamera,
    stereo_image: &StereoImage,
    img_id: ImageId,
    all_track_ids: &HashSet<TrackId>,
    track_id_mapping: &mut HashMap<TrackId, TrackId>,
    matcher: &dyn FeatureMatcher,
    config: &Config,
) -> AssociationResult {
    let track_ids: Vec<TrackId> = tracks.keys().copied().collect();
    let mut cost_matrix = na::DMatrix::zeros(detections.len(), track_ids.len());
    let mut all_pnp_poses: HashMap<(usize, TrackId), na::Isometry3<f64>> = HashMap::new();
    let mut matches: Vec<TrackMatch> = Vec::new();
    let mut tracks_not_in_view: HashSet<TrackId> = HashSet::new();
    let mut medians: HashMap<usize, Option<na::Vector3<f64>>> = HashMap::new();
    let mut median_translations: HashMap<TrackId, Option<f64>> = HashMap::new();
    log::debug!("{} detection(s) in image {}", detections.len(), img_id);

    // stage A: PnP + appearance scoring
    for (i, detection) in detections.iter_mut().enumerate() {
        let median = match medians.get(&i) {
            Some(median) => *median,
            None => {
                let median = stereo_pointcloud_center(
                    detection,
                    stereo_image,
                    img_id,
                    detection.left.track_id.unwrap_or_default(),
                    stereo_cam,
                    t_world_cam,
                    matcher,
                    config,
                );
                medians.insert(i, median);
                median
            }
        };
        let left_features = detection.left.features.clone().unwrap_or_default();
        for (j, track_id) in track_ids.iter().enumerate() {
            let track = tracks.get_mut(track_id).expect("id from key set");
            log::debug!(
                "Checking track {} against detection {} (tid: {:?})",
                track_id,
                i,
                detection.left.track_id
            );
            let median_translation = match median_translations.get(track_id) {
                Some(step) => *step,
                None => {
                    let step = motion::median_translation(track, config.sliding_window_ba);
                    median_translations.insert(*track_id, step);
                    step
                }
            };
            if track.cls != detection.left.cls {
                log::debug!("Wrong class!");
                continue;
            }
            if median.is_none() {
                log::debug!("No stereo matches!");
                continue;
            }
            let t_world_obj = motion::estimate_next_pose(track, config.sliding_window_ba);
            let t_cam_obj = t_world_cam.inverse() * t_world_obj;
            if !geometry::is_in_view(&track.landmarks, &t_cam_obj, &stereo_cam.left, 1) {
                log::debug!("Track {} not in view, can't match", track_id);
                track.in_view = false;
                tracks_not_in_view.insert(*track_id);
                continue;
            }
            track.in_view = true;
            let (lm_features, lm_ids) =
                landmark_descriptor_features(&track.landmarks, config.sliding_window_descriptors);
            let track_matches = matcher.match_features(&left_features, &lm_features);
            let (t_cam_obj_pnp, pnp_success, inlier_ratio) = pnp::localize_object(
                &left_features,
                &track_matches,
                &lm_ids,
                &track.landmarks,
                &t_cam_obj,
                &stereo_cam.left,
            );
            log::debug!(
                "PnP successful: {}, inlier ratio: {:.2}",
                pnp_success,
                inlier_ratio
            );
            let Some((_, t_world_obj_prev)) = track.last_pose() else {
                continue;
            };
            let t_world_obj_pnp = t_world_cam * t_cam_obj_pnp;
            let t_rel = t_world_obj_prev.inverse() * t_world_obj_pnp;
            if pnp_success
                && motion::is_valid_motion(
                    config,
                    &t_rel,
                    track.cls,
                    track.badly_tracked_frames,
                    stereo_cam,
                    median_translation,
                    track.dist_from_cam,
                    track.poses.len(),
                )
            {
                let num_inliers = inlier_ratio * track_matches.len() as f64;
                let score =
                    num_inliers / lm_features.len().min(track.landmarks.len()).max(1) as f64;
                cost_matrix[(i, j)] = score;
                all_pnp_poses.insert((i, *track_id), t_cam_obj_pnp);
            }
        }
    }

    let mut matched_tracks: HashSet<TrackId> = HashSet::new();
    let mut matched_detections: HashSet<usize> = HashSet::new();
    let mut pnp_poses: HashMap<TrackId, na::Isometry3<f64>> = HashMap::new();
    for (detection_id, j) in max_weight_assignment(&cost_matrix) {
        let track_id = track_ids[j];
        log::debug!(
            "Matched detection {} to track {} with score of {:.2}",
            detection_id,
            track_id,
            cost_matrix[(detection_id, j)]
        );
        if let Some(external_id) = detections[detection_id].left.track_id
            && external_id != track_id
        {
            track_id_mapping.insert(external_id, track_id);
        }
        matches.push(TrackMatch {
            track_id,
            detection_id,
        });
        matched_tracks.insert(track_id);
        matched_detections.insert(detection_id);
        pnp_poses.insert(track_id, all_pnp_poses[&(detection_id, track_id)]);
    }
    log::debug!(
        "{} unmatched detection(s) after 3D + appearance association",
        detections.len() - matched_detections.len()
    );

    // stage B: corroborate unmatched detections through the external tracker
    if config.trust_2d != TrustLevel::No {
        log::debug!("Corroborating unmatched associations from tracker");
        for detection_id in 0..detections.len() {
            if matched_detections.contains(&detection_id) {
                continue;
            }
            let Some(external_id) = detections[detection_id].left.track_id else {
                continue;
            };
            let track_id = *track_id_mapping.get(&external_id).unwrap_or(&external_id);
            log::debug!(
                "Checking detection {} w/ track id {}",
                detection_id,
                track_id
            );
            if matched_tracks.contains(&track_id) {
                // already matched this frame --> disregard the 2D tracker
                log::debug!("Track already matched");
                let fresh = next_fresh_track_id();
                track_id_mapping.insert(track_id, fresh);
                matched_detections.insert(detection_id);
                matches.push(TrackMatch {
                    track_id: fresh,
                    detection_id,
                });
            } else if tracks_not_in_view.contains(&track_id) {
                log::debug!("Track not in view, matching makes no sense");
                let fresh = next_fresh_track_id();
                track_id_mapping.insert(track_id, fresh);
                matched_detections.insert(detection_id);
                matches.push(TrackMatch {
                    track_id: fresh,
                    detection_id,
                });
            } else if !all_track_ids.contains(&track_id) {
                // the id is unknown to the system --> new track
                log::debug!("Track is new!");
                matched_detections.insert(detection_id);
                matches.push(TrackMatch {
                    track_id,
                    detection_id,
                });
            } else if !tracks.contains_key(&track_id) {
                // known id that is no longer active --> graveyard, new track
                log::debug!("Track is old, creating new track");
                let fresh = next_fresh_track_id();
                track_id_mapping.insert(track_id, fresh);
                matched_detections.insert(detection_id);
                matches.push(TrackMatch {
                    track_id: fresh,
                    detection_id,
                });
            } else {
                // known, active, in view and unmatched --> accept only if the
                // 3D distance is plausible
                let track = &tracks[&track_id];
                if track.cls != detections[detection_id].left.cls {
                    log::debug!("Wrong class!");
                    continue;
                }
                let Some(median) = medians.get(&detection_id).copied().flatten() else {
                    log::debug!("No stereo matches, trusting tracker");
                    continue;
                };
                let Some((_, prev_location)) = track.last_location() else {
                    continue;
                };
                let dist = (median - prev_location).norm();
                let max_dist = motion::max_valid_translation(
                    config,
                    track.cls,
                    track.badly_tracked_frames,
                    stereo_cam,
                    median_translations.get(&track_id).copied().flatten(),
                    track.dist_from_cam,
                    track.poses.len(),
                );
                log::debug!("Dist/max. dist: {:.2}/{:.2}", dist, max_dist);
                if dist.is_finite() && dist < max_dist {
                    log::debug!("2D association makes sense in 3D");
                    matches.push(TrackMatch {
                        track_id,
                        detection_id,
                    });
                    matched_detections.insert(detection_id);
                    matched_tracks.insert(track_id);
                } else {
                    log::debug!("2D association does not make sense in 3D");
                }
            }
        }
    }

    // stage C: purely 3D association of the remainder
    log::debug!("Associating using only 3D info");
    let unmatched_detection_ids: Vec<usize> = (0..detections.len())
        .filter(|id| !matched_detections.contains(id))
        .collect();
    let unmatched_track_ids: Vec<TrackId> = track_ids
        .iter()
        .copied()
        .filter(|id| !matched_tracks.contains(id))
        .collect();
    let mut cost_matrix =
        na::DMatrix::zeros(unmatched_detection_ids.len(), unmatched_track_ids.len());
    for (row, detection_id) in unmatched_detection_ids.iter().enumerate() {
        for (col, track_id) in unmatched_track_ids.iter().enumerate() {
            if tracks_not_in_view.contains(track_id) {
                continue;
            }
            let track = &tracks[track_id];
            if track.cls != detections[*detection_id].left.cls {
                continue;
            }
            let Some(median) = medians.get(detection_id).copied().flatten() else {
                continue;
            };
            let Some((_, prev_location)) = track.last_location() else {
                continue;
            };
            let dist = (median - prev_location).norm();
            let max_dist = motion::max_valid_translation(
                config,
                track.cls,
                track.badly_tracked_frames,
                stereo_cam,
                median_translations.get(track_id).copied().flatten(),
                track.dist_from_cam,
                track.poses.len(),
            );
            if !dist.is_finite() || dist > max_dist {
                continue;
            }
            cost_matrix[(row, col)] = 1.0 / dist.max(1e-9);
        }
    }
    for (row, col) in max_weight_assignment(&cost_matrix) {
        let detection_id = unmatched_detection_ids[row];
        let track_id = unmatched_track_ids[col];
        log::debug!(
            "Matched detection {} to track {} with dist of {:.2}",
            detection_id,
            track_id,
            1.0 / cost_matrix[(row, col)]
        );
        if let Some(external_id) = detections[detection_id].left.track_id
            && external_id != track_id
        {
            track_id_mapping.insert(external_id, track_id);
        }
        matches.push(TrackMatch {
            track_id,
            detection_id,
        });
        matched_tracks.insert(track_id);
        matched_detections.insert(detection_id);
    }

    // without trust in the external tracker, leftovers become new tracks
    if config.trust_2d == TrustLevel::No {
        let mut next_id = all_track_ids.iter().copied().max().unwrap_or(0) + 1;
        for detection_id in 0..detections.len() {
            if matched_detections.contains(&detection_id) {
                continue;
            }
            log::debug!("Creating new track with id {}", next_id);
            matched_detections.insert(detection_id);
            matches.push(TrackMatch {
                track_id: next_id,
                detection_id,
            });
            next_id += 1;
        }
    }

    let unmatched_tracks: HashSet<TrackId> = track_ids
        .iter()
        .copied()
        .filter(|id| !matched_tracks.contains(id))
        .collect();
    log::debug!("{} valid track match(es) in total", matched_tracks.len());
    AssociationResult {
        matches,
        unmatched_tracks,
        pnp_poses,
    }
}
