//! The multi-object tracking core: per-frame association, per-track pose
//! estimation and landmark refinement, and the run loop tying the stages
//! together.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crossbeam::channel::{Receiver, Sender};
use serde::Serialize;

extern crate nalgebra as na;

use crate::camera::StereoCamera;
use crate::config::{Config, TrustLevel};
use crate::feature::{CameraSide, Feature, FeatureMatcher, Match, landmark_descriptor_features};
use crate::geometry::mask::{Mask, masks_from_landmarks};
use crate::track::{
    ImageId, ObjectClass, ObjectTrack, StereoImage, StereoObjectDetection, TrackId, TrackMatch,
};
use crate::utils;

/// Per-frame data association
pub mod association;

/// Sliding-window bundle adjustment over a track's poses and landmarks
pub mod ba;

/// Landmark and observation bookkeeping
pub mod landmarks;

/// Motion prediction and the plausibility gate
pub mod motion;

/// Robust object localization from 2D-3D correspondences
pub mod pnp;

/// Everything published downstream for one processed frame.
#[derive(Debug, Clone)]
pub struct SharedFrameData {
    pub object_tracks: BTreeMap<TrackId, ObjectTrack>,
    pub stereo_image: StereoImage,
    pub all_left_features: Vec<Vec<Feature>>,
    pub all_right_features: Vec<Vec<Feature>>,
    pub all_stereo_matches: Vec<Vec<Match>>,
    pub img_id: ImageId,
    pub current_cam_pose: na::Isometry3<f64>,
}

/// Per-frame record for the 2D overlay writer.
#[derive(Debug, Clone)]
pub struct Writer2dRecord {
    pub track_ids: Vec<TrackId>,
    pub img_id: ImageId,
    pub object_classes: Vec<ObjectClass>,
    pub masks: Vec<Mask>,
}

/// Per-frame record for the 3D visualization writer.
#[derive(Debug, Clone)]
pub struct Writer3dRecord {
    pub t_world_cam: na::Isometry3<f64>,
    pub tracks: BTreeMap<TrackId, ObjectTrack>,
    pub img_id: ImageId,
}

pub type TrajectoryMap = HashMap<TrackId, BTreeMap<ImageId, (f64, f64, f64)>>;

/// Estimated per-track trajectories: refined (offline) poses and the
/// per-frame (online) location estimates, each in world and camera frames.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Trajectories {
    pub offline_world: TrajectoryMap,
    pub offline_cam: TrajectoryMap,
    pub online_world: TrajectoryMap,
    pub online_cam: TrajectoryMap,
}

/// Everything returned at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct TrackingResult {
    pub trajectories: Trajectories,
    pub point_cloud_sizes: HashMap<TrackId, Vec<usize>>,
    pub track_id_to_class_mapping: HashMap<TrackId, ObjectClass>,
}

/// A level-triggered step gate: the run loop blocks on [`StepSignal::wait`]
/// between frames when not in continuous mode, and a controller releases one
/// frame at a time with [`StepSignal::signal`].
pub struct StepSignal {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl StepSignal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Allow the next frame to proceed.
    pub fn signal(&self) {
        *self.state.lock().unwrap() = true;
        self.condvar.notify_all();
    }

    /// Block until the signal is set.
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        while !*state {
            state = self.condvar.wait(state).unwrap();
        }
    }

    /// Reset the signal.
    pub fn clear(&self) {
        *self.state.lock().unwrap() = false;
    }
}

impl Default for StepSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The queue endpoints connecting the core to its collaborators. A `None`
/// message is the end-of-stream sentinel on every output queue.
pub struct MotQueues {
    /// Ego poses from the external SLAM process: per frame, the full ordered
    /// list of world-from-camera poses up to and including the current frame.
    pub slam_data: Receiver<Vec<na::Isometry3<f64>>>,
    pub shared_data: Sender<Option<SharedFrameData>>,
    pub writer_data_2d: Option<Sender<Option<Writer2dRecord>>>,
    pub writer_data_3d: Option<Sender<Option<Writer3dRecord>>>,
    pub returned_data: Sender<TrackingResult>,
}

/// Detect (or reuse cached) features for both sides of a detection. The
/// detection's caches are populated on first use.
pub(crate) fn extract_features(
    detection: &mut StereoObjectDetection,
    stereo_image: &StereoImage,
    img_id: ImageId,
    track_id: TrackId,
    matcher: &dyn FeatureMatcher,
    force_new: bool,
) -> (Vec<Feature>, Vec<Feature>) {
    if detection.left.features.is_none() || force_new {
        detection.left.features = Some(matcher.detect_features(
            &stereo_image.left,
            Some(&detection.left.mask),
            img_id,
            track_id,
            CameraSide::Left,
        ));
    }
    if detection.right.features.is_none() || force_new {
        detection.right.features = Some(matcher.detect_features(
            &stereo_image.right,
            Some(&detection.right.mask),
            img_id,
            track_id,
            CameraSide::Right,
        ));
    }
    (
        detection.left.features.clone().unwrap_or_default(),
        detection.right.features.clone().unwrap_or_default(),
    )
}

/// Distribute the active tracks across the bundle adjustment slots by lowest
/// load. The slot for `img_id % num_slots` defines which tracks run BA that
/// frame, so per-frame BA work stays bounded.
pub(crate) fn assign_ba_slots(track_ids: &[TrackId], num_slots: usize) -> Vec<HashSet<TrackId>> {
    let mut slots: Vec<HashSet<TrackId>> = vec![HashSet::new(); num_slots.max(1)];
    for track_id in track_ids {
        let slot_idx = (0..slots.len())
            .min_by_key(|&i| slots[i].len())
            .expect("at least one slot");
        slots[slot_idx].insert(*track_id);
    }
    slots
}

/// Process one matched (track, detection) pair. Runs on a worker with an
/// exclusive deep copy of the track and detection.
#[allow(clippy::too_many_arguments)]
fn process_match(
    mut track: ObjectTrack,
    mut detection: StereoObjectDetection,
    all_poses: &[na::Isometry3<f64>],
    track_id: TrackId,
    stereo_cam: &StereoCamera,
    img_id: ImageId,
    stereo_image: &StereoImage,
    current_cam_pose: na::Isometry3<f64>,
    run_ba: bool,
    cached_pnp_pose: Option<na::Isometry3<f64>>,
    matcher: &dyn FeatureMatcher,
    config: &Config,
) -> (ObjectTrack, Vec<Feature>, Vec<Feature>, Vec<Match>) {
    track.active = true;
    log::debug!("Track {}: image {}", track_id, img_id);
    let (left_features, right_features) = extract_features(
        &mut detection,
        stereo_image,
        img_id,
        track_id,
        matcher,
        config.force_new_detections,
    );
    let mut stereo_matches = detection
        .stereo_matches
        .clone()
        .unwrap_or_else(|| matcher.match_features(&left_features, &right_features));
    log::debug!("Track {}: {} stereo matches", track_id, stereo_matches.len());
    let (lm_features, lm_ids) =
        landmark_descriptor_features(&track.landmarks, config.sliding_window_descriptors);
    let track_matches = matcher.match_features(&left_features, &lm_features);
    log::debug!("Track {}: {} track matches", track_id, track_matches.len());

    let t_world_cam = current_cam_pose;
    let t_world_obj = motion::estimate_next_pose(&track, config.sliding_window_ba);
    let mut t_cam_obj = t_world_cam.inverse() * t_world_obj;
    let enough_track_matches = track_matches.len() >= 5;
    let mut successful = true;
    let mut valid_motion = true;
    let median_translation = motion::median_translation(&track, config.sliding_window_ba);
    if enough_track_matches {
        let (t_cam_obj_pnp, pnp_success) = match cached_pnp_pose {
            Some(pose) => {
                log::debug!("Track {}: using cached PnP pose", track_id);
                (pose, true)
            }
            None => {
                let (pose, success, _) = pnp::localize_object(
                    &left_features,
                    &track_matches,
                    &lm_ids,
                    &track.landmarks,
                    &t_cam_obj,
                    &stereo_cam.left,
                );
                (pose, success)
            }
        };
        successful = pnp_success;
        if successful && track.poses.len() >= 2 {
            let t_world_obj_prev = *track.last_pose().expect("at least two poses").1;
            let t_world_obj_pnp = t_world_cam * t_cam_obj_pnp;
            let t_rel = t_world_obj_prev.inverse() * t_world_obj_pnp;
            valid_motion = motion::is_valid_motion(
                config,
                &t_rel,
                track.cls,
                track.badly_tracked_frames,
                stereo_cam,
                median_translation,
                track.dist_from_cam,
                track.poses.len(),
            );
            if valid_motion {
                log::debug!("Track {}: PnP estimate is valid motion", track_id);
                t_cam_obj = t_cam_obj_pnp;
            }
        }
    }
    if !((enough_track_matches || track.poses.len() == 1) && successful && valid_motion) {
        log::debug!(
            "Track {}: falling back to prediction (matches: {}, pnp: {}, valid: {})",
            track_id,
            track_matches.len(),
            successful,
            valid_motion
        );
    }
    // prediction-only frames are acceptable steady-state behavior
    track.badly_tracked_frames = 0;

    let mut t_world_obj = t_world_cam * t_cam_obj;
    let current_landmarks = landmarks::add_new_landmarks_and_observations(
        &mut track.landmarks,
        &track_matches,
        &lm_ids,
        &mut stereo_matches,
        &left_features,
        &right_features,
        stereo_cam,
        &t_cam_obj,
        img_id,
        config.max_dist,
    );
    let mut current_landmark_median = if current_landmarks.is_empty() {
        utils::median_point(&track.landmark_points())
    } else {
        let (center, dist_from_cam) = landmarks::remove_outlier_landmarks(
            &mut track.landmarks,
            &current_landmarks,
            track.cls,
            &t_cam_obj,
            config,
        )
        .expect("current landmarks are non-empty");
        track.dist_from_cam = dist_from_cam;
        Some(center)
    };

    if track.poses.len() > 3 && !track.landmarks.is_empty() && run_ba {
        log::debug!("Track {}: running BA", track_id);
        track = ba::object_bundle_adjustment(
            &track,
            all_poses,
            stereo_cam,
            median_translation,
            ba::BA_DEFAULT_ITERATIONS,
            false,
            config,
        );
    }
    if !track.landmarks.is_empty() {
        track.poses.insert(img_id, t_world_obj);
    }

    // first frame: re-center the object frame onto the landmark median
    let is_first_frame =
        track.poses.len() == 1 && track.poses.keys().next() == Some(&img_id);
    if is_first_frame && !current_landmarks.is_empty() {
        let t_world_obj_old = track.poses[&img_id];
        let median = current_landmark_median.expect("current landmarks are non-empty");
        let median_world = (t_world_obj_old * na::Point3::from(median)).coords;
        let t_world_obj_new = na::Isometry3::from_parts(
            na::Translation3::from(median_world),
            na::UnitQuaternion::identity(),
        );
        let t_obj_world_new = t_world_obj_new.inverse();
        for landmark in track.landmarks.values_mut() {
            let pt_world = t_world_obj_old * na::Point3::from(landmark.pt_3d);
            landmark.pt_3d = (t_obj_world_new * pt_world).coords;
        }
        t_world_obj = t_world_obj_new;
        current_landmark_median = Some(na::Vector3::zeros());
    }

    // robust init: not enough landmarks on the first frame
    let min_landmarks = config.min_landmarks(track.cls);
    if track.poses.len() == 1 && min_landmarks > 0 && track.landmarks.len() < min_landmarks {
        log::debug!(
            "Track {}: not enough landmarks ({}) for init (min: {})",
            track_id,
            track.landmarks.len(),
            min_landmarks
        );
        track.active = false;
    }
    if track.dist_from_cam > config.max_dist {
        log::debug!(
            "Track {}: too far away: {:.1} (max: {:.1})",
            track_id,
            track.dist_from_cam,
            config.max_dist
        );
        track.active = false;
    }

    if !track.landmarks.is_empty() {
        track.poses.insert(img_id, t_world_obj);
        let median = current_landmark_median.expect("landmarks are non-empty");
        track.pcl_centers.insert(img_id, median);
        let overall_median =
            utils::median_point(&track.landmark_points()).expect("landmarks are non-empty");
        let location_obj = (median + overall_median) / 2.0;
        track
            .locations
            .insert(img_id, (t_world_obj * na::Point3::from(location_obj)).coords);
        track.rot_angles.insert(
            img_id,
            motion::rotation_of_track(&track, &t_world_cam, config.sliding_window_dir_vec),
        );
        let pcl_center_cam = t_cam_obj * na::Point3::from(median);
        if track.poses.len() > 1 && pcl_center_cam.z < 0.0 {
            log::debug!(
                "Track {} is behind camera (z: {:.1})",
                track_id,
                pcl_center_cam.z
            );
            track.active = false;
        }
    }
    (track, left_features, right_features, stereo_matches)
}

/// Extrapolate an unmatched track with its constant-velocity prediction.
/// Runs on a worker with an exclusive deep copy of the track.
fn constant_motion_update(
    mut track: ObjectTrack,
    img_id: ImageId,
    t_world_cam: &na::Isometry3<f64>,
    track_id: TrackId,
    stereo_cam: &StereoCamera,
    img_shape: (usize, usize),
    config: &Config,
) -> ObjectTrack {
    if track.poses.is_empty() {
        return track;
    }
    let t_world_obj = motion::estimate_next_pose(&track, config.sliding_window_ba);
    if track.landmarks.is_empty() {
        return track;
    }
    track.poses.insert(img_id, t_world_obj);
    let center = utils::median_point(&track.landmark_points()).expect("landmarks are non-empty");
    track.pcl_centers.insert(img_id, center);
    track
        .locations
        .insert(img_id, (t_world_obj * na::Point3::from(center)).coords);
    track.rot_angles.insert(
        img_id,
        motion::rotation_of_track(&track, t_world_cam, config.sliding_window_dir_vec),
    );
    let t_cam_obj = t_world_cam.inverse() * t_world_obj;
    if !track.in_view {
        track.masks = (None, None);
    } else {
        track.masks = masks_from_landmarks(&track.landmarks, &t_cam_obj, stereo_cam, img_shape);
    }
    let pcl_center_cam = t_cam_obj * na::Point3::from(center);
    if track.poses.len() > 1 && pcl_center_cam.z < 0.0 {
        log::debug!(
            "Track {} is behind camera (z: {:.1})",
            track_id,
            pcl_center_cam.z
        );
        track.active = false;
    }
    track
}

struct StepOutput {
    all_left_features: Vec<Vec<Feature>>,
    all_right_features: Vec<Vec<Feature>>,
    all_stereo_matches: Vec<Vec<Match>>,
    old_tracks: HashSet<TrackId>,
}

/// Process one frame: associate detections with tracks, fan out the
/// per-track work, and collect lifecycle decisions.
///
/// Matched and unmatched tracks are processed on scoped worker threads, each
/// owning an independent deep copy of its track state; results are written
/// back into the track map in a single-threaded phase afterwards.
#[allow(clippy::too_many_arguments)]
fn step(
    new_detections: &mut Vec<StereoObjectDetection>,
    stereo_image: &StereoImage,
    object_tracks: &mut BTreeMap<TrackId, ObjectTrack>,
    matcher: &dyn FeatureMatcher,
    stereo_cam: &StereoCamera,
    all_poses: &[na::Isometry3<f64>],
    img_id: ImageId,
    current_cam_pose: na::Isometry3<f64>,
    tracks_to_run_ba: &HashSet<TrackId>,
    all_track_ids: &HashSet<TrackId>,
    track_id_mapping: &mut HashMap<TrackId, TrackId>,
    config: &Config,
) -> StepOutput {
    log::debug!("-----------------------------------------");
    log::debug!("Running step for image {}", img_id);
    log::debug!(
        "Current track ids: {:?}",
        object_tracks.keys().collect::<Vec<_>>()
    );
    let (matches, unmatched_tracks, cached_pnp_poses) = if config.trust_2d != TrustLevel::Yes {
        let result = association::improve_association(
            new_detections,
            object_tracks,
            &current_cam_pose,
            stereo_cam,
            stereo_image,
            img_id,
            all_track_ids,
            track_id_mapping,
            matcher,
            config,
        );
        (result.matches, result.unmatched_tracks, result.pnp_poses)
    } else {
        // adopt the external tracker's identities directly
        let mut matches = Vec::new();
        let mut matched_ids = HashSet::new();
        for (detection_id, detection) in new_detections.iter().enumerate() {
            let Some(track_id) = detection.left.track_id else {
                log::warn!("Detection {} carries no external track id", detection_id);
                continue;
            };
            matches.push(TrackMatch {
                track_id,
                detection_id,
            });
            matched_ids.insert(track_id);
        }
        let unmatched = object_tracks
            .keys()
            .copied()
            .filter(|id| !matched_ids.contains(id))
            .collect();
        (matches, unmatched, HashMap::new())
    };

    // instantiate new tracks and refresh the masks of matched ones
    for track_match in &matches {
        let detection = &new_detections[track_match.detection_id];
        let masks = (
            Some(detection.left.mask.clone()),
            Some(detection.right.mask.clone()),
        );
        match object_tracks.get_mut(&track_match.track_id) {
            Some(track) => track.masks = masks,
            None => {
                log::debug!("Added track with ID {}", track_match.track_id);
                object_tracks.insert(
                    track_match.track_id,
                    ObjectTrack::new(detection.left.cls, masks, img_id, current_cam_pose),
                );
            }
        }
    }
    log::debug!("{} matches with object tracks", matches.len());

    let mut unmatched_sorted: Vec<TrackId> = unmatched_tracks.into_iter().collect();
    unmatched_sorted.sort_unstable();
    for track_id in &unmatched_sorted {
        if let Some(track) = object_tracks.get_mut(track_id) {
            track.badly_tracked_frames += 1;
            log::debug!(
                "Track {}: increased badly tracked frames to {}",
                track_id,
                track.badly_tracked_frames
            );
        }
    }

    // snapshot per-task state, then fan out
    let unmatched_jobs: Vec<(TrackId, ObjectTrack)> = unmatched_sorted
        .iter()
        .filter_map(|id| object_tracks.get(id).map(|track| (*id, track.clone())))
        .collect();
    let matched_jobs: Vec<(
        TrackMatch,
        ObjectTrack,
        StereoObjectDetection,
        bool,
        Option<na::Isometry3<f64>>,
    )> = matches
        .iter()
        .map(|m| {
            (
                *m,
                object_tracks[&m.track_id].clone(),
                new_detections[m.detection_id].clone(),
                tracks_to_run_ba.contains(&m.track_id),
                cached_pnp_poses.get(&m.track_id).copied(),
            )
        })
        .collect();
    let img_shape = stereo_image.img_shape();
    let (unmatched_results, matched_results) = thread::scope(|s| {
        let unmatched_handles: Vec<_> = unmatched_jobs
            .into_iter()
            .map(|(track_id, track)| {
                s.spawn(move || {
                    (
                        track_id,
                        constant_motion_update(
                            track,
                            img_id,
                            &current_cam_pose,
                            track_id,
                            stereo_cam,
                            img_shape,
                            config,
                        ),
                    )
                })
            })
            .collect();
        let matched_handles: Vec<_> = matched_jobs
            .into_iter()
            .map(|(track_match, track, detection, run_ba, cached_pose)| {
                s.spawn(move || {
                    (
                        track_match.track_id,
                        process_match(
                            track,
                            detection,
                            all_poses,
                            track_match.track_id,
                            stereo_cam,
                            img_id,
                            stereo_image,
                            current_cam_pose,
                            run_ba,
                            cached_pose,
                            matcher,
                            config,
                        ),
                    )
                })
            })
            .collect();
        (
            unmatched_handles
                .into_iter()
                .map(|handle| handle.join().expect("track worker panicked"))
                .collect::<Vec<_>>(),
            matched_handles
                .into_iter()
                .map(|handle| handle.join().expect("track worker panicked"))
                .collect::<Vec<_>>(),
        )
    });

    // single-threaded write-back phase
    let mut output = StepOutput {
        all_left_features: Vec::new(),
        all_right_features: Vec::new(),
        all_stereo_matches: Vec::new(),
        old_tracks: HashSet::new(),
    };
    for (track_id, track) in unmatched_results {
        object_tracks.insert(track_id, track);
    }
    for (track_id, (track, left_features, right_features, stereo_matches)) in matched_results {
        object_tracks.insert(track_id, track);
        output.all_left_features.push(left_features);
        output.all_right_features.push(right_features);
        output.all_stereo_matches.push(stereo_matches);
    }

    for (track_id, track) in object_tracks.iter() {
        if !track.active
            || track.badly_tracked_frames > config.keep_track_for_n_frames_after_lost
            || (track.badly_tracked_frames as f64) > 0.75 * track.poses.len() as f64
        {
            output.old_tracks.insert(*track_id);
        }
    }
    log::debug!("Deactivated {} tracks", output.old_tracks.len());
    log::debug!("Finished step {}", img_id);
    output
}

/// Run the tracking core over a stream of stereo frames and detections.
///
/// Frames are processed strictly in ascending image id. For every frame the
/// loop blocks on the ego-pose queue (guaranteeing the pose for the frame is
/// present), associates detections with tracks, fans out the per-track work,
/// and publishes an atomic snapshot to the shared-data queue. When
/// `continuous_until_img_id` is not `-1`, frames beyond it additionally wait
/// on `next_step`.
///
/// On stop (flag, input exhaustion, or an internal error) every output queue
/// receives a `None` sentinel, an optional full bundle adjustment runs, and
/// the per-track trajectories are delivered through `returned_data`.
#[allow(clippy::too_many_arguments)]
pub fn run(
    images: impl IntoIterator<Item = (ImageId, StereoImage)>,
    detections: impl IntoIterator<Item = Vec<StereoObjectDetection>>,
    stereo_cam: StereoCamera,
    matcher: Arc<dyn FeatureMatcher>,
    config: Config,
    queues: MotQueues,
    stop_flag: Arc<AtomicBool>,
    next_step: Arc<StepSignal>,
    continuous_until_img_id: i64,
) {
    let mut active_object_tracks: BTreeMap<TrackId, ObjectTrack> = BTreeMap::new();
    let mut all_object_tracks: BTreeMap<TrackId, ObjectTrack> = BTreeMap::new();
    let mut point_cloud_sizes: HashMap<TrackId, Vec<usize>> = HashMap::new();
    let mut track_id_mapping: HashMap<TrackId, TrackId> = HashMap::new();
    let mut all_poses: Vec<na::Isometry3<f64>> = Vec::new();
    let mut detections_iter = detections.into_iter();
    let matcher_ref: &dyn FeatureMatcher = matcher.as_ref();
    log::info!("Starting MOT run");

    for (img_id, stereo_image) in images {
        let mut new_detections = detections_iter.next().unwrap_or_default();
        let all_track_ids: HashSet<TrackId> = all_object_tracks
            .keys()
            .chain(active_object_tracks.keys())
            .copied()
            .collect();
        if config.track_point_cloud_sizes {
            for (track_id, track) in &active_object_tracks {
                point_cloud_sizes
                    .entry(*track_id)
                    .or_default()
                    .push(track.landmarks.len());
            }
        }
        if stop_flag.load(Ordering::SeqCst) {
            break;
        }
        if continuous_until_img_id != -1 && (img_id as i64) > continuous_until_img_id {
            next_step.wait();
        }
        next_step.clear();
        let Ok(poses) = queues.slam_data.recv() else {
            log::error!("Ego pose queue disconnected, stopping");
            break;
        };
        all_poses = poses;
        let Some(&current_cam_pose) = all_poses.get(img_id as usize) else {
            log::error!("No ego pose for image {}, stopping", img_id);
            break;
        };

        let active_ids: Vec<TrackId> = active_object_tracks.keys().copied().collect();
        let ba_slots = assign_ba_slots(&active_ids, config.ba_every_n_steps);
        let tracks_to_run_ba =
            ba_slots[(img_id as usize) % config.ba_every_n_steps.max(1)].clone();
        log::debug!("BA slots: {:?}", ba_slots);

        let output = step(
            &mut new_detections,
            &stereo_image,
            &mut active_object_tracks,
            matcher_ref,
            &stereo_cam,
            &all_poses,
            img_id,
            current_cam_pose,
            &tracks_to_run_ba,
            &all_track_ids,
            &mut track_id_mapping,
            &config,
        );

        for track_id in &output.old_tracks {
            // only keep tracks that weren't immediately deemed false positives
            let Some(track) = active_object_tracks.remove(track_id) else {
                continue;
            };
            log::debug!("Deleting {}", track_id);
            if track.poses.len() > 1 {
                all_object_tracks.insert(*track_id, track);
            }
            let source = track_id_mapping
                .iter()
                .find_map(|(external, internal)| (internal == track_id).then_some(*external));
            if let Some(source) = source {
                track_id_mapping.remove(&source);
            }
        }

        if config.save_updated_2d_track && let Some(writer) = &queues.writer_data_2d {
            let filtered: Vec<(&TrackId, &ObjectTrack)> = active_object_tracks
                .iter()
                .filter(|(_, track)| track.masks.0.is_some() && !track.landmarks.is_empty())
                .collect();
            let record = Writer2dRecord {
                track_ids: filtered.iter().map(|(id, _)| **id).collect(),
                img_id,
                object_classes: filtered.iter().map(|(_, track)| track.cls).collect(),
                masks: filtered
                    .iter()
                    .map(|(_, track)| track.masks.0.clone().expect("filtered on left mask"))
                    .collect(),
            };
            if writer.send(Some(record)).is_err() {
                log::warn!("2D writer is gone");
            }
        }
        if config.save_3d_track && let Some(writer) = &queues.writer_data_3d {
            let tracks: BTreeMap<TrackId, ObjectTrack> = active_object_tracks
                .iter()
                .filter(|(_, track)| track.masks.0.is_some() && !track.landmarks.is_empty())
                .map(|(id, track)| (*id, track.clone()))
                .collect();
            let record = Writer3dRecord {
                t_world_cam: current_cam_pose,
                tracks,
                img_id,
            };
            if writer.send(Some(record)).is_err() {
                log::warn!("3D writer is gone");
            }
        }
        let shared = SharedFrameData {
            object_tracks: active_object_tracks.clone(),
            stereo_image,
            all_left_features: output.all_left_features,
            all_right_features: output.all_right_features,
            all_stereo_matches: output.all_stereo_matches,
            img_id,
            current_cam_pose,
        };
        if queues.shared_data.send(Some(shared)).is_err() {
            log::warn!("Shared data consumer is gone");
        }
    }

    stop_flag.store(true, Ordering::SeqCst);
    let _ = queues.shared_data.send(None);
    if let Some(writer) = &queues.writer_data_2d {
        let _ = writer.send(None);
    }
    if let Some(writer) = &queues.writer_data_3d {
        let _ = writer.send(None);
    }

    all_object_tracks.append(&mut active_object_tracks);
    if config.final_full_ba && !all_poses.is_empty() {
        log::info!("Running final full BA over {} tracks", all_object_tracks.len());
        for track in all_object_tracks.values_mut() {
            let median_translation = motion::median_translation(track, config.sliding_window_ba);
            *track = ba::object_bundle_adjustment(
                track,
                &all_poses,
                &stereo_cam,
                median_translation,
                ba::BA_FULL_ITERATIONS,
                true,
                &config,
            );
        }
    }

    let track_id_to_class_mapping = all_object_tracks
        .iter()
        .map(|(id, track)| (*id, track.cls))
        .collect();
    let result = TrackingResult {
        trajectories: compute_estimated_trajectories(&all_object_tracks, &all_poses),
        point_cloud_sizes,
        track_id_to_class_mapping,
    };
    if queues.returned_data.send(result).is_err() {
        log::warn!("Result consumer is gone");
    }
    log::info!("Finished MOT run");
}

/// Offline (refined pose) and online (per-frame location) trajectories for
/// every track, in world and camera coordinates.
fn compute_estimated_trajectories(
    object_tracks: &BTreeMap<TrackId, ObjectTrack>,
    all_poses: &[na::Isometry3<f64>],
) -> Trajectories {
    let mut trajectories = Trajectories::default();
    for (track_id, track) in object_tracks {
        let mut offline_world = BTreeMap::new();
        let mut offline_cam = BTreeMap::new();
        let mut online_world = BTreeMap::new();
        let mut online_cam = BTreeMap::new();
        for (img_id, t_world_obj) in &track.poses {
            let Some(t_world_cam) = all_poses.get(*img_id as usize) else {
                continue;
            };
            let Some(object_center) = track.pcl_centers.get(img_id) else {
                continue;
            };
            let center_world = t_world_obj * na::Point3::from(*object_center);
            let center_cam = t_world_cam.inverse() * center_world;
            offline_world.insert(*img_id, (center_world.x, center_world.y, center_world.z));
            offline_cam.insert(*img_id, (center_cam.x, center_cam.y, center_cam.z));
        }
        for (img_id, location) in &track.locations {
            let Some(t_world_cam) = all_poses.get(*img_id as usize) else {
                continue;
            };
            let location_cam = t_world_cam.inverse() * na::Point3::from(*location);
            online_world.insert(*img_id, (location.x, location.y, location.z));
            online_cam.insert(*img_id, (location_cam.x, location_cam.y, location_cam.z));
        }
        trajectories.offline_world.insert(*track_id, offline_world);
        trajectories.offline_cam.insert(*track_id, offline_cam);
        trajectories.online_world.insert(*track_id, online_world);
        trajectories.online_cam.insert(*track_id, online_cam);
    }
    trajectories
}
