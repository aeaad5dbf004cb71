//! End-to-end tests of the tracking pipeline on a synthetic scene with an
//! exact feature matcher.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;

use crossbeam::channel::unbounded;
use map_macro::hash_map;

use nalgebra as na;

use stereo_mot::camera::{CameraParameters, StereoCamera};
use stereo_mot::config::{Config, TrustLevel};
use stereo_mot::feature::{CameraSide, Feature, FeatureMatcher, Match};
use stereo_mot::geometry::mask::Mask;
use stereo_mot::mot::{
    MotQueues, SharedFrameData, StepSignal, TrackingResult, Writer2dRecord, Writer3dRecord, run,
};
use stereo_mot::track::{
    Image, ImageId, ObjectClass, ObjectDetection, ObjectTrack, StereoImage,
    StereoObjectDetection, TrackId,
};

const IMG_WIDTH: usize = 256;
const IMG_HEIGHT: usize = 160;

fn test_rig() -> StereoCamera {
    StereoCamera::with_baseline(
        CameraParameters::new(200.0, 200.0, 128.0, 80.0),
        0.5,
    )
}

/// A rigid cloud of world points moving with constant velocity, optionally
/// teleporting at a given frame (to provoke the motion gate).
#[derive(Clone)]
struct SceneObject {
    points: Vec<na::Vector3<f64>>,
    velocity: na::Vector3<f64>,
    jump: Option<(ImageId, na::Vector3<f64>)>,
}

impl SceneObject {
    fn stationary(center: na::Vector3<f64>) -> Self {
        let mut points = Vec::new();
        for x in [-1.0, 0.0, 1.0] {
            for y in [-0.5, 0.5] {
                for z in [-0.6, 0.6] {
                    points.push(center + na::Vector3::new(x, y, z));
                }
            }
        }
        Self {
            points,
            velocity: na::Vector3::zeros(),
            jump: None,
        }
    }

    fn offset_at(&self, img_id: ImageId) -> na::Vector3<f64> {
        let mut offset = self.velocity * img_id as f64;
        if let Some((jump_frame, jump)) = self.jump
            && img_id >= jump_frame
        {
            offset += jump;
        }
        offset
    }

    fn world_points(&self, img_id: ImageId) -> Vec<na::Vector3<f64>> {
        let offset = self.offset_at(img_id);
        self.points.iter().map(|p| p + offset).collect()
    }
}

/// Projects the scene exactly; descriptors identify (object, point) pairs.
/// The ego pose is the identity in all tests, so world and left-camera frames
/// coincide.
struct FakeMatcher {
    scene: Vec<SceneObject>,
    rig: StereoCamera,
}

impl FakeMatcher {
    fn project(&self, pt_world: &na::Vector3<f64>, side: CameraSide) -> Option<na::Vector2<f64>> {
        let pt_cam = match side {
            CameraSide::Left => *pt_world,
            CameraSide::Right => {
                (self.rig.t_left_right.inverse() * na::Point3::from(*pt_world)).coords
            }
        };
        if pt_cam.z <= 0.0 {
            return None;
        }
        let params = match side {
            CameraSide::Left => &self.rig.left,
            CameraSide::Right => &self.rig.right,
        };
        let pt_2d = params.project(&pt_cam);
        (pt_2d.x >= 0.0
            && pt_2d.x < IMG_WIDTH as f64
            && pt_2d.y >= 0.0
            && pt_2d.y < IMG_HEIGHT as f64)
            .then_some(pt_2d)
    }
}

fn descriptor(obj_idx: usize, pt_idx: usize) -> na::DVector<f64> {
    na::DVector::from_row_slice(&[(obj_idx * 1000 + pt_idx * 10) as f64])
}

impl FeatureMatcher for FakeMatcher {
    fn detect_features(
        &self,
        _image: &Image,
        mask: Option<&Mask>,
        img_id: ImageId,
        _track_id: TrackId,
        side: CameraSide,
    ) -> Vec<Feature> {
        let mut features = Vec::new();
        for (obj_idx, object) in self.scene.iter().enumerate() {
            for (pt_idx, pt_world) in object.world_points(img_id).iter().enumerate() {
                let Some(pt_2d) = self.project(pt_world, side) else {
                    continue;
                };
                if let Some(mask) = mask
                    && !mask.get(pt_2d.x.round() as usize, pt_2d.y.round() as usize)
                {
                    continue;
                }
                features.push(Feature::new(pt_2d.x, pt_2d.y, descriptor(obj_idx, pt_idx)));
            }
        }
        features
    }

    fn match_features(&self, first: &[Feature], second: &[Feature]) -> Vec<Match> {
        let mut used = HashSet::new();
        let mut matches = Vec::new();
        for (i, feature) in first.iter().enumerate() {
            let mut best: Option<(usize, f64)> = None;
            for (j, other) in second.iter().enumerate() {
                if used.contains(&j) {
                    continue;
                }
                let dist = (&feature.descriptor - &other.descriptor).norm();
                if best.is_none_or(|(_, best_dist)| dist < best_dist) {
                    best = Some((j, dist));
                }
            }
            if let Some((j, dist)) = best
                && dist < 0.5
            {
                used.insert(j);
                matches.push((i, j));
            }
        }
        matches
    }
}

/// Build a detection of one scene object: its mask is the padded bounding box
/// of the object's projections.
fn make_detection(
    matcher: &FakeMatcher,
    obj_idx: usize,
    img_id: ImageId,
    external_id: Option<TrackId>,
) -> StereoObjectDetection {
    let bbox_mask = |side: CameraSide| {
        let mut mask = Mask::new(IMG_WIDTH, IMG_HEIGHT);
        let points: Vec<na::Vector2<f64>> = matcher.scene[obj_idx]
            .world_points(img_id)
            .iter()
            .filter_map(|p| matcher.project(p, side))
            .collect();
        if points.is_empty() {
            return mask;
        }
        let min_x = points.iter().map(|p| p.x).fold(f64::INFINITY, f64::min) - 4.0;
        let max_x = points.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max) + 4.0;
        let min_y = points.iter().map(|p| p.y).fold(f64::INFINITY, f64::min) - 4.0;
        let max_y = points.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max) + 4.0;
        for y in (min_y.max(0.0) as usize)..=(max_y.min(IMG_HEIGHT as f64 - 1.0) as usize) {
            for x in (min_x.max(0.0) as usize)..=(max_x.min(IMG_WIDTH as f64 - 1.0) as usize) {
                mask.set(x, y, true);
            }
        }
        mask
    };
    let mut left = ObjectDetection::new(bbox_mask(CameraSide::Left), ObjectClass::Car);
    left.track_id = external_id;
    let mut right = ObjectDetection::new(bbox_mask(CameraSide::Right), ObjectClass::Car);
    right.track_id = external_id;
    StereoObjectDetection::new(left, right)
}

struct PipelineOutput {
    shared: Vec<SharedFrameData>,
    saw_sentinel: bool,
    writer_2d: Vec<Writer2dRecord>,
    writer_3d: Vec<Writer3dRecord>,
    result: TrackingResult,
}

/// Feed `frames` through the pipeline. Each frame is a list of
/// (object index, external track id) detections.
fn run_pipeline(
    scene: Vec<SceneObject>,
    frames: Vec<Vec<(usize, Option<TrackId>)>>,
    config: Config,
) -> PipelineOutput {
    let _ = env_logger::builder().is_test(true).try_init();
    let rig = test_rig();
    let matcher = FakeMatcher {
        scene,
        rig: rig.clone(),
    };
    let num_frames = frames.len();
    let detections: Vec<Vec<StereoObjectDetection>> = frames
        .iter()
        .enumerate()
        .map(|(img_id, detections)| {
            detections
                .iter()
                .map(|(obj_idx, external_id)| {
                    make_detection(&matcher, *obj_idx, img_id as ImageId, *external_id)
                })
                .collect()
        })
        .collect();
    let images: Vec<(ImageId, StereoImage)> = (0..num_frames)
        .map(|img_id| {
            (
                img_id as ImageId,
                StereoImage {
                    left: Image::new(IMG_WIDTH, IMG_HEIGHT),
                    right: Image::new(IMG_WIDTH, IMG_HEIGHT),
                },
            )
        })
        .collect();

    let (slam_sender, slam_receiver) = unbounded();
    let (shared_sender, shared_receiver) = unbounded();
    let (writer_2d_sender, writer_2d_receiver) = unbounded();
    let (writer_3d_sender, writer_3d_receiver) = unbounded();
    let (result_sender, result_receiver) = unbounded();
    for img_id in 0..num_frames {
        slam_sender
            .send(vec![na::Isometry3::identity(); img_id + 1])
            .unwrap();
    }
    let queues = MotQueues {
        slam_data: slam_receiver,
        shared_data: shared_sender,
        writer_data_2d: Some(writer_2d_sender),
        writer_data_3d: Some(writer_3d_sender),
        returned_data: result_sender,
    };
    let stop_flag = Arc::new(AtomicBool::new(false));
    let next_step = Arc::new(StepSignal::new());
    let worker = thread::spawn(move || {
        run(
            images,
            detections,
            rig,
            Arc::new(matcher),
            config,
            queues,
            stop_flag,
            next_step,
            -1,
        );
    });

    let mut shared = Vec::new();
    let mut saw_sentinel = false;
    while let Ok(message) = shared_receiver.recv() {
        match message {
            Some(record) => shared.push(record),
            None => {
                saw_sentinel = true;
                break;
            }
        }
    }
    let result = result_receiver.recv().expect("tracking result");
    worker.join().expect("pipeline thread panicked");
    let writer_2d = writer_2d_receiver.iter().flatten().collect();
    let writer_3d = writer_3d_receiver.iter().flatten().collect();
    PipelineOutput {
        shared,
        saw_sentinel,
        writer_2d,
        writer_3d,
        result,
    }
}

fn assert_track_invariants(track: &ObjectTrack) {
    let pose_keys: Vec<_> = track.poses.keys().collect();
    assert_eq!(pose_keys, track.pcl_centers.keys().collect::<Vec<_>>());
    assert_eq!(pose_keys, track.locations.keys().collect::<Vec<_>>());
    assert_eq!(pose_keys, track.rot_angles.keys().collect::<Vec<_>>());
    for landmark in track.landmarks.values() {
        assert!(!landmark.observations.is_empty());
    }
}

fn test_config() -> Config {
    Config {
        min_landmarks_car: 5,
        ..Default::default()
    }
}

#[test]
fn test_empty_detections_emit_empty_records_then_sentinel() {
    let frames = vec![Vec::new(); 10];
    let output = run_pipeline(Vec::new(), frames, test_config());
    assert_eq!(output.shared.len(), 10);
    for (img_id, record) in output.shared.iter().enumerate() {
        assert_eq!(record.img_id, img_id as ImageId);
        assert!(record.object_tracks.is_empty());
    }
    assert!(output.saw_sentinel);
    assert!(output.result.trajectories.offline_world.is_empty());
    assert!(output.result.track_id_to_class_mapping.is_empty());
}

#[test]
fn test_single_stationary_car() {
    let scene = vec![SceneObject::stationary(na::Vector3::new(0.0, 0.0, 10.0))];
    let frames = vec![vec![(0, Some(1))]; 30];
    let output = run_pipeline(scene, frames, test_config());

    assert_eq!(
        output.result.track_id_to_class_mapping,
        hash_map! { 1u64 => ObjectClass::Car }
    );
    let offline = &output.result.trajectories.offline_world[&1];
    let online = &output.result.trajectories.online_world[&1];
    assert_eq!(offline.len(), 30);
    for (img_id, offline_pt) in offline {
        let online_pt = online[img_id];
        let offline_pt = na::Vector3::new(offline_pt.0, offline_pt.1, offline_pt.2);
        let online_pt = na::Vector3::new(online_pt.0, online_pt.1, online_pt.2);
        assert!(
            (offline_pt - online_pt).norm() < 0.5,
            "frame {}: offline {:?} vs online {:?}",
            img_id,
            offline_pt,
            online_pt
        );
        // both sit near the true object center
        assert!((offline_pt - na::Vector3::new(0.0, 0.0, 10.0)).norm() < 1.0);
    }
    // the track survived the whole run
    let last = output.shared.last().unwrap();
    assert_eq!(last.object_tracks.len(), 1);
    let track = &last.object_tracks[&1];
    assert!(track.active);
    assert_eq!(track.badly_tracked_frames, 0);
    assert_track_invariants(track);
}

#[test]
fn test_detection_dropout_preserves_identity() {
    let scene = vec![SceneObject::stationary(na::Vector3::new(0.0, 0.0, 10.0))];
    let mut frames: Vec<Vec<(usize, Option<TrackId>)>> = Vec::new();
    for img_id in 0..14 {
        if (10..13).contains(&img_id) {
            frames.push(Vec::new());
        } else {
            frames.push(vec![(0, Some(1))]);
        }
    }
    let output = run_pipeline(scene, frames, test_config());

    // one identity across the dropout
    assert_eq!(output.result.track_id_to_class_mapping.len(), 1);
    assert!(output.result.track_id_to_class_mapping.contains_key(&1));
    // badly tracked frames count up through the dropout and reset on re-match
    let badly: Vec<usize> = output
        .shared
        .iter()
        .map(|record| record.object_tracks[&1].badly_tracked_frames)
        .collect();
    assert_eq!(badly[9], 0);
    assert_eq!(badly[10], 1);
    assert_eq!(badly[11], 2);
    assert_eq!(badly[12], 3);
    assert_eq!(badly[13], 0);
    // the dropout frames still got extrapolated poses
    let track = &output.shared[13].object_tracks[&1];
    for img_id in 10..13u64 {
        assert!(track.poses.contains_key(&img_id));
    }
    assert_track_invariants(track);
}

#[test]
fn test_gate_rejects_implausible_pnp_pose() {
    // the object teleports 20m down the optical axis at frame 5 (staying in
    // view); the PnP pose must be discarded in favor of the prediction
    let mut object = SceneObject::stationary(na::Vector3::new(0.0, 0.0, 10.0));
    object.jump = Some((5, na::Vector3::new(0.0, 0.0, 20.0)));
    let config = Config {
        trust_2d: TrustLevel::Yes,
        min_landmarks_car: 5,
        frame_rate: 30.0,
        ..Default::default()
    };
    let frames = vec![vec![(0, Some(1))]; 7];
    let output = run_pipeline(vec![object], frames, config);

    let track = &output.shared[5].object_tracks[&1];
    let pose_before = track.poses[&4].translation.vector;
    let pose_after = track.poses[&5].translation.vector;
    // accepted pose equals the (stationary) prediction, not the 20m jump
    assert!(
        (pose_after - pose_before).norm() < 1e-6,
        "pose jumped by {}",
        (pose_after - pose_before).norm()
    );
    // the frame still counts as matched
    assert_eq!(track.badly_tracked_frames, 0);
}

#[test]
fn test_identity_collision_spawns_fresh_track() {
    let scene = vec![
        SceneObject::stationary(na::Vector3::new(0.0, 0.0, 10.0)),
        SceneObject::stationary(na::Vector3::new(6.0, 0.0, 12.0)),
    ];
    let mut frames: Vec<Vec<(usize, Option<TrackId>)>> = vec![vec![(0, Some(1))]; 3];
    // frame 3: two detections sharing external id 1
    frames.push(vec![(0, Some(1)), (1, Some(1))]);
    let output = run_pipeline(scene, frames, test_config());

    let last = output.shared.last().unwrap();
    assert_eq!(last.object_tracks.len(), 2);
    assert!(last.object_tracks.contains_key(&1));
    let fresh_ids: Vec<TrackId> = last
        .object_tracks
        .keys()
        .copied()
        .filter(|id| *id != 1)
        .collect();
    assert_eq!(fresh_ids.len(), 1);
    // the fresh internal id lives outside the external id space
    assert!(fresh_ids[0] >= 1 << 32);

    // landmark ids are globally unique across tracks
    let mut all_landmark_ids = HashSet::new();
    for track in last.object_tracks.values() {
        for id in track.landmarks.keys() {
            assert!(all_landmark_ids.insert(*id), "landmark id collision");
        }
        assert_track_invariants(track);
    }
}

#[test]
fn test_writer_queues_emit_filtered_records() {
    let scene = vec![SceneObject::stationary(na::Vector3::new(0.0, 0.0, 10.0))];
    let frames = vec![vec![(0, Some(1))]; 6];
    let config = Config {
        min_landmarks_car: 5,
        save_updated_2d_track: true,
        save_3d_track: true,
        ..Default::default()
    };
    let output = run_pipeline(scene, frames, config);

    assert_eq!(output.writer_2d.len(), 6);
    for (img_id, record) in output.writer_2d.iter().enumerate() {
        assert_eq!(record.img_id, img_id as ImageId);
        assert_eq!(record.track_ids, vec![1]);
        assert_eq!(record.object_classes, vec![ObjectClass::Car]);
        assert_eq!(record.masks.len(), 1);
        assert!(!record.masks[0].is_empty());
    }
    assert_eq!(output.writer_3d.len(), 6);
    for record in &output.writer_3d {
        assert!(record.tracks.contains_key(&1));
        assert!(!record.tracks[&1].landmarks.is_empty());
    }

    // the final result serializes for downstream consumers
    let json = serde_json::to_string(&output.result).unwrap();
    assert!(json.contains("\"offline_world\""));
}

#[test]
fn test_lost_track_moves_to_graveyard() {
    let scene = vec![SceneObject::stationary(na::Vector3::new(0.0, 0.0, 10.0))];
    let mut frames: Vec<Vec<(usize, Option<TrackId>)>> = vec![vec![(0, Some(1))]; 10];
    frames.extend(vec![Vec::new(); 6]);
    let output = run_pipeline(scene, frames, test_config());

    // with KEEP_TRACK_FOR_N_FRAMES_AFTER_LOST = 5 the track is deactivated
    // once badly_tracked_frames exceeds it, at frame 15
    let last = output.shared.last().unwrap();
    assert_eq!(last.img_id, 15);
    assert!(last.object_tracks.is_empty());
    // the graveyarded track still contributes to the final trajectories
    assert!(output.result.trajectories.offline_world.contains_key(&1));
    assert!(!output.result.trajectories.offline_world[&1].is_empty());
}
