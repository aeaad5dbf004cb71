use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

extern crate nalgebra as na;

use crate::feature::{Feature, Match};
use crate::geometry::mask::Mask;

pub type ImageId = u64;
pub type TrackId = u64;
pub type LandmarkId = u64;

/// Landmark ids are unique across all tracks of a process.
static NEXT_LANDMARK_ID: AtomicU64 = AtomicU64::new(0);

/// Internal track ids allocated by the tracker itself live above the id space
/// used by external 2D trackers, so a fresh id can never collide with an
/// external one.
const FRESH_TRACK_ID_BASE: u64 = 1 << 32;
static NEXT_FRESH_TRACK_ID: AtomicU64 = AtomicU64::new(FRESH_TRACK_ID_BASE);

pub fn next_landmark_id() -> LandmarkId {
    NEXT_LANDMARK_ID.fetch_add(1, Ordering::Relaxed)
}

pub fn next_fresh_track_id() -> TrackId {
    NEXT_FRESH_TRACK_ID.fetch_add(1, Ordering::Relaxed)
}

/// A single grayscale image as a row-major byte array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl Image {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height],
        }
    }
}

/// A rectified stereo image pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StereoImage {
    pub left: Image,
    pub right: Image,
}

impl StereoImage {
    pub fn img_shape(&self) -> (usize, usize) {
        (self.left.width, self.left.height)
    }
}

/// Object classes recognized by the tracker. Classes only parameterize the
/// per-class constants of the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectClass {
    Car,
    Pedestrian,
}

impl Display for ObjectClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectClass::Car => write!(f, "car"),
            ObjectClass::Pedestrian => write!(f, "pedestrian"),
        }
    }
}

/// Pixel coordinates of an observation. Stereo observations additionally carry
/// the column of the matched feature in the right image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ImagePoint {
    Mono { u: f64, v: f64 },
    Stereo { u: f64, v: f64, u_right: f64 },
}

impl ImagePoint {
    pub fn u(&self) -> f64 {
        match self {
            ImagePoint::Mono { u, .. } | ImagePoint::Stereo { u, .. } => *u,
        }
    }

    pub fn v(&self) -> f64 {
        match self {
            ImagePoint::Mono { v, .. } | ImagePoint::Stereo { v, .. } => *v,
        }
    }

    pub fn is_stereo(&self) -> bool {
        matches!(self, ImagePoint::Stereo { .. })
    }
}

/// A single measurement of a landmark in one image.
#[derive(Debug, Clone)]
pub struct Observation {
    pub descriptor: na::DVector<f64>,
    pub pt: ImagePoint,
    pub img_id: ImageId,
}

/// A 3D point in the object frame of its track, together with every
/// observation it accumulated. A landmark always has at least one observation.
#[derive(Debug, Clone)]
pub struct Landmark {
    pub pt_3d: na::Vector3<f64>,
    pub observations: Vec<Observation>,
}

impl Landmark {
    pub fn new(pt_3d: na::Vector3<f64>, first_observation: Observation) -> Self {
        Self {
            pt_3d,
            observations: vec![first_observation],
        }
    }
}

/// A 2D object detection in a single camera.
#[derive(Debug, Clone)]
pub struct ObjectDetection {
    pub mask: Mask,
    pub cls: ObjectClass,
    /// Track id assigned by an external 2D tracker, if any.
    pub track_id: Option<TrackId>,
    /// Features detected on the masked region, populated on first use.
    pub features: Option<Vec<Feature>>,
}

impl ObjectDetection {
    pub fn new(mask: Mask, cls: ObjectClass) -> Self {
        Self {
            mask,
            cls,
            track_id: None,
            features: None,
        }
    }
}

/// A left/right detection pair of the same physical object.
#[derive(Debug, Clone)]
pub struct StereoObjectDetection {
    pub left: ObjectDetection,
    pub right: ObjectDetection,
    /// Left-right feature matches, populated on first use.
    pub stereo_matches: Option<Vec<Match>>,
}

impl StereoObjectDetection {
    pub fn new(left: ObjectDetection, right: ObjectDetection) -> Self {
        Self {
            left,
            right,
            stereo_matches: None,
        }
    }
}

/// An association between a detection index and a track id, valid for one
/// frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackMatch {
    pub track_id: TrackId,
    pub detection_id: usize,
}

/// One tracked dynamic object.
///
/// Landmarks are expressed in the track's own object frame; `poses` maps each
/// processed frame to the object-to-world transform. Since frames are
/// processed in ascending order, the `BTreeMap` key order equals insertion
/// order for all per-frame maps.
#[derive(Debug, Clone)]
pub struct ObjectTrack {
    pub cls: ObjectClass,
    pub masks: (Option<Mask>, Option<Mask>),
    pub landmarks: HashMap<LandmarkId, Landmark>,
    pub poses: BTreeMap<ImageId, na::Isometry3<f64>>,
    /// Per-frame online location estimates, in world coordinates.
    pub locations: BTreeMap<ImageId, na::Vector3<f64>>,
    /// Per-frame landmark cluster centers, in the object frame.
    pub pcl_centers: BTreeMap<ImageId, na::Vector3<f64>>,
    /// Per-frame heading angle in camera coordinates.
    pub rot_angles: BTreeMap<ImageId, f64>,
    pub active: bool,
    pub in_view: bool,
    pub badly_tracked_frames: usize,
    pub dist_from_cam: f64,
}

impl ObjectTrack {
    /// Create a track for a first detection, seeded with the given pose.
    pub fn new(
        cls: ObjectClass,
        masks: (Option<Mask>, Option<Mask>),
        img_id: ImageId,
        t_world_obj: na::Isometry3<f64>,
    ) -> Self {
        let mut poses = BTreeMap::new();
        poses.insert(img_id, t_world_obj);
        Self {
            cls,
            masks,
            landmarks: HashMap::new(),
            poses,
            locations: BTreeMap::new(),
            pcl_centers: BTreeMap::new(),
            rot_angles: BTreeMap::new(),
            active: true,
            in_view: true,
            badly_tracked_frames: 0,
            dist_from_cam: 0.0,
        }
    }

    /// The most recent pose, if any.
    pub fn last_pose(&self) -> Option<(ImageId, &na::Isometry3<f64>)> {
        self.poses.iter().next_back().map(|(id, pose)| (*id, pose))
    }

    /// The most recent online location, if any.
    pub fn last_location(&self) -> Option<(ImageId, &na::Vector3<f64>)> {
        self.locations
            .iter()
            .next_back()
            .map(|(id, loc)| (*id, loc))
    }

    /// Positions of all landmarks, in the object frame.
    pub fn landmark_points(&self) -> Vec<na::Vector3<f64>> {
        self.landmarks.values().map(|lm| lm.pt_3d).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generators_are_unique() {
        let landmark_ids: Vec<_> = (0..100).map(|_| next_landmark_id()).collect();
        for (i, a) in landmark_ids.iter().enumerate() {
            for b in &landmark_ids[i + 1..] {
                assert_ne!(a, b);
            }
        }
        let t0 = next_fresh_track_id();
        let t1 = next_fresh_track_id();
        assert!(t1 > t0);
        assert!(t0 >= FRESH_TRACK_ID_BASE);
    }

    #[test]
    fn test_pose_order_is_frame_order() {
        let mut track = ObjectTrack::new(
            ObjectClass::Car,
            (None, None),
            3,
            na::Isometry3::identity(),
        );
        track
            .poses
            .insert(7, na::Isometry3::translation(1.0, 0.0, 0.0));
        track
            .poses
            .insert(5, na::Isometry3::translation(0.5, 0.0, 0.0));
        let keys: Vec<_> = track.poses.keys().copied().collect();
        assert_eq!(keys, vec![3, 5, 7]);
        assert_eq!(track.last_pose().unwrap().0, 7);
    }

    #[test]
    fn test_image_point() {
        let mono = ImagePoint::Mono { u: 1.0, v: 2.0 };
        let stereo = ImagePoint::Stereo {
            u: 1.0,
            v: 2.0,
            u_right: 0.5,
        };
        assert!(!mono.is_stereo());
        assert!(stereo.is_stereo());
        assert_eq!(mono.u(), stereo.u());
        assert_eq!(mono.v(), stereo.v());
    }

    #[test]
    fn test_class_serde_names() {
        assert_eq!(serde_json::to_string(&ObjectClass::Car).unwrap(), "\"car\"");
        assert_eq!(
            serde_json::from_str::<ObjectClass>("\"pedestrian\"").unwrap(),
            ObjectClass::Pedestrian
        );
    }
}
