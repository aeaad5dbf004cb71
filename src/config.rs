use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::track::ObjectClass;

/// How much the external 2D tracker's identities are trusted during
/// association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Ignore external ids entirely; identities come from geometry alone.
    No,
    /// Use external ids only to corroborate detections that geometric
    /// association could not place.
    Partial,
    /// Adopt external ids directly without geometric association.
    Yes,
}

/// Runtime options of the tracking core.
///
/// Field names serialize in the upper-case form used by configuration files
/// (e.g. `MAX_DIST`, `TRUST_2D`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Config {
    /// Maximum range from the camera at which objects are tracked, in meters.
    pub max_dist: f64,
    /// Input frame rate in Hz.
    pub frame_rate: f64,
    /// Maximum plausible speed of a car, in m/s.
    pub max_speed_car: f64,
    /// Maximum plausible speed of a pedestrian, in m/s.
    pub max_speed_ped: f64,
    /// Upper bound on the combined motion-gate relaxation factor.
    pub max_max_dist_multiplier: f64,
    /// Landmark pruning radius for cars, in meters.
    pub cluster_radius_car: f64,
    /// Landmark pruning radius for pedestrians, in meters.
    pub cluster_radius_ped: f64,
    /// Prune landmarks against a MAD-based radius instead of the per-class one.
    pub using_median_cluster: bool,
    /// Scale applied to the MAD when `using_median_cluster` is set.
    pub mad_scale_factor: f64,
    /// Minimum number of landmarks for a car track to survive initialization.
    /// Zero disables robust initialization.
    pub min_landmarks_car: usize,
    /// Minimum number of landmarks for a pedestrian track to survive
    /// initialization. Zero disables robust initialization.
    pub min_landmarks_ped: usize,
    /// Number of recent poses optimized by bundle adjustment; also the window
    /// of the constant-velocity motion prediction.
    pub sliding_window_ba: usize,
    /// Number of recent poses the direction vector is averaged over.
    pub sliding_window_dir_vec: usize,
    /// Maximum number of observations sampled for descriptor selection.
    pub sliding_window_descriptors: usize,
    /// Per-track bundle adjustment runs every this many frames.
    pub ba_every_n_steps: usize,
    /// Number of consecutive unmatched frames a track survives.
    pub keep_track_for_n_frames_after_lost: usize,
    /// Trust in the external 2D tracker's identities.
    #[serde(rename = "TRUST_2D")]
    pub trust_2d: TrustLevel,
    /// Re-detect features even when a detection carries cached ones.
    pub force_new_detections: bool,
    /// Run a full (non-sliding) bundle adjustment over all tracks on shutdown.
    pub final_full_ba: bool,
    /// Publish per-frame 2D track records to the 2D writer queue.
    #[serde(rename = "SAVE_UPDATED_2D_TRACK")]
    pub save_updated_2d_track: bool,
    /// Publish per-frame 3D track records to the 3D writer queue.
    #[serde(rename = "SAVE_3D_TRACK")]
    pub save_3d_track: bool,
    /// Accepted for configuration-file compatibility; the oriented-bounding-box
    /// writer belongs to the external regressor tooling.
    #[serde(rename = "SAVE_OBB_DATA")]
    pub save_obb_data: bool,
    /// Record per-frame landmark counts per track.
    pub track_point_cloud_sizes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_dist: 75.0,
            frame_rate: 10.0,
            max_speed_car: 28.0,
            max_speed_ped: 3.0,
            max_max_dist_multiplier: 4.0,
            cluster_radius_car: 3.0,
            cluster_radius_ped: 1.0,
            using_median_cluster: false,
            mad_scale_factor: 3.0,
            min_landmarks_car: 10,
            min_landmarks_ped: 5,
            sliding_window_ba: 10,
            sliding_window_dir_vec: 5,
            sliding_window_descriptors: 10,
            ba_every_n_steps: 3,
            keep_track_for_n_frames_after_lost: 5,
            trust_2d: TrustLevel::Partial,
            force_new_detections: false,
            final_full_ba: false,
            save_updated_2d_track: false,
            save_3d_track: false,
            save_obb_data: false,
            track_point_cloud_sizes: false,
        }
    }
}

impl Config {
    /// Load a configuration from a JSON file. Missing fields fall back to the
    /// defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let config: Config = serde_json::from_reader(File::open(path.as_ref())?)?;
        log::info!(
            "Successfully loaded configuration from {}",
            path.as_ref().display()
        );
        Ok(config)
    }

    pub fn max_speed(&self, cls: ObjectClass) -> f64 {
        match cls {
            ObjectClass::Car => self.max_speed_car,
            ObjectClass::Pedestrian => self.max_speed_ped,
        }
    }

    pub fn cluster_radius(&self, cls: ObjectClass) -> f64 {
        match cls {
            ObjectClass::Car => self.cluster_radius_car,
            ObjectClass::Pedestrian => self.cluster_radius_ped,
        }
    }

    pub fn min_landmarks(&self, cls: ObjectClass) -> usize {
        match cls {
            ObjectClass::Car => self.min_landmarks_car,
            ObjectClass::Pedestrian => self.min_landmarks_ped,
        }
    }
}
