use std::collections::HashMap;
use std::fmt::Display;

use rand::seq::index::sample;

extern crate nalgebra as na;

use crate::geometry::mask::Mask;
use crate::track::{Image, ImageId, Landmark, LandmarkId, TrackId};

/// A pair of feature indices: `(index into the first list, index into the
/// second list)`.
pub type Match = (usize, usize);

/// A detected keypoint with its descriptor. Immutable once produced for an
/// (image, mask) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub u: f64,
    pub v: f64,
    pub descriptor: na::DVector<f64>,
}

impl Feature {
    pub fn new(u: f64, v: f64, descriptor: na::DVector<f64>) -> Self {
        Self { u, v, descriptor }
    }

    pub fn pt(&self) -> na::Vector2<f64> {
        na::Vector2::new(self.u, self.v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraSide {
    Left,
    Right,
}

impl Display for CameraSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraSide::Left => write!(f, "left"),
            CameraSide::Right => write!(f, "right"),
        }
    }
}

/// A pluggable feature detector and matcher.
///
/// The matching semantics (ratio test, mutual nearest neighbor, ...) are a
/// property of the implementation; the core only relies on matches being
/// symmetric and on each index appearing at most once per side.
///
/// Implementations must be callable from multiple per-track worker threads at
/// once.
pub trait FeatureMatcher: Send + Sync {
    /// Detect features on the masked region of an image. The image id, track
    /// id and camera side identify the request for caching implementations.
    fn detect_features(
        &self,
        image: &Image,
        mask: Option<&Mask>,
        img_id: ImageId,
        track_id: TrackId,
        side: CameraSide,
    ) -> Vec<Feature>;

    /// Match two feature lists. Each returned pair references one feature of
    /// the first and one of the second list; indices appear at most once per
    /// side.
    fn match_features(&self, first: &[Feature], second: &[Feature]) -> Vec<Match>;
}

/// Pick a representative descriptor for a landmark's observations.
///
/// At most `window` observations are sampled uniformly at random. With
/// `smallest_dist_to_rest`, the descriptor whose median L2 distance to the
/// other sampled descriptors is smallest wins; otherwise the element-wise
/// median of the sampled descriptors is returned.
pub fn median_descriptor(
    observations: &[crate::track::Observation],
    window: usize,
    smallest_dist_to_rest: bool,
) -> na::DVector<f64> {
    assert!(!observations.is_empty(), "landmark without observations");
    let subset: Vec<&na::DVector<f64>> = if observations.len() > window {
        sample(&mut rand::rng(), observations.len(), window)
            .iter()
            .map(|i| &observations[i].descriptor)
            .collect()
    } else {
        observations.iter().map(|obs| &obs.descriptor).collect()
    };

    if !smallest_dist_to_rest {
        let dim = subset[0].len();
        let mut result = na::DVector::zeros(dim);
        for d in 0..dim {
            let values: Vec<f64> = subset.iter().map(|desc| desc[d]).collect();
            result[d] = crate::utils::median(&values).unwrap_or(0.0);
        }
        return result;
    }

    let n = subset.len();
    let mut distances = na::DMatrix::zeros(n, n);
    for i in 0..n {
        for j in i..n {
            let dist = (subset[i] - subset[j]).norm();
            distances[(i, j)] = dist;
            distances[(j, i)] = dist;
        }
    }
    let mut best: Option<(usize, f64)> = None;
    for i in 0..n {
        let row: Vec<f64> = distances.row(i).iter().copied().collect();
        let median = crate::utils::median(&row).unwrap_or(f64::INFINITY);
        if best.is_none_or(|(_, best_median)| median < best_median) {
            best = Some((i, median));
        }
    }
    subset[best.expect("non-empty subset").0].clone()
}

/// Turn a track's landmarks into a list of descriptor-only features for
/// matching against freshly detected ones. Returns the features together with
/// the landmark id each feature index corresponds to.
pub fn landmark_descriptor_features(
    landmarks: &HashMap<LandmarkId, Landmark>,
    window: usize,
) -> (Vec<Feature>, Vec<LandmarkId>) {
    let mut ids: Vec<LandmarkId> = landmarks.keys().copied().collect();
    ids.sort_unstable();
    let features = ids
        .iter()
        .map(|id| {
            let descriptor = median_descriptor(&landmarks[id].observations, window, true);
            Feature::new(0.0, 0.0, descriptor)
        })
        .collect();
    (features, ids)
}
