use std::collections::HashMap;

use geo::{BoundingRect, Contains, ConvexHull, MultiPoint, Point};

extern crate nalgebra as na;

use crate::camera::StereoCamera;
use crate::geometry::project_landmarks;
use crate::track::{Landmark, LandmarkId};

/// Dilation radius applied to masks rasterized from landmark hulls, in pixels.
pub const MASK_DILATION_RADIUS: usize = 3;

/// A boolean image mask with row-major storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    width: usize,
    height: usize,
    data: Vec<bool>,
}

impl Mask {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![false; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn get(&self, x: usize, y: usize) -> bool {
        x < self.width && y < self.height && self.data[y * self.width + x]
    }

    pub fn set(&mut self, x: usize, y: usize, value: bool) {
        if x < self.width && y < self.height {
            self.data[y * self.width + x] = value;
        }
    }

    /// Number of set pixels.
    pub fn area(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.data.iter().any(|&v| v)
    }

    /// Rasterize the convex hull of a set of image points. Points outside the
    /// image rectangle are clamped away by the rasterization; with fewer than
    /// three points only the points themselves are marked.
    pub fn from_convex_hull(points: &[na::Vector2<f64>], width: usize, height: usize) -> Self {
        let mut mask = Self::new(width, height);
        if points.is_empty() {
            return mask;
        }
        // always mark the generating points so a degenerate hull is not lost
        for pt in points {
            let (x, y) = (pt.x.round(), pt.y.round());
            if x >= 0.0 && y >= 0.0 {
                mask.set(x as usize, y as usize, true);
            }
        }
        if points.len() < 3 {
            return mask;
        }
        let hull = points
            .iter()
            .map(|p| Point::new(p.x, p.y))
            .collect::<MultiPoint<f64>>()
            .convex_hull();
        let Some(bounds) = hull.bounding_rect() else {
            return mask;
        };
        let x_min = bounds.min().x.floor().max(0.0) as usize;
        let y_min = bounds.min().y.floor().max(0.0) as usize;
        let x_max = (bounds.max().x.ceil().max(0.0) as usize).min(width.saturating_sub(1));
        let y_max = (bounds.max().y.ceil().max(0.0) as usize).min(height.saturating_sub(1));
        for y in y_min..=y_max {
            for x in x_min..=x_max {
                if hull.contains(&Point::new(x as f64, y as f64)) {
                    mask.set(x, y, true);
                }
            }
        }
        mask
    }

    /// Morphological dilation with a disk structuring element.
    pub fn dilate(&self, radius: usize) -> Self {
        if radius == 0 {
            return self.clone();
        }
        let r = radius as isize;
        let mut dilated = Self::new(self.width, self.height);
        for y in 0..self.height as isize {
            for x in 0..self.width as isize {
                if !self.data[(y as usize) * self.width + (x as usize)] {
                    continue;
                }
                for dy in -r..=r {
                    for dx in -r..=r {
                        if dx * dx + dy * dy > r * r {
                            continue;
                        }
                        let (nx, ny) = (x + dx, y + dy);
                        if nx >= 0 && ny >= 0 {
                            dilated.set(nx as usize, ny as usize, true);
                        }
                    }
                }
            }
        }
        dilated
    }
}

/// Rasterize a track's landmarks into a left and a right image mask.
///
/// The left mask is the dilated convex hull of the landmarks projected through
/// the left camera; the right mask re-projects them through the right camera
/// via the rig extrinsics. A side with no visible landmark yields `None`.
pub fn masks_from_landmarks(
    landmarks: &HashMap<LandmarkId, Landmark>,
    t_cam_obj: &na::Isometry3<f64>,
    stereo_cam: &StereoCamera,
    img_shape: (usize, usize),
) -> (Option<Mask>, Option<Mask>) {
    let (width, height) = img_shape;
    let t_right_obj = stereo_cam.t_left_right.inverse() * t_cam_obj;
    let left_points = project_landmarks(landmarks, t_cam_obj, &stereo_cam.left);
    let right_points = project_landmarks(landmarks, &t_right_obj, &stereo_cam.right);
    let rasterize = |points: &[na::Vector2<f64>]| {
        (!points.is_empty())
            .then(|| Mask::from_convex_hull(points, width, height).dilate(MASK_DILATION_RADIUS))
    };
    (rasterize(&left_points), rasterize(&right_points))
}
