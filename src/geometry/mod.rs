use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Debug, Display};

extern crate nalgebra as na;

use crate::camera::{CameraParameters, StereoCamera};
use crate::feature::Feature;
use crate::track::{Landmark, LandmarkId};

pub mod mask;

/// Depth below which a triangulated point is considered degenerate.
pub const MIN_DEPTH: f64 = 0.5;

/// Maximum allowed difference of the row coordinates of a rectified stereo
/// match, in pixels.
pub const EPIPOLAR_TOLERANCE: f64 = 1.0;

/// This error occurs when a stereo match cannot be triangulated to a usable
/// 3D point. The offending match is expected to be dropped by the caller.
pub enum TriangulationError {
    /// The two viewing rays are (numerically) parallel.
    SingularSystem,
    /// The rectified rows of the two features differ by more than
    /// [`EPIPOLAR_TOLERANCE`]. Carries the residual.
    EpipolarViolation(f64),
    /// The triangulated point is behind or too close to the camera. Carries
    /// the depth.
    DepthOutOfRange(f64),
    /// The triangulated point is farther from the camera than the configured
    /// maximum range. Carries the distance.
    TooFarAway(f64),
}

impl Debug for TriangulationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriangulationError::SingularSystem => {
                write!(f, "The triangulation system is singular (parallel rays)!")
            }
            TriangulationError::EpipolarViolation(residual) => write!(
                f,
                "Epipolar residual of {:.2} px exceeds the tolerance of {} px!",
                residual, EPIPOLAR_TOLERANCE
            ),
            TriangulationError::DepthOutOfRange(z) => write!(
                f,
                "Triangulated depth {:.2} is below the minimum of {}!",
                z, MIN_DEPTH
            ),
            TriangulationError::TooFarAway(dist) => {
                write!(f, "Triangulated point is too far away: {:.2}", dist)
            }
        }
    }
}

impl Display for TriangulationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error for TriangulationError {}

/// Append a unit w component to a 3D point.
pub fn to_homogeneous(p: &na::Vector3<f64>) -> na::Vector4<f64> {
    na::Vector4::new(p.x, p.y, p.z, 1.0)
}

/// Divide out the w component of a homogeneous point. The caller must ensure
/// w is nonzero.
pub fn from_homogeneous(p: &na::Vector4<f64>) -> na::Vector3<f64> {
    na::Vector3::new(p.x / p.w, p.y / p.w, p.z / p.w)
}

/// Triangulate a rectified stereo feature match.
///
/// The two viewing rays are intersected in the least-squares sense in the left
/// camera frame; the result is transformed by `t_ref_cam` into the caller's
/// reference frame (object or world).
///
/// Fails when the linear system is singular, the epipolar residual
/// |v_L - v_R| exceeds [`EPIPOLAR_TOLERANCE`], the depth is below
/// [`MIN_DEPTH`], or the point is farther than `max_dist` from the camera.
pub fn triangulate_stereo_match(
    left_feature: &Feature,
    right_feature: &Feature,
    stereo_cam: &StereoCamera,
    t_ref_cam: &na::Isometry3<f64>,
    max_dist: f64,
) -> Result<na::Vector3<f64>, TriangulationError> {
    let epipolar_residual = (left_feature.v - right_feature.v).abs();
    if epipolar_residual > EPIPOLAR_TOLERANCE {
        return Err(TriangulationError::EpipolarViolation(epipolar_residual));
    }

    // Viewing rays in the left camera frame. The left ray passes through the
    // origin; the right ray starts at the right camera center.
    let dir_left = stereo_cam.left.back_project(&left_feature.pt());
    let dir_right = stereo_cam
        .t_left_right
        .rotation
        .transform_vector(&stereo_cam.right.back_project(&right_feature.pt()));
    let origin_right = stereo_cam.t_left_right.translation.vector;

    // Least-squares intersection: minimize |t1 * d_l - t2 * d_r - o_r| over
    // the two ray parameters.
    let dll = dir_left.dot(&dir_left);
    let drr = dir_right.dot(&dir_right);
    let dlr = dir_left.dot(&dir_right);
    let det = dll * drr - dlr * dlr;
    if det.abs() < 1e-12 {
        return Err(TriangulationError::SingularSystem);
    }
    let b0 = dir_left.dot(&origin_right);
    let b1 = -dir_right.dot(&origin_right);
    let t1 = (drr * b0 + dlr * b1) / det;
    let t2 = (dlr * b0 + dll * b1) / det;

    let pt_cam = (dir_left * t1 + (origin_right + dir_right * t2)) * 0.5;
    if pt_cam.z <= MIN_DEPTH {
        return Err(TriangulationError::DepthOutOfRange(pt_cam.z));
    }
    if pt_cam.norm() > max_dist {
        return Err(TriangulationError::TooFarAway(pt_cam.norm()));
    }
    Ok((t_ref_cam * na::Point3::from(pt_cam)).coords)
}

/// Project all landmarks with positive depth into the image.
pub fn project_landmarks(
    landmarks: &HashMap<LandmarkId, Landmark>,
    t_cam_obj: &na::Isometry3<f64>,
    params: &CameraParameters,
) -> Vec<na::Vector2<f64>> {
    landmarks
        .values()
        .filter_map(|lm| {
            let pt_cam = t_cam_obj * na::Point3::from(lm.pt_3d);
            (pt_cam.z > 0.0).then(|| params.project(&pt_cam.coords))
        })
        .collect()
}

/// Whether at least `min_landmarks` of the track's landmarks project into the
/// image rectangle with positive depth.
pub fn is_in_view(
    landmarks: &HashMap<LandmarkId, Landmark>,
    t_cam_obj: &na::Isometry3<f64>,
    params: &CameraParameters,
    min_landmarks: usize,
) -> bool {
    let (width, height) = params.image_bounds();
    let visible = landmarks
        .values()
        .filter(|lm| {
            let pt_cam = t_cam_obj * na::Point3::from(lm.pt_3d);
            if pt_cam.z <= 0.0 {
                return false;
            }
            let pt_2d = params.project(&pt_cam.coords);
            pt_2d.x >= 0.0 && pt_2d.x < width && pt_2d.y >= 0.0 && pt_2d.y < height
        })
        .count();
    visible >= min_landmarks
}
