use serde::{Deserialize, Serialize};

extern crate nalgebra as na;

/// Intrinsic parameters of a single rectified pinhole camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraParameters {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraParameters {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Derive intrinsics from a resolution and a field of view.
    ///
    /// At least one of the FOV components (in radians) must be given; the other is
    /// inferred from the aspect ratio. The principal point is placed at the image
    /// center.
    pub fn from_fov(
        resolution: (u32, u32),
        fov: (Option<f64>, Option<f64>),
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let (x_scaling, y_scaling) = match fov {
            (Some(fov_x), Some(fov_y)) => (f64::tan(fov_x * 0.5), f64::tan(fov_y * 0.5)),
            (Some(fov_x), None) => {
                let xs = f64::tan(fov_x * 0.5);
                (xs, xs * (resolution.1 as f64) / (resolution.0 as f64))
            }
            (None, Some(fov_y)) => {
                let ys = f64::tan(fov_y * 0.5);
                (ys * (resolution.0 as f64) / (resolution.1 as f64), ys)
            }
            (None, None) => {
                return Err("You must specify the FOV on either x or y component!".into());
            }
        };
        let half_resolution = ((resolution.0 as f64) * 0.5, (resolution.1 as f64) * 0.5);
        Ok(Self {
            fx: half_resolution.0 / x_scaling,
            fy: half_resolution.1 / y_scaling,
            cx: half_resolution.0,
            cy: half_resolution.1,
        })
    }

    /// The 3x3 camera matrix K.
    pub fn camera_matrix(&self) -> na::Matrix3<f64> {
        na::Matrix3::new(
            self.fx, 0.0, self.cx,
            0.0, self.fy, self.cy,
            0.0, 0.0, 1.0,
        )
    }

    /// Project a camera-frame point onto the image plane. The caller must ensure
    /// the point has positive depth.
    pub fn project(&self, pt_cam: &na::Vector3<f64>) -> na::Vector2<f64> {
        na::Vector2::new(
            self.fx * pt_cam.x / pt_cam.z + self.cx,
            self.fy * pt_cam.y / pt_cam.z + self.cy,
        )
    }

    /// Back-project a pixel to the camera-frame ray through it, scaled to z = 1.
    pub fn back_project(&self, pt_2d: &na::Vector2<f64>) -> na::Vector3<f64> {
        na::Vector3::new(
            (pt_2d.x - self.cx) / self.fx,
            (pt_2d.y - self.cy) / self.fy,
            1.0,
        )
    }

    /// The image rectangle implied by a centered principal point.
    pub fn image_bounds(&self) -> (f64, f64) {
        (2.0 * self.cx, 2.0 * self.cy)
    }
}

/// A rectified stereo rig. `t_left_right` maps points from the right camera
/// frame into the left camera frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StereoCamera {
    pub left: CameraParameters,
    pub right: CameraParameters,
    pub t_left_right: na::Isometry3<f64>,
}

impl StereoCamera {
    pub fn new(
        left: CameraParameters,
        right: CameraParameters,
        t_left_right: na::Isometry3<f64>,
    ) -> Self {
        Self {
            left,
            right,
            t_left_right,
        }
    }

    /// A rig with identical intrinsics for both cameras and a pure horizontal
    /// baseline (in meters).
    pub fn with_baseline(params: CameraParameters, baseline: f64) -> Self {
        Self {
            left: params,
            right: params,
            t_left_right: na::Isometry3::translation(baseline, 0.0, 0.0),
        }
    }

    pub fn baseline(&self) -> f64 {
        self.t_left_right.translation.vector.x
    }
}
