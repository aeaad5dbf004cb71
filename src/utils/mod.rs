use statrs::statistics::{Data, OrderStatistics};

extern crate nalgebra as na;

/// The skew-symmetric cross-product matrix $[\mathbf{v}]_\times$.
pub fn skew(v: &na::Vector3<f64>) -> na::Matrix3<f64> {
    na::Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// For a given rotation defined by rotation vector $\mathbf{\omega}$ and a vector $\mathbf{v}$,
/// let $\mathbf{b} = \exp([\mathbf{\omega}]_\times)\mathbf{v}$. This function computes the Jacobian
/// $\frac{\partial \mathbf{b}}{\partial \mathbf{\omega}}$.
pub fn rotation_jacobian(r: &na::Rotation3<f64>, v: &na::Vector3<f64>) -> na::Matrix3<f64> {
    let theta = r.angle();
    let omega = r.scaled_axis();
    let omega_hat = skew(&omega);
    let right_jacobian = if theta < 1e-10 {
        na::Matrix3::identity()
    } else {
        na::Matrix3::identity()
            - ((1.0 - theta.cos()) / (theta * theta)) * omega_hat
            + ((theta - theta.sin()) / (theta * theta * theta)) * omega_hat * omega_hat
    };
    let rotated_v = r.transform_vector(v);
    skew(&rotated_v) * right_jacobian
}

/// Median of a slice of scalars. Returns `None` on an empty slice.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut data = Data::new(values.to_vec());
    Some(data.median())
}

/// Per-axis median of a set of 3D points.
pub fn median_point(points: &[na::Vector3<f64>]) -> Option<na::Vector3<f64>> {
    if points.is_empty() {
        return None;
    }
    let x = median(&points.iter().map(|p| p.x).collect::<Vec<_>>())?;
    let y = median(&points.iter().map(|p| p.y).collect::<Vec<_>>())?;
    let z = median(&points.iter().map(|p| p.z).collect::<Vec<_>>())?;
    Some(na::Vector3::new(x, y, z))
}

/// Per-axis mean of a set of 3D points.
pub fn mean_point(points: &[na::Vector3<f64>]) -> Option<na::Vector3<f64>> {
    if points.is_empty() {
        return None;
    }
    Some(points.iter().sum::<na::Vector3<f64>>() / (points.len() as f64))
}

/// Median absolute deviation of a point cluster: the median over points of the
/// Euclidean distance to the cluster's per-axis median.
pub fn mad_radius(points: &[na::Vector3<f64>]) -> Option<f64> {
    let center = median_point(points)?;
    median(
        &points
            .iter()
            .map(|p| (p - center).norm())
            .collect::<Vec<_>>(),
    )
}
