//! Motion-only optimization of a tracking frame against fixed map points.
//!
//! Four rounds of Gauss-Newton, each restarting from the initial estimate.
//! After every round the correspondences are reclassified by their
//! chi-square error; outliers are left out of the next round and flagged on
//! the frame. The robust kernel is dropped for the last two rounds.

use nalgebra::{Matrix6, Vector3, Vector6};
use tracing::debug;

use crate::map::Map;
use crate::tracking::frame::CameraModel;
use crate::tracking::Frame;

use super::reprojection::{apply_update, huber_weight, jacobians, residual_cam, Measurement};

const ROUNDS: usize = 4;
const ITERATIONS_PER_ROUND: usize = 10;
/// Below this many correspondences the pose is left untouched.
const MIN_CORRESPONDENCES: usize = 3;

struct Correspondence {
    feature_idx: usize,
    point: Vector3<f64>,
    measurement: Measurement,
    inlier: bool,
}

/// Refine `frame.pose` and flag outlier associations. Returns the number of
/// inliers; 0 when the frame has no pose or too few matches.
pub fn optimize_pose(frame: &mut Frame, map: &Map, camera: &CameraModel) -> usize {
    optimize_pose_with_points(frame, map, camera, &[])
}

/// Same as [`optimize_pose`], with extra `(feature index, world point)`
/// correspondences that are not map points (visual odometry in
/// localization mode). Their outlier flags land in `frame.outliers` too.
pub fn optimize_pose_with_points(
    frame: &mut Frame,
    map: &Map,
    camera: &CameraModel,
    extra: &[(usize, Vector3<f64>)],
) -> usize {
    let Some(initial_cw) = frame.pose_cw() else {
        return 0;
    };

    let mut correspondences: Vec<Correspondence> = Vec::new();
    for (idx, slot) in frame.map_point_matches.iter().enumerate() {
        let Some(mp) = slot.and_then(|id| map.get_map_point(id)) else {
            continue;
        };
        frame.outliers[idx] = false;
        correspondences.push(Correspondence {
            feature_idx: idx,
            point: mp.position,
            measurement: Measurement::new(
                &frame.features.keypoints[idx],
                frame.points_cam[idx].as_ref(),
                camera,
            ),
            inlier: true,
        });
    }

    for &(idx, point) in extra {
        if idx >= frame.num_features() || frame.map_point_matches[idx].is_some() {
            continue;
        }
        frame.outliers[idx] = false;
        correspondences.push(Correspondence {
            feature_idx: idx,
            point,
            measurement: Measurement::new(
                &frame.features.keypoints[idx],
                frame.points_cam[idx].as_ref(),
                camera,
            ),
            inlier: true,
        });
    }

    if correspondences.len() < MIN_CORRESPONDENCES {
        return 0;
    }

    let mut pose_cw = initial_cw.clone();
    let mut n_bad = 0;
    for round in 0..ROUNDS {
        let mut estimate = initial_cw.clone();
        let robust = round < 2;

        for _ in 0..ITERATIONS_PER_ROUND {
            let rotation = estimate.rotation_matrix();
            let mut h = Matrix6::<f64>::zeros();
            let mut b = Vector6::<f64>::zeros();
            for c in correspondences.iter().filter(|c| c.inlier) {
                let p_cam = estimate.transform_point(&c.point);
                let Some(e) = residual_cam(&p_cam, &c.measurement, camera) else {
                    continue;
                };
                let m = &c.measurement;
                let chi2 = m.inv_sigma2 * e.norm_squared();
                let robust_weight = if robust {
                    huber_weight(chi2, m.chi2_threshold())
                } else {
                    1.0
                };
                let w = robust_weight * m.inv_sigma2;
                let (j_pose, _) = jacobians(&p_cam, &rotation, m, camera);
                h += j_pose.transpose() * j_pose * w;
                b -= j_pose.transpose() * e * w;
            }

            let Some(delta) = h.cholesky().map(|chol| chol.solve(&b)) else {
                break;
            };
            if delta.iter().any(|v| !v.is_finite()) {
                break;
            }
            estimate = apply_update(&estimate, &delta);
            if delta.norm() < 1e-8 {
                break;
            }
        }
        pose_cw = estimate;

        n_bad = 0;
        for c in &mut correspondences {
            let p_cam = pose_cw.transform_point(&c.point);
            let chi2 = residual_cam(&p_cam, &c.measurement, camera)
                .map(|e| c.measurement.inv_sigma2 * e.norm_squared());
            c.inlier = chi2.is_some_and(|v| v <= c.measurement.chi2_threshold());
            n_bad += usize::from(!c.inlier);
        }

        if correspondences.len() - n_bad < 10 {
            break;
        }
    }

    for c in &correspondences {
        frame.outliers[c.feature_idx] = !c.inlier;
    }
    frame.pose = Some(pose_cw.inverse());

    let inliers = correspondences.len() - n_bad;
    debug!(
        "[PoseOptim] {} correspondences, {} inliers",
        correspondences.len(),
        inliers
    );
    inliers
}
