//! Perspective-n-point solve for a rigid model seen by a known pinhole camera.
//!
//! The pose is initialised with a normalised direct linear transform (DLT) on
//! the 3x4 projection matrix and then refined by Levenberg-Marquardt on the
//! pixel reprojection error, parameterised as (rotation vector, translation).

use nalgebra::{
    DMatrix, DVector, Matrix2, Matrix3, Matrix6, Rotation3, SymmetricEigen, UnitQuaternion, Vector2,
    Vector3, Vector6,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::camera::CameraIntrinsics;
use crate::error::PoseSolveError;

/// Fewest correspondences the non-planar DLT can use.
pub const MIN_POINTS: usize = 6;

const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_MAX: f64 = 1e16;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub max_iterations: usize,
    /// Relative step size below which the refinement is considered converged.
    pub tolerance: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PnpSolution {
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
    /// Root-mean-square reprojection error in pixels.
    pub rms_error: f64,
    pub iterations: usize,
}

impl PnpSolution {
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        rodrigues(&self.rotation)
    }
}

/// Exponential map from an axis-angle vector to a rotation matrix.
pub fn rodrigues(rvec: &Vector3<f64>) -> Matrix3<f64> {
    Rotation3::new(*rvec).into_inner()
}

/// Logarithm of a rotation matrix as an axis-angle vector.
///
/// Goes through a quaternion so rotations close to 180 degrees, which is
/// where a face seen through a y-down camera sits, keep a stable axis.
pub fn rotation_vector(r: &Matrix3<f64>) -> Vector3<f64> {
    UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(*r)).scaled_axis()
}

pub fn solve_pnp(
    object: &[Vector3<f64>],
    image: &[Vector2<f64>],
    camera: &CameraIntrinsics,
    options: &SolverOptions,
) -> Result<PnpSolution, PoseSolveError> {
    if object.len() != image.len() {
        return Err(PoseSolveError::PointCount {
            expected: object.len(),
            got: image.len(),
        });
    }
    if object.len() < MIN_POINTS {
        return Err(PoseSolveError::PointCount {
            expected: MIN_POINTS,
            got: object.len(),
        });
    }
    if image.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
        return Err(PoseSolveError::Degenerate("non-finite image point".into()));
    }
    check_image_spread(image)?;

    let normalized: Vec<Vector2<f64>> = image.iter().map(|p| camera.normalize(p)).collect();
    let (r0, t0) = dlt_pose(object, &normalized)?;

    let r0 = rotation_vector(&r0);
    let initial = Vector6::new(r0.x, r0.y, r0.z, t0.x, t0.y, t0.z);
    let solution = refine(object, image, camera, initial, options)?;

    let rotation = solution.rotation_matrix();
    if object
        .iter()
        .any(|p| (rotation * p + solution.translation).z <= 0.0)
    {
        return Err(PoseSolveError::Degenerate(
            "solution places the model behind the camera".into(),
        ));
    }

    debug!(
        iterations = solution.iterations,
        rms = solution.rms_error,
        "pnp converged"
    );
    Ok(solution)
}

/// Rejects coincident or collinear image points before they reach the DLT.
fn check_image_spread(image: &[Vector2<f64>]) -> Result<(), PoseSolveError> {
    let n = image.len() as f64;
    let mean = image.iter().sum::<Vector2<f64>>() / n;
    let cov = image
        .iter()
        .map(|p| {
            let d = p - mean;
            d * d.transpose()
        })
        .sum::<Matrix2<f64>>()
        / n;

    let eig = cov.symmetric_eigenvalues();
    let (small, large) = (eig.min(), eig.max());
    if large <= 1e-12 {
        return Err(PoseSolveError::Degenerate("image points coincide".into()));
    }
    if small / large < 1e-10 {
        return Err(PoseSolveError::Degenerate("image points are collinear".into()));
    }
    Ok(())
}

/// Linear pose from the null vector of the DLT system, re-orthonormalised.
fn dlt_pose(
    object: &[Vector3<f64>],
    normalized: &[Vector2<f64>],
) -> Result<(Matrix3<f64>, Vector3<f64>), PoseSolveError> {
    let n = object.len();
    let centroid = object.iter().sum::<Vector3<f64>>() / n as f64;
    let spread = object.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n as f64;
    if spread <= f64::EPSILON {
        return Err(PoseSolveError::Degenerate("model points coincide".into()));
    }
    let scale = 3f64.sqrt() / spread;

    let mut a = DMatrix::<f64>::zeros(2 * n, 12);
    for (i, (p, q)) in object.iter().zip(normalized).enumerate() {
        let c = (p - centroid) * scale;
        let h = [c.x, c.y, c.z, 1.0];
        for (j, hj) in h.iter().enumerate() {
            a[(2 * i, j)] = *hj;
            a[(2 * i, 8 + j)] = -q.x * hj;
            a[(2 * i + 1, 4 + j)] = *hj;
            a[(2 * i + 1, 8 + j)] = -q.y * hj;
        }
    }

    let eigen = SymmetricEigen::new(a.transpose() * &a);
    let mut order: Vec<usize> = (0..eigen.eigenvalues.len()).collect();
    order.sort_by(|&i, &j| eigen.eigenvalues[i].total_cmp(&eigen.eigenvalues[j]));

    let largest = eigen.eigenvalues[order[order.len() - 1]];
    let second = eigen.eigenvalues[order[1]];
    if largest <= 0.0 || second <= largest * 1e-12 {
        return Err(PoseSolveError::Degenerate(
            "rank-deficient DLT system".into(),
        ));
    }

    let p = eigen.eigenvectors.column(order[0]);
    // Undo the conditioning: P = P' * T.
    let mut m = Matrix3::new(p[0], p[1], p[2], p[4], p[5], p[6], p[8], p[9], p[10]) * scale;
    let mut last = Vector3::new(p[3], p[7], p[11]) - m * centroid;

    if m.determinant() < 0.0 {
        m = -m;
        last = -last;
    }

    let svd = m.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(PoseSolveError::Degenerate("SVD of DLT rotation failed".into()));
    };
    let rotation = u * v_t;
    let s = svd.singular_values.sum() / 3.0;
    if rotation.determinant() <= 0.0 || s <= f64::EPSILON {
        return Err(PoseSolveError::Degenerate(
            "DLT produced an improper rotation".into(),
        ));
    }

    Ok((rotation, last / s))
}

fn reprojection_residuals(
    object: &[Vector3<f64>],
    image: &[Vector2<f64>],
    camera: &CameraIntrinsics,
    params: &Vector6<f64>,
) -> DVector<f64> {
    let r = rodrigues(&Vector3::new(params[0], params[1], params[2]));
    let t = Vector3::new(params[3], params[4], params[5]);
    let mut out = DVector::zeros(2 * object.len());
    for (i, (p, q)) in object.iter().zip(image).enumerate() {
        let projected = camera.project(&(r * p + t));
        out[2 * i] = projected.x - q.x;
        out[2 * i + 1] = projected.y - q.y;
    }
    out
}

fn numeric_jacobian(
    object: &[Vector3<f64>],
    image: &[Vector2<f64>],
    camera: &CameraIntrinsics,
    params: &Vector6<f64>,
) -> DMatrix<f64> {
    let mut jac = DMatrix::zeros(2 * object.len(), 6);
    for k in 0..6 {
        let h = 1e-6 * params[k].abs().max(1.0);
        let mut plus = *params;
        let mut minus = *params;
        plus[k] += h;
        minus[k] -= h;
        let column = (reprojection_residuals(object, image, camera, &plus)
            - reprojection_residuals(object, image, camera, &minus))
            / (2.0 * h);
        jac.set_column(k, &column);
    }
    jac
}

fn refine(
    object: &[Vector3<f64>],
    image: &[Vector2<f64>],
    camera: &CameraIntrinsics,
    initial: Vector6<f64>,
    options: &SolverOptions,
) -> Result<PnpSolution, PoseSolveError> {
    let n = object.len() as f64;
    let mut params = initial;
    let mut residuals = reprojection_residuals(object, image, camera, &params);
    let mut cost = residuals.norm_squared();
    let mut lambda = LAMBDA_INIT;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < options.max_iterations && !converged {
        iterations += 1;
        if !cost.is_finite() {
            break;
        }
        if cost <= 1e-24 * n {
            converged = true;
            break;
        }

        let jac = numeric_jacobian(object, image, camera, &params);
        let jtj = Matrix6::from_iterator((jac.transpose() * &jac).iter().copied());
        let gradient = Vector6::from_iterator((jac.transpose() * &residuals).iter().copied());
        if gradient.amax() <= options.tolerance {
            converged = true;
            break;
        }

        loop {
            let mut damped = jtj;
            for k in 0..6 {
                damped[(k, k)] += lambda * jtj[(k, k)].max(1e-12);
            }

            let step = damped.cholesky().map(|c| c.solve(&(-gradient)));
            let accepted = step.and_then(|delta| {
                let candidate = params + delta;
                let r = reprojection_residuals(object, image, camera, &candidate);
                let c = r.norm_squared();
                (c.is_finite() && c < cost).then_some((delta, candidate, r, c))
            });

            match accepted {
                Some((delta, candidate, r, c)) => {
                    let relative_gain = (cost - c) / cost;
                    params = candidate;
                    residuals = r;
                    cost = c;
                    lambda = (lambda / 10.0).max(1e-12);
                    if delta.norm() <= options.tolerance * (params.norm() + options.tolerance)
                        || relative_gain <= 1e-14
                    {
                        converged = true;
                    }
                    break;
                }
                None => {
                    lambda *= 10.0;
                    if lambda > LAMBDA_MAX {
                        // No step lowers the cost: stationary point.
                        converged = true;
                        break;
                    }
                }
            }
        }
    }

    let rms_error = (cost / n).sqrt();
    if !converged || !rms_error.is_finite() {
        return Err(PoseSolveError::NotConverged {
            iterations,
            rms: rms_error,
        });
    }

    Ok(PnpSolution {
        rotation: Vector3::new(params[0], params[1], params[2]),
        translation: Vector3::new(params[3], params[4], params[5]),
        rms_error,
        iterations,
    })
}
