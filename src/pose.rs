//! Head pose from six canonical landmarks.
//!
//! The six image points are matched against a fixed generic 3D head, the
//! camera is assumed to be an ideal pinhole with a 60 degree horizontal field
//! of view, and the recovered rotation is split into pitch, yaw and roll.
//!
//! The generic head has y pointing up while image rows grow downwards, so an
//! upright frontal face comes out of the solver as a half turn about x. The
//! `asin(sin(angle))` fold maps that half turn back to zero pitch.

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::Serialize;

use crate::camera::{build_intrinsics, DEFAULT_FOV_DEGREES};
use crate::error::PoseSolveError;
use crate::extractor::Backend;
use crate::pnp::{solve_pnp, SolverOptions};
use crate::types::{CanonicalLandmark, Point};

/// Below this, the first two entries of the rotation's first column are
/// treated as zero (gimbal lock).
pub const GIMBAL_EPSILON: f64 = 1e-6;

/// Generic 3D head, millimetre scale, in canonical landmark order.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadModel3D {
    points: [Vector3<f64>; CanonicalLandmark::COUNT],
}

impl HeadModel3D {
    pub fn generic() -> Self {
        Self {
            points: [
                Vector3::new(-225.0, 170.0, -135.0),
                Vector3::new(225.0, 170.0, -135.0),
                Vector3::new(0.0, 0.0, 0.0),
                Vector3::new(-150.0, -150.0, -125.0),
                Vector3::new(150.0, -150.0, -125.0),
                Vector3::new(0.0, -330.0, -65.0),
            ],
        }
    }

    pub fn points(&self) -> &[Vector3<f64>; CanonicalLandmark::COUNT] {
        &self.points
    }

    pub fn point(&self, which: CanonicalLandmark) -> Vector3<f64> {
        self.points[which.index()]
    }
}

impl Default for HeadModel3D {
    fn default() -> Self {
        Self::generic()
    }
}

/// Head orientation in degrees, each angle folded into [-90, 90].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoseAngles {
    pub pitch: f64,
    pub yaw: f64,
    pub roll: f64,
    /// Backend that produced the landmarks.
    pub method: Backend,
    /// RMS reprojection error of the solve, in pixels.
    pub reprojection_error: f64,
    /// The rotation sat at gimbal lock; `yaw` holds the 0 sentinel.
    pub gimbal_locked: bool,
}

impl PoseAngles {
    /// Split a camera-from-model rotation into folded Euler angles.
    pub fn from_rotation(r: &Matrix3<f64>, method: Backend) -> Self {
        let sy = (r[(0, 0)].powi(2) + r[(1, 0)].powi(2)).sqrt();
        if sy < GIMBAL_EPSILON {
            // `y` is the +-90 degree turn about the vertical axis. It is
            // reported in `roll`, with `yaw` holding the 0 sentinel.
            let x = (-r[(1, 2)]).atan2(r[(1, 1)]).to_degrees();
            let y = (-r[(2, 0)]).atan2(sy).to_degrees();
            return Self {
                pitch: fold_degrees(x),
                yaw: 0.0,
                roll: -fold_degrees(y),
                method,
                reprojection_error: 0.0,
                gimbal_locked: true,
            };
        }

        let [x, y, z] = rq_euler_degrees(r);
        Self {
            pitch: fold_degrees(x),
            yaw: fold_degrees(y),
            roll: -fold_degrees(z),
            method,
            reprojection_error: 0.0,
            gimbal_locked: false,
        }
    }
}

/// Pose of the face in one image, or the "unavailable" sentinel when no face
/// was found or the solve failed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PoseEstimate {
    Available(PoseAngles),
    Unavailable { method: Backend },
}

impl PoseEstimate {
    pub fn method(&self) -> Backend {
        match self {
            Self::Available(angles) => angles.method,
            Self::Unavailable { method } => *method,
        }
    }

    pub fn angles(&self) -> Option<&PoseAngles> {
        match self {
            Self::Available(angles) => Some(angles),
            Self::Unavailable { .. } => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }
}

/// `degrees(asin(sin(radians(a))))`: folds any angle into [-90, 90].
pub fn fold_degrees(angle: f64) -> f64 {
    angle.to_radians().sin().asin().to_degrees()
}

/// Euler angles (x, y, z) in degrees from the Givens-rotation RQ
/// decomposition of `m`, as a projection-matrix decomposition reports them:
/// `m * Qx * Qy * Qz` is upper triangular.
///
/// For a proper rotation every Givens step leaves a non-negative pivot, so
/// the triangular factor is the identity and no 180 degree correction is
/// needed.
pub fn rq_euler_degrees(m: &Matrix3<f64>) -> [f64; 3] {
    fn givens(s: f64, c: f64) -> (f64, f64) {
        let z = 1.0 / (c * c + s * s + f64::EPSILON).sqrt();
        (s * z, c * z)
    }
    fn signed_angle(c: f64, s: f64) -> f64 {
        let magnitude = c.clamp(-1.0, 1.0).acos().to_degrees();
        if s >= 0.0 {
            magnitude
        } else {
            -magnitude
        }
    }

    let (sx, cx) = givens(m[(2, 1)], m[(2, 2)]);
    let qx = Matrix3::new(1.0, 0.0, 0.0, 0.0, cx, sx, 0.0, -sx, cx);
    let r = m * qx;

    let (sy, cy) = givens(-r[(2, 0)], r[(2, 2)]);
    let qy = Matrix3::new(cy, 0.0, -sy, 0.0, 1.0, 0.0, sy, 0.0, cy);
    let r = r * qy;

    let (sz, cz) = givens(r[(1, 0)], r[(1, 1)]);

    [
        signed_angle(cx, sx),
        signed_angle(cy, sy),
        signed_angle(cz, sz),
    ]
}

/// Camera geometry and solver settings shared by every image of a run.
#[derive(Debug, Clone)]
pub struct PoseEstimator {
    pub model: HeadModel3D,
    pub fov_degrees: f64,
    pub solver: SolverOptions,
}

impl Default for PoseEstimator {
    fn default() -> Self {
        Self {
            model: HeadModel3D::generic(),
            fov_degrees: DEFAULT_FOV_DEGREES,
            solver: SolverOptions::default(),
        }
    }
}

impl PoseEstimator {
    pub fn new(fov_degrees: f64, solver: SolverOptions) -> Self {
        Self {
            fov_degrees,
            solver,
            ..Self::default()
        }
    }

    /// Solve the head pose for six full-frame landmarks of a
    /// `width` x `height` image.
    pub fn estimate_pose(
        &self,
        landmarks: &[Point; CanonicalLandmark::COUNT],
        width: u32,
        height: u32,
        method: Backend,
    ) -> Result<PoseAngles, PoseSolveError> {
        let camera = build_intrinsics(width, height, self.fov_degrees);
        let image: Vec<Vector2<f64>> = landmarks
            .iter()
            .map(|p| Vector2::new(p.x as f64, p.y as f64))
            .collect();

        let solution = solve_pnp(self.model.points(), &image, &camera, &self.solver)?;
        let mut pose = PoseAngles::from_rotation(&solution.rotation_matrix(), method);
        pose.reprojection_error = solution.rms_error;
        Ok(pose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraIntrinsics;
    use approx::assert_abs_diff_eq;
    use nalgebra::Rotation3;

    /// Project the generic head turned by `yaw` (about its vertical axis) and
    /// `pitch` (nod), seen upright by a y-down camera 3 m away.
    fn synthetic_landmarks(
        yaw_deg: f64,
        pitch_deg: f64,
        width: u32,
        height: u32,
    ) -> [Point; CanonicalLandmark::COUNT] {
        let camera: CameraIntrinsics = build_intrinsics(width, height, DEFAULT_FOV_DEGREES);
        let flip = Rotation3::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI);
        let turn = Rotation3::from_axis_angle(&Vector3::y_axis(), yaw_deg.to_radians());
        let nod = Rotation3::from_axis_angle(&Vector3::x_axis(), pitch_deg.to_radians());
        let rotation = flip * turn * nod;
        let t = Vector3::new(0.0, 0.0, 3000.0);

        let mut out = [Point::default(); CanonicalLandmark::COUNT];
        for (slot, p) in out.iter_mut().zip(HeadModel3D::generic().points()) {
            let px = camera.project(&(rotation * p + t));
            *slot = Point::new(px.x as f32, px.y as f32);
        }
        out
    }

    #[test]
    fn fold_maps_into_principal_range() {
        assert_abs_diff_eq!(fold_degrees(180.0), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(fold_degrees(-170.0), -10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(fold_degrees(100.0), 80.0, epsilon = 1e-9);
        assert_abs_diff_eq!(fold_degrees(35.0), 35.0, epsilon = 1e-9);
        for a in (-720..=720).step_by(7) {
            let f = fold_degrees(a as f64);
            assert!((-90.0..=90.0).contains(&f), "{a} folded to {f}");
        }
    }

    #[test]
    fn upright_flip_decomposes_to_zero() {
        let r = Rotation3::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI).into_inner();
        let pose = PoseAngles::from_rotation(&r, Backend::Geometric);
        assert_abs_diff_eq!(pose.pitch, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(pose.yaw, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(pose.roll, 0.0, epsilon = 1e-9);
        assert!(!pose.gimbal_locked);
    }

    #[test]
    fn rq_angles_match_composed_rotation() {
        // m = Rz(z) * Ry(y) * Rx(x)
        let (x, y, z) = (25f64, -12f64, 7f64);
        let m = Rotation3::from_axis_angle(&Vector3::z_axis(), z.to_radians())
            * Rotation3::from_axis_angle(&Vector3::y_axis(), y.to_radians())
            * Rotation3::from_axis_angle(&Vector3::x_axis(), x.to_radians());
        let [ax, ay, az] = rq_euler_degrees(m.matrix());
        assert_abs_diff_eq!(ax, x, epsilon = 1e-6);
        assert_abs_diff_eq!(ay, y, epsilon = 1e-6);
        assert_abs_diff_eq!(az, z, epsilon = 1e-6);
    }

    #[test]
    fn roll_sign_is_negated() {
        let r = Rotation3::from_axis_angle(&Vector3::z_axis(), 10f64.to_radians()).into_inner();
        let pose = PoseAngles::from_rotation(&r, Backend::Geometric);
        assert_abs_diff_eq!(pose.roll, -10.0, epsilon = 1e-6);
    }

    #[test]
    fn gimbal_lock_reports_yaw_sentinel() {
        let r = Rotation3::from_axis_angle(&Vector3::y_axis(), std::f64::consts::FRAC_PI_2)
            .into_inner();
        let pose = PoseAngles::from_rotation(&r, Backend::Geometric);
        assert!(pose.gimbal_locked);
        assert_eq!(pose.yaw, 0.0);
        assert!(pose.pitch.abs() < 1e-9);
        // the quarter turn about y lands in roll
        assert!((pose.roll + 90.0).abs() < 1e-6);

        let r = Rotation3::from_axis_angle(&Vector3::y_axis(), -std::f64::consts::FRAC_PI_2)
            .into_inner();
        let pose = PoseAngles::from_rotation(&r, Backend::Geometric);
        assert!(pose.gimbal_locked);
        assert!((pose.roll - 90.0).abs() < 1e-6);
    }

    #[test]
    fn frontal_face_estimates_near_zero() {
        let landmarks = synthetic_landmarks(0.0, 0.0, 640, 480);
        let pose = PoseEstimator::default()
            .estimate_pose(&landmarks, 640, 480, Backend::Geometric)
            .unwrap();
        assert_abs_diff_eq!(pose.yaw, 0.0, epsilon = 0.1);
        assert_abs_diff_eq!(pose.pitch, 0.0, epsilon = 0.1);
        assert_abs_diff_eq!(pose.roll, 0.0, epsilon = 0.1);
        assert!(pose.reprojection_error < 0.01);
    }

    #[test]
    fn turned_and_nodding_face_recovers_magnitudes() {
        for (yaw, pitch) in [(20.0, 0.0), (0.0, 15.0), (20.0, 25.0), (-10.0, -18.0)] {
            let landmarks = synthetic_landmarks(yaw, pitch, 1024, 768);
            let pose = PoseEstimator::default()
                .estimate_pose(&landmarks, 1024, 768, Backend::Geometric)
                .unwrap();
            assert_abs_diff_eq!(pose.yaw.abs(), f64::abs(yaw), epsilon = 0.2);
            assert_abs_diff_eq!(pose.pitch.abs(), f64::abs(pitch), epsilon = 0.2);
            assert_abs_diff_eq!(pose.roll, 0.0, epsilon = 0.2);
        }
    }

    #[test]
    fn estimation_is_deterministic() {
        let landmarks = synthetic_landmarks(8.0, -6.0, 800, 600);
        let estimator = PoseEstimator::default();
        let a = estimator.estimate_pose(&landmarks, 800, 600, Backend::DenseMesh).unwrap();
        let b = estimator.estimate_pose(&landmarks, 800, 600, Backend::DenseMesh).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn collapsed_landmarks_fail_to_solve() {
        let landmarks = [Point::new(100.0, 100.0); CanonicalLandmark::COUNT];
        let err = PoseEstimator::default()
            .estimate_pose(&landmarks, 640, 480, Backend::Geometric)
            .unwrap_err();
        assert!(matches!(err, PoseSolveError::Degenerate(_)));
    }
}
