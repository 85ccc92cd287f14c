//! # frontal-triage
//!
//! Head-pose based frontal face classification and image triage.
//!
//! This crate provides:
//! - **Landmark extraction**: two interchangeable backends behind
//!   [`LandmarkExtractor`], a SeetaFace detector plus an ERT landmark cascade
//!   (dlib `shape_predictor` models) and an ONNX face mesh
//! - **Pose estimation**: perspective-n-point solve of six canonical landmarks
//!   against a generic 3D head, split into pitch, yaw and roll
//! - **Classification**: nested `high`/`medium`/`low` threshold tiers
//! - **Triage**: a directory walk that moves every image into `True/` or
//!   `False/` with a JSON sidecar
//!
//! ## Algorithm Overview
//!
//! 1. Locate the first face and its six canonical landmarks (outer eye
//!    corners, nose tip, mouth corners, chin) in full-frame pixels
//! 2. Build pinhole intrinsics from the image size and a 60 degree field of view
//! 3. Solve the rotation and translation of the generic head (DLT, then
//!    Levenberg-Marquardt on reprojection error)
//! 4. Decompose the rotation into Euler angles and fold each into [-90, 90]
//! 5. The face is frontal when |yaw| and |pitch| are under the `low` tier
//!
//! ## Quick Start
//!
//! ```rust
//! use frontal_triage::{
//!     classify, Backend, PoseAngles, PoseEstimate, ThresholdProfile, Tier,
//! };
//!
//! let pose = PoseEstimate::Available(PoseAngles {
//!     pitch: 5.0,
//!     yaw: 0.5,
//!     roll: 1.0,
//!     method: Backend::Geometric,
//!     reprojection_error: 0.2,
//!     gimbal_locked: false,
//! });
//!
//! let result = classify(&pose, &ThresholdProfile::default());
//! assert!(result.is_frontal);
//! assert_eq!(result.level, Some(Tier::High));
//! ```
//!
//! Running a whole directory:
//!
//! ```no_run
//! use frontal_triage::{open_extractor, Backend, BackendConfig, Pipeline, TriageConfig};
//! use std::path::Path;
//!
//! let config = TriageConfig::default();
//! let backend = BackendConfig::new(Backend::DenseMesh, "face_mesh.onnx");
//! let extractor = open_extractor(&backend, &config)?;
//! let summary = Pipeline::new(extractor, config)?.run(Path::new("photos"))?;
//! println!("{} frontal of {}", summary.accepted, summary.discovered);
//! # Ok::<(), frontal_triage::Error>(())
//! ```

pub mod annotate;
pub mod camera;
pub mod classify;
pub mod config;
pub mod dlib;
mod error;
pub mod extractor;
pub mod geometric;
pub mod mesh;
pub mod pnp;
pub mod pose;
pub mod shape_predictor;
pub mod sidecar;
pub mod triage;
mod types;

pub use camera::{build_intrinsics, CameraIntrinsics, DEFAULT_FOV_DEGREES};
pub use classify::{
    classify, classify_level, is_frontal, ClassificationResult, ThresholdProfile, Tier, TierBounds,
};
pub use config::{DetectorOptions, MeshOptions, PoseFailurePolicy, TensorLayout, TriageConfig};
pub use error::{Error, PoseSolveError, Result};
pub use extractor::{open_extractor, Backend, BackendConfig, LandmarkExtractor};
pub use pnp::{solve_pnp, PnpSolution, SolverOptions};
pub use pose::{HeadModel3D, PoseAngles, PoseEstimate, PoseEstimator};
pub use shape_predictor::ShapePredictor;
pub use sidecar::Sidecar;
pub use triage::{Analysis, ImageOutcome, LevelCounts, Pipeline, RunSummary, Stage};
pub use types::{BoundingBox, CanonicalLandmark, FaceCandidate, Point, Shape};
