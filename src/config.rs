//! Run configuration, loadable from JSON.
//!
//! Every group carries `#[serde(default)]`, so a config file only needs the
//! keys it changes.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::camera::DEFAULT_FOV_DEGREES;
use crate::classify::ThresholdProfile;
use crate::error::{Error, Result};
use crate::pnp::SolverOptions;

/// What to do with an image whose landmarks were found but whose pose could
/// not be solved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoseFailurePolicy {
    /// Route to the rejected directory with null angles.
    #[default]
    Reject,
    /// Leave the file where it is.
    Skip,
}

/// SeetaFace detector tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorOptions {
    pub min_face_size: u32,
    pub score_thresh: f64,
    pub pyramid_scale_factor: f32,
    pub slide_window_step: u32,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            min_face_size: 20,
            score_thresh: 2.0,
            pyramid_scale_factor: 0.8,
            slide_window_step: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    #[default]
    Nchw,
    Nhwc,
}

/// Face mesh network input and output conventions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshOptions {
    /// Square input edge in pixels.
    pub input_size: u32,
    pub layout: TensorLayout,
    /// Name of the landmark output; the first output when unset.
    pub landmarks_output: Option<String>,
    /// Name of the face-presence logit output, if the network has one.
    pub face_flag_output: Option<String>,
    pub presence_threshold: f32,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            input_size: 192,
            layout: TensorLayout::Nchw,
            landmarks_output: None,
            face_flag_output: Some("conv_faceflag".into()),
            presence_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    /// Assumed horizontal field of view of the camera, in degrees.
    pub fov_degrees: f64,
    pub thresholds: ThresholdProfile,
    /// Lower-case extensions, without the dot.
    pub extensions: Vec<String>,
    pub accepted_dir: String,
    pub rejected_dir: String,
    pub on_pose_failure: PoseFailurePolicy,
    pub solver: SolverOptions,
    pub detector: DetectorOptions,
    pub mesh: MeshOptions,
    /// Classify and log only; no file is moved or written.
    pub dry_run: bool,
    /// Where landmark overlays are written, if anywhere.
    pub annotate_dir: Option<PathBuf>,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            fov_degrees: DEFAULT_FOV_DEGREES,
            thresholds: ThresholdProfile::default(),
            extensions: ["jpg", "jpeg", "png", "tif", "tiff", "webp", "avif"]
                .into_iter()
                .map(String::from)
                .collect(),
            accepted_dir: "True".into(),
            rejected_dir: "False".into(),
            on_pose_failure: PoseFailurePolicy::Reject,
            solver: SolverOptions::default(),
            detector: DetectorOptions::default(),
            mesh: MeshOptions::default(),
            dry_run: false,
            annotate_dir: None,
        }
    }
}

impl TriageConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.fov_degrees > 0.0 && self.fov_degrees < 180.0) {
            return Err(Error::Config(format!(
                "fov_degrees must lie in (0, 180), got {}",
                self.fov_degrees
            )));
        }
        self.thresholds.validate()?;
        if self.extensions.is_empty() {
            return Err(Error::Config("no image extensions configured".into()));
        }
        for dir in [&self.accepted_dir, &self.rejected_dir] {
            if dir.is_empty() || dir == "." || dir == ".." || dir.contains(['/', '\\']) {
                return Err(Error::Config(format!(
                    "routing directory {dir:?} must be a single path component"
                )));
            }
        }
        if self.accepted_dir == self.rejected_dir {
            return Err(Error::Config(
                "accepted and rejected directories must differ".into(),
            ));
        }
        if self.mesh.input_size == 0 {
            return Err(Error::Config("mesh.input_size must be positive".into()));
        }
        if self.solver.max_iterations == 0 {
            return Err(Error::Config("solver.max_iterations must be positive".into()));
        }
        Ok(())
    }

    /// Case-insensitive extension match.
    pub fn is_image(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }
}
