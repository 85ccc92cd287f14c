use std::fmt;
use std::path::PathBuf;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::TriageConfig;
use crate::error::{Error, Result};
use crate::geometric::GeometricExtractor;
use crate::mesh::DenseMeshExtractor;
use crate::types::FaceCandidate;

/// Which landmark backend produced a result.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// Face detector plus 68-point regression-tree cascade.
    Geometric,
    /// Single-face 468-point mesh network.
    DenseMesh,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Geometric => "geometric",
            Backend::DenseMesh => "dense-mesh",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Locates faces and reports their six canonical landmarks in full-frame
/// pixel coordinates.
///
/// Implementations load their models once and are then driven image by image
/// by the pipeline that owns them. No face is `Ok(vec![])`, not an error. At
/// most one candidate is returned.
pub trait LandmarkExtractor {
    fn backend(&self) -> Backend;

    fn extract(&mut self, image: &DynamicImage) -> Result<Vec<FaceCandidate>>;
}

/// Backend selection and model assets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: Backend,
    /// Landmark model: dlib `.dat`/`.dat.bz2`/`.bin` or a face mesh `.onnx`.
    pub model: PathBuf,
    /// SeetaFace detector model. Required by the geometric backend; the
    /// dense-mesh backend crops to its first face when it is present.
    #[serde(default)]
    pub detector_model: Option<PathBuf>,
}

impl BackendConfig {
    pub fn new(kind: Backend, model: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            model: model.into(),
            detector_model: None,
        }
    }

    pub fn with_detector_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.detector_model = Some(path.into());
        self
    }
}

/// Load the selected backend. Every failure here is [`Error::BackendInit`].
pub fn open_extractor(
    backend: &BackendConfig,
    config: &TriageConfig,
) -> Result<Box<dyn LandmarkExtractor>> {
    if !backend.model.is_file() {
        return Err(Error::backend_init(
            backend.kind.as_str(),
            format!("model file {} not found", backend.model.display()),
        ));
    }

    match backend.kind {
        Backend::Geometric => {
            let detector = backend.detector_model.as_deref().ok_or_else(|| {
                Error::backend_init(
                    backend.kind.as_str(),
                    "a face detector model is required (--detector-model)",
                )
            })?;
            let extractor = GeometricExtractor::open(detector, &backend.model, &config.detector)?;
            Ok(Box::new(extractor))
        }
        Backend::DenseMesh => {
            let detector = backend.detector_model.as_deref().filter(|path| {
                let found = path.is_file();
                if !found {
                    warn!(
                        detector = %path.display(),
                        "face detector not found, the mesh will see whole frames"
                    );
                }
                found
            });
            let extractor =
                DenseMeshExtractor::open(&backend.model, detector, &config.mesh, &config.detector)?;
            Ok(Box::new(extractor))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_tags_are_stable() {
        assert_eq!(Backend::Geometric.to_string(), "geometric");
        assert_eq!(
            serde_json::to_string(&Backend::DenseMesh).unwrap(),
            "\"dense-mesh\""
        );
        let parsed: Backend = serde_json::from_str("\"geometric\"").unwrap();
        assert_eq!(parsed, Backend::Geometric);
    }

    #[test]
    fn missing_model_is_a_backend_init_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = BackendConfig::new(Backend::DenseMesh, dir.path().join("absent.onnx"));
        let err = open_extractor(&backend, &TriageConfig::default())
            .err()
            .unwrap();
        assert!(err.is_fatal());
        assert!(matches!(err, Error::BackendInit { .. }));
    }

    #[test]
    fn geometric_backend_requires_detector_model() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("landmarks.dat");
        std::fs::write(&model, b"").unwrap();
        let backend = BackendConfig::new(Backend::Geometric, &model);
        let err = open_extractor(&backend, &TriageConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::BackendInit { .. }));
    }
}
