use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::classify::{ClassificationResult, ThresholdProfile, Tier};
use crate::error::{Error, Result};
use crate::extractor::Backend;

/// Metadata written next to every routed image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sidecar {
    pub roll: Option<f64>,
    pub pitch: Option<f64>,
    pub yaw: Option<f64>,
    pub method: Backend,
    pub threshold_levels: ThresholdProfile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classified_level: Option<Tier>,
}

impl Sidecar {
    pub fn new(result: &ClassificationResult, profile: &ThresholdProfile) -> Self {
        let angles = result.pose.angles();
        Self {
            roll: angles.map(|a| a.roll),
            pitch: angles.map(|a| a.pitch),
            yaw: angles.map(|a| a.yaw),
            method: result.pose.method(),
            threshold_levels: *profile,
            classified_level: result.level,
        }
    }

    /// `<stem>.json` beside `image`.
    pub fn path_for(image: &Path) -> PathBuf {
        image.with_extension("json")
    }

    /// Write the record beside `image` and return its path. An existing
    /// sidecar is never overwritten.
    pub fn write_beside(&self, image: &Path) -> Result<PathBuf> {
        let path = Self::path_for(image);
        let json = serde_json::to_string_pretty(self)?;
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .and_then(|mut file| file.write_all(json.as_bytes()))
            .map_err(|e| Error::Sidecar {
                path: path.clone(),
                message: e.to_string(),
            })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use crate::pose::{PoseAngles, PoseEstimate};
    use serde_json::Value;
    use std::fs;

    #[test]
    fn frontal_record_has_level_and_tables() {
        let profile = ThresholdProfile::default();
        let pose = PoseEstimate::Available(PoseAngles {
            pitch: 5.0,
            yaw: 0.5,
            roll: -2.0,
            method: Backend::DenseMesh,
            reprojection_error: 0.3,
            gimbal_locked: false,
        });
        let sidecar = Sidecar::new(&classify(&pose, &profile), &profile);

        let json: Value = serde_json::to_value(&sidecar).unwrap();
        assert_eq!(json["method"], "dense-mesh");
        assert_eq!(json["yaw"], 0.5);
        assert_eq!(json["roll"], -2.0);
        assert_eq!(json["classified_level"], "high");
        assert_eq!(json["threshold_levels"]["medium"]["pitch"], 16.0);
        assert_eq!(json["threshold_levels"]["low"]["yaw"], 12.0);
    }

    #[test]
    fn unavailable_pose_writes_nulls_without_level() {
        let profile = ThresholdProfile::default();
        let pose = PoseEstimate::Unavailable {
            method: Backend::Geometric,
        };
        let sidecar = Sidecar::new(&classify(&pose, &profile), &profile);

        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("shot.final.jpg");
        let path = sidecar.write_beside(&image).unwrap();
        assert_eq!(path, dir.path().join("shot.final.json"));

        let json: Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert!(json["pitch"].is_null());
        assert_eq!(json["method"], "geometric");
        assert!(json.get("classified_level").is_none());
    }

    #[test]
    fn existing_sidecar_is_not_replaced() {
        let profile = ThresholdProfile::default();
        let pose = PoseEstimate::Unavailable {
            method: Backend::DenseMesh,
        };
        let sidecar = Sidecar::new(&classify(&pose, &profile), &profile);

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("shot.json"), b"{}").unwrap();
        match sidecar.write_beside(&dir.path().join("shot.tif")) {
            Err(Error::Sidecar { path, .. }) => assert_eq!(path, dir.path().join("shot.json")),
            other => panic!("expected sidecar error, got {other:?}"),
        }
        assert_eq!(fs::read(dir.path().join("shot.json")).unwrap(), b"{}");
    }

    #[test]
    fn write_failure_names_the_sidecar() {
        let profile = ThresholdProfile::default();
        let pose = PoseEstimate::Unavailable {
            method: Backend::Geometric,
        };
        let sidecar = Sidecar::new(&classify(&pose, &profile), &profile);

        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("gone/a.png");
        let err = sidecar.write_beside(&image).unwrap_err();
        assert!(matches!(err, Error::Sidecar { ref path, .. } if path == &dir.path().join("gone/a.json")));
        assert!(err.to_string().contains("a.json"));
    }
}
