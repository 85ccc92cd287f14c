//! Directory triage: walk, classify, route.
//!
//! Each image goes through decode, landmark extraction, pose estimation and
//! classification, then is moved under the accepted or rejected directory of
//! the root with a JSON sidecar beside it. A failing image is logged and left
//! where it is; only a bad root or configuration aborts the run.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};
use walkdir::WalkDir;

use crate::annotate::write_annotated;
use crate::classify::{classify, ClassificationResult, Tier};
use crate::config::{PoseFailurePolicy, TriageConfig};
use crate::error::{Error, PoseSolveError, Result};
use crate::extractor::{Backend, LandmarkExtractor};
use crate::pose::{PoseAngles, PoseEstimate, PoseEstimator};
use crate::sidecar::Sidecar;
use crate::types::FaceCandidate;

/// Where in the per-image sequence a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Decode,
    Extraction,
    Pose,
    Routing,
    Sidecar,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Decode => "decode",
            Stage::Extraction => "extraction",
            Stage::Pose => "pose",
            Stage::Routing => "routing",
            Stage::Sidecar => "sidecar",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum ImageOutcome {
    Accepted { level: Option<Tier> },
    Rejected,
    NoFace,
    Failed { stage: Stage, error: Error },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LevelCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub discovered: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub no_face: usize,
    pub failed: usize,
    pub levels: LevelCounts,
}

impl RunSummary {
    fn record(&mut self, outcome: &ImageOutcome) {
        match outcome {
            ImageOutcome::Accepted { level } => {
                self.accepted += 1;
                match level {
                    Some(Tier::High) => self.levels.high += 1,
                    Some(Tier::Medium) => self.levels.medium += 1,
                    Some(Tier::Low) => self.levels.low += 1,
                    None => {}
                }
            }
            ImageOutcome::Rejected => self.rejected += 1,
            ImageOutcome::NoFace => self.no_face += 1,
            ImageOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// Landmarks and pose solve for the first face of one image.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub face: FaceCandidate,
    pub method: Backend,
    pub pose: std::result::Result<PoseAngles, PoseSolveError>,
}

impl Analysis {
    /// The pose, with a failed solve mapped to the unavailable sentinel.
    pub fn estimate(&self) -> PoseEstimate {
        match &self.pose {
            Ok(angles) => PoseEstimate::Available(*angles),
            Err(_) => PoseEstimate::Unavailable {
                method: self.method,
            },
        }
    }
}

pub struct Pipeline {
    extractor: Box<dyn LandmarkExtractor>,
    config: TriageConfig,
    estimator: PoseEstimator,
}

impl Pipeline {
    pub fn new(extractor: Box<dyn LandmarkExtractor>, config: TriageConfig) -> Result<Self> {
        config.validate()?;
        let estimator = PoseEstimator::new(config.fov_degrees, config.solver);
        Ok(Self {
            extractor,
            config,
            estimator,
        })
    }

    pub fn config(&self) -> &TriageConfig {
        &self.config
    }

    /// Extract landmarks and solve the pose. `Ok(None)` means no face.
    pub fn analyze(&mut self, image: &DynamicImage) -> Result<Option<Analysis>> {
        let Some(face) = self.extractor.extract(image)?.into_iter().next() else {
            return Ok(None);
        };
        let method = self.extractor.backend();
        let pose =
            self.estimator
                .estimate_pose(&face.landmarks, image.width(), image.height(), method);
        Ok(Some(Analysis { face, method, pose }))
    }

    /// Decode and classify a single file without touching it.
    pub fn classify_file(&mut self, path: &Path) -> Result<Option<(Analysis, ClassificationResult)>> {
        let image = decode(path)?;
        let Some(analysis) = self.analyze(&image)? else {
            return Ok(None);
        };
        let result = classify(&analysis.estimate(), &self.config.thresholds);
        Ok(Some((analysis, result)))
    }

    /// Image files under `root` in sorted order, skipping the routing
    /// directories and the overlay directory.
    pub fn discover(&self, root: &Path) -> Vec<PathBuf> {
        let excluded: HashSet<PathBuf> = [&self.config.accepted_dir, &self.config.rejected_dir]
            .into_iter()
            .map(|dir| root.join(dir))
            .chain(
                self.config
                    .annotate_dir
                    .as_deref()
                    .and_then(|dir| walked_spelling(root, dir)),
            )
            .collect();

        WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !(entry.file_type().is_dir() && excluded.contains(entry.path())))
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable directory entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file() && self.config.is_image(entry.path()))
            .map(|entry| entry.into_path())
            .collect()
    }

    /// Triage every image under `root`. Per-image failures are counted, not
    /// returned.
    pub fn run(&mut self, root: &Path) -> Result<RunSummary> {
        if !root.is_dir() {
            return Err(Error::Config(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let backend = self.extractor.backend();
        let span = info_span!("triage_run", root = %root.display(), %backend, dry_run = self.config.dry_run);
        let _guard = span.enter();

        let images = self.discover(root);
        info!(count = images.len(), "discovered images");

        let mut summary = RunSummary {
            discovered: images.len(),
            ..RunSummary::default()
        };
        for path in &images {
            let outcome = self.process_one(root, path);
            summary.record(&outcome);
        }

        info!(
            accepted = summary.accepted,
            rejected = summary.rejected,
            no_face = summary.no_face,
            failed = summary.failed,
            high = summary.levels.high,
            medium = summary.levels.medium,
            low = summary.levels.low,
            "run complete"
        );
        Ok(summary)
    }

    /// Classify and route one image found under `root`.
    pub fn process_one(&mut self, root: &Path, path: &Path) -> ImageOutcome {
        let span = info_span!("image", path = %path.display());
        let _guard = span.enter();

        let image = match decode(path) {
            Ok(image) => image,
            Err(e) => return failed(Stage::Decode, e),
        };

        let analysis = match self.analyze(&image) {
            Ok(Some(analysis)) => analysis,
            Ok(None) => {
                warn!("no face detected, leaving file in place");
                return ImageOutcome::NoFace;
            }
            Err(e) => return failed(Stage::Extraction, e),
        };

        if let Err(e) = &analysis.pose {
            match self.config.on_pose_failure {
                PoseFailurePolicy::Skip => return failed(Stage::Pose, e.clone().into()),
                PoseFailurePolicy::Reject => {
                    warn!(error = %e, "pose unavailable, treating as non-frontal")
                }
            }
        }

        let estimate = analysis.estimate();
        let result = classify(&estimate, &self.config.thresholds);
        match estimate.angles() {
            Some(a) => info!(
                frontal = result.is_frontal,
                level = result.level.map(Tier::as_str),
                yaw = a.yaw,
                pitch = a.pitch,
                roll = a.roll,
                "classified"
            ),
            None => info!(frontal = false, "classified without pose"),
        }

        let rel = path.strip_prefix(root).unwrap_or(path);
        if let Some(dir) = &self.config.annotate_dir {
            let out = dir.join(rel).with_extension("png");
            if let Err(e) = write_annotated(&image, &analysis.face, &out) {
                warn!(error = %e, out = %out.display(), "could not write overlay");
            }
        }

        let outcome = if result.is_frontal {
            ImageOutcome::Accepted {
                level: result.level,
            }
        } else {
            ImageOutcome::Rejected
        };
        if self.config.dry_run {
            return outcome;
        }

        let verdict_dir = if result.is_frontal {
            &self.config.accepted_dir
        } else {
            &self.config.rejected_dir
        };
        let dest = root.join(verdict_dir).join(rel);
        if let Err(e) = move_file(path, &dest) {
            return failed(Stage::Routing, e);
        }

        let sidecar = Sidecar::new(&result, &self.config.thresholds);
        match sidecar.write_beside(&dest) {
            Ok(json) => {
                debug!(dest = %dest.display(), sidecar = %json.display(), "routed");
                outcome
            }
            Err(e) => {
                error!(
                    stage = %Stage::Sidecar,
                    dest = %dest.display(),
                    error = %e,
                    "image routed without sidecar"
                );
                ImageOutcome::Failed {
                    stage: Stage::Sidecar,
                    error: e,
                }
            }
        }
    }
}

/// `dir` as the walk of `root` would spell it, or `None` when it lies
/// outside `root` or does not exist yet.
fn walked_spelling(root: &Path, dir: &Path) -> Option<PathBuf> {
    let dir = fs::canonicalize(dir).ok()?;
    let canonical_root = fs::canonicalize(root).ok()?;
    let rel = dir.strip_prefix(&canonical_root).ok()?;
    Some(root.join(rel))
}

fn failed(stage: Stage, error: Error) -> ImageOutcome {
    error!(%stage, error = %error, "image failed");
    ImageOutcome::Failed { stage, error }
}

fn decode(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|e| Error::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Rename `from` to `to`. An existing destination, or an existing sidecar for
/// it, is an error and the source stays put.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    let move_error = |message: String| Error::FileMove {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        message,
    };
    if to.exists() {
        return Err(move_error("destination already exists".into()));
    }
    let sidecar = Sidecar::path_for(to);
    if sidecar.exists() {
        return Err(move_error(format!(
            "sidecar {} already exists",
            sidecar.display()
        )));
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| move_error(e.to_string()))?;
    }
    fs::rename(from, to).map_err(|e| move_error(e.to_string()))
}
