//! Ensemble-of-regression-trees landmark cascade.
//!
//! Implements the inference half of "One Millisecond Face Alignment with an
//! Ensemble of Regression Trees" (Kazemi & Sullivan, 2014) the way dlib's
//! `shape_predictor` evaluates it:
//!
//! 1. The estimate starts as the mean shape, expressed in the unit square of
//!    the face box.
//! 2. Each cascade stage samples a fixed set of pixel probes. A probe is an
//!    anchor landmark plus an offset; the offset is warped by the similarity
//!    transform between the mean shape and the current estimate so the probes
//!    follow the face as the estimate moves.
//! 3. Every tree of the stage walks its splits on probe intensity differences
//!    and contributes the delta stored at the reached leaf.
//! 4. After the last stage the estimate is mapped back into image pixels.

use std::fs;
use std::path::Path;

use image::GrayImage;
use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{BoundingBox, Point, Shape};

/// A pixel sampling location relative to one landmark of the current estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelProbe {
    pub anchor: u16,
    /// Offset in unit-square coordinates of the mean shape.
    pub offset: Point,
}

/// Binary split on the difference of two probe intensities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub probe_a: u16,
    pub probe_b: u16,
    pub threshold: f32,
}

/// A complete binary tree stored in breadth-first order.
///
/// Split `i` has children `2i + 1` and `2i + 2`; node indices at or past
/// `splits.len()` address `leaves`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionTree {
    pub splits: Vec<Split>,
    pub leaves: Vec<Shape>,
}

impl RegressionTree {
    pub fn new(splits: Vec<Split>, leaves: Vec<Shape>) -> Result<Self> {
        if leaves.len() != splits.len() + 1 {
            return Err(Error::InvalidModel(format!(
                "tree with {} splits needs {} leaves, got {}",
                splits.len(),
                splits.len() + 1,
                leaves.len()
            )));
        }
        Ok(Self { splits, leaves })
    }

    /// Descend using precomputed probe intensities and return the leaf delta.
    pub fn leaf_for(&self, intensities: &[f32]) -> &Shape {
        let mut node = 0usize;
        while let Some(split) = self.splits.get(node) {
            let diff = intensities[split.probe_a as usize] - intensities[split.probe_b as usize];
            // dlib: greater-than goes left
            node = if diff > split.threshold {
                2 * node + 1
            } else {
                2 * node + 2
            };
        }
        &self.leaves[node - self.splits.len()]
    }

    pub fn depth(&self) -> usize {
        // Complete tree: leaves = 2^depth.
        self.leaves.len().trailing_zeros() as usize
    }
}

/// One cascade level: its probes and the forest that reads them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeStage {
    pub probes: Vec<PixelProbe>,
    pub forest: Vec<RegressionTree>,
}

impl CascadeStage {
    fn validate(&self, num_landmarks: usize) -> Result<()> {
        for probe in &self.probes {
            if probe.anchor as usize >= num_landmarks {
                return Err(Error::InvalidModel(format!(
                    "probe anchor {} out of range for {} landmarks",
                    probe.anchor, num_landmarks
                )));
            }
        }
        for tree in &self.forest {
            for split in &tree.splits {
                let max = split.probe_a.max(split.probe_b) as usize;
                if max >= self.probes.len() {
                    return Err(Error::InvalidModel(format!(
                        "split references probe {} but stage has {}",
                        max,
                        self.probes.len()
                    )));
                }
            }
            if tree.leaves.iter().any(|l| l.num_landmarks() != num_landmarks) {
                return Err(Error::InvalidModel(
                    "leaf delta size does not match mean shape".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Trained landmark predictor: mean shape plus cascade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapePredictor {
    mean_shape: Shape,
    stages: Vec<CascadeStage>,
}

impl ShapePredictor {
    /// Assemble a predictor, checking every index in the cascade.
    pub fn new(mean_shape: Shape, stages: Vec<CascadeStage>) -> Result<Self> {
        if mean_shape.num_landmarks() == 0 {
            return Err(Error::InvalidModel("mean shape is empty".into()));
        }
        for stage in &stages {
            stage.validate(mean_shape.num_landmarks())?;
        }
        Ok(Self { mean_shape, stages })
    }

    /// Load a model saved with [`ShapePredictor::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path)?;
        let model: Self = bincode::deserialize(&bytes)?;
        Self::new(model.mean_shape, model.stages)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        fs::write(path, bytes)?;
        Ok(())
    }

    pub fn num_landmarks(&self) -> usize {
        self.mean_shape.num_landmarks()
    }

    pub fn num_cascade_stages(&self) -> usize {
        self.stages.len()
    }

    /// Predict landmarks for the face in `face_rect`; output is in image pixels.
    pub fn predict(&self, image: &GrayImage, face_rect: &BoundingBox) -> Shape {
        let mut current = self.mean_shape.clone();
        let mut intensities = Vec::new();

        for stage in &self.stages {
            let warp = similarity_linear(&self.mean_shape, &current);

            intensities.clear();
            intensities.extend(stage.probes.iter().map(|probe| {
                let anchor = current[probe.anchor as usize];
                let offset = warp * Vector2::new(probe.offset.x, probe.offset.y);
                let unit = Point::new(anchor.x + offset.x, anchor.y + offset.y);
                sample_nearest(image, face_rect.denormalize_point(unit))
            }));

            for tree in &stage.forest {
                current.add_delta(tree.leaf_for(&intensities));
            }
        }

        Shape::new(
            current
                .points
                .iter()
                .map(|p| face_rect.denormalize_point(*p))
                .collect(),
        )
    }
}

/// Intensity of the pixel nearest to `p`, or zero outside the image.
fn sample_nearest(image: &GrayImage, p: Point) -> f32 {
    let x = p.x.round();
    let y = p.y.round();
    if x < 0.0 || y < 0.0 {
        return 0.0;
    }
    image
        .get_pixel_checked(x as u32, y as u32)
        .map(|px| px.0[0] as f32)
        .unwrap_or(0.0)
}

/// Linear part (scaled rotation) of the least-squares similarity transform
/// mapping `from` onto `to` (Umeyama, 1991).
pub fn similarity_linear(from: &Shape, to: &Shape) -> Matrix2<f32> {
    debug_assert_eq!(from.num_landmarks(), to.num_landmarks());
    let n = from.num_landmarks() as f32;
    let mean_from = from.centroid();
    let mean_to = to.centroid();

    let mut variance = 0.0f32;
    let mut cov = Matrix2::<f32>::zeros();
    for (a, b) in from.points.iter().zip(&to.points) {
        let da = Vector2::new(a.x - mean_from.x, a.y - mean_from.y);
        let db = Vector2::new(b.x - mean_to.x, b.y - mean_to.y);
        variance += da.norm_squared();
        cov += db * da.transpose();
    }
    variance /= n;
    cov /= n;

    if variance <= f32::EPSILON {
        return Matrix2::identity();
    }

    let svd = cov.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Matrix2::identity();
    };

    let mut s = Matrix2::<f32>::identity();
    if cov.determinant() < 0.0 {
        s[(1, 1)] = -1.0;
    }

    let rotation = u * s * v_t;
    let scale = (Matrix2::from_diagonal(&svd.singular_values) * s).trace() / variance;
    rotation * scale
}
