//! Dense-mesh backend: a single-face 468-point face mesh network run through
//! ONNX Runtime.
//!
//! With a face detector the network sees a padded crop around the first
//! detected face; without one, or when the detector finds nothing, it sees
//! the whole frame and its face flag decides.

use std::fmt;
use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use rustface::Detector;
use tracing::debug;

use crate::config::{DetectorOptions, MeshOptions, TensorLayout};
use crate::error::{Error, Result};
use crate::extractor::{Backend, LandmarkExtractor};
use crate::geometric::{detect_first_face, open_face_detector};
use crate::types::{BoundingBox, CanonicalLandmark, FaceCandidate, Point};

/// Canonical landmarks in the 468-point face mesh topology.
pub const MESH_468_INDICES: [usize; CanonicalLandmark::COUNT] = [33, 263, 1, 61, 291, 152];

pub const MESH_POINTS: usize = 468;

/// Fraction of the detector box added around it before cropping.
pub const ROI_PADDING: f32 = 0.25;

pub struct DenseMeshExtractor {
    session: Session,
    detector: Option<Box<dyn Detector>>,
    options: MeshOptions,
}

impl DenseMeshExtractor {
    pub fn open(
        model: &Path,
        detector_model: Option<&Path>,
        options: &MeshOptions,
        detector_options: &DetectorOptions,
    ) -> Result<Self> {
        let init = |e: &dyn fmt::Display| {
            Error::backend_init(
                Backend::DenseMesh.as_str(),
                format!("{}: {e}", model.display()),
            )
        };
        let session = Session::builder()
            .map_err(|e| init(&e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| init(&e))?
            .commit_from_file(model)
            .map_err(|e| init(&e))?;

        let detector = detector_model
            .map(|path| open_face_detector(Backend::DenseMesh, path, detector_options))
            .transpose()?;

        debug!(
            model = %model.display(),
            cropped = detector.is_some(),
            "dense mesh backend ready"
        );
        Ok(Self {
            session,
            detector,
            options: options.clone(),
        })
    }
}

/// Resize to `size` x `size` and scale channels into [-1, 1].
pub fn prepare_input(image: &RgbImage, size: u32, layout: TensorLayout) -> Vec<f32> {
    let resized = image::imageops::resize(image, size, size, FilterType::Triangle);
    let plane = (size * size) as usize;
    let mut data = vec![0.0f32; 3 * plane];
    for (i, pixel) in resized.pixels().enumerate() {
        for c in 0..3 {
            let value = pixel[c] as f32 / 127.5 - 1.0;
            match layout {
                TensorLayout::Nchw => data[c * plane + i] = value,
                TensorLayout::Nhwc => data[3 * i + c] = value,
            }
        }
    }
    data
}

/// The detector box grown by [`ROI_PADDING`] and clipped to the frame, on
/// whole pixels.
pub fn face_roi(face: &BoundingBox, width: u32, height: u32) -> BoundingBox {
    let pad_w = face.width * ROI_PADDING;
    let pad_h = face.height * ROI_PADDING;
    let x0 = (face.x - pad_w / 2.0).floor().clamp(0.0, width.saturating_sub(1) as f32);
    let y0 = (face.y - pad_h / 2.0).floor().clamp(0.0, height.saturating_sub(1) as f32);
    let x1 = (face.x + face.width + pad_w / 2.0).ceil().min(width as f32);
    let y1 = (face.y + face.height + pad_h / 2.0).ceil().min(height as f32);
    BoundingBox::new(x0, y0, (x1 - x0).max(1.0), (y1 - y0).max(1.0))
}

/// Turn an `N x 3` landmark tensor in input-pixel units into a full-frame
/// candidate. `roi` is the frame area the network saw; the region is the
/// bounding box of all mesh points.
pub fn candidate_from_mesh(raw: &[f32], input_size: u32, roi: &BoundingBox) -> Result<FaceCandidate> {
    if raw.len() < MESH_POINTS * 3 {
        return Err(Error::Inference(format!(
            "face mesh output has {} values, expected at least {}",
            raw.len(),
            MESH_POINTS * 3
        )));
    }
    let sx = roi.width / input_size as f32;
    let sy = roi.height / input_size as f32;
    let points: Vec<Point> = raw
        .chunks_exact(3)
        .map(|xyz| Point::new(roi.x + xyz[0] * sx, roi.y + xyz[1] * sy))
        .collect();

    let (mut min, mut max) = (points[0], points[0]);
    for p in &points {
        min = Point::new(min.x.min(p.x), min.y.min(p.y));
        max = Point::new(max.x.max(p.x), max.y.max(p.y));
    }
    let region = BoundingBox::new(min.x, min.y, max.x - min.x, max.y - min.y);

    FaceCandidate::from_dense(region, &points, &MESH_468_INDICES)
        .ok_or_else(|| Error::Inference("face mesh output is missing canonical points".into()))
}

fn inference(e: impl fmt::Display) -> Error {
    Error::Inference(e.to_string())
}

pub fn sigmoid(logit: f32) -> f32 {
    1.0 / (1.0 + (-logit).exp())
}

impl LandmarkExtractor for DenseMeshExtractor {
    fn backend(&self) -> Backend {
        Backend::DenseMesh
    }

    fn extract(&mut self, image: &DynamicImage) -> Result<Vec<FaceCandidate>> {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        let (size, layout) = (self.options.input_size, self.options.layout);
        let face = self
            .detector
            .as_mut()
            .and_then(|detector| detect_first_face(detector.as_mut(), &image.to_luma8()));

        let (roi, data) = match face {
            Some(face) => {
                let roi = face_roi(&face, width, height);
                let crop = image::imageops::crop_imm(
                    &rgb,
                    roi.x as u32,
                    roi.y as u32,
                    roi.width as u32,
                    roi.height as u32,
                )
                .to_image();
                (roi, prepare_input(&crop, size, layout))
            }
            None => {
                if self.detector.is_some() {
                    debug!("no detector face, running the mesh on the whole frame");
                }
                let roi = BoundingBox::new(0.0, 0.0, width as f32, height as f32);
                (roi, prepare_input(&rgb, size, layout))
            }
        };

        let side = size as i64;
        let shape = match layout {
            TensorLayout::Nchw => vec![1, 3, side, side],
            TensorLayout::Nhwc => vec![1, side, side, 3],
        };
        let input = Tensor::from_array((shape, data)).map_err(inference)?;
        let outputs = self.session.run(ort::inputs![input]).map_err(inference)?;

        if let Some(name) = &self.options.face_flag_output {
            if let Some(flag) = outputs.get(name.as_str()) {
                let (_, logits) = flag.try_extract_tensor::<f32>().map_err(inference)?;
                let presence = logits.first().copied().map(sigmoid).unwrap_or(0.0);
                if presence < self.options.presence_threshold {
                    debug!(presence, "face mesh reports no face");
                    return Ok(Vec::new());
                }
            }
        }

        let landmarks = match &self.options.landmarks_output {
            Some(name) => outputs
                .get(name.as_str())
                .ok_or_else(|| Error::Inference(format!("model has no output named {name}")))?,
            None => &outputs[0],
        };
        let (_, raw) = landmarks.try_extract_tensor::<f32>().map_err(inference)?;
        Ok(vec![candidate_from_mesh(raw, size, &roi)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_is_scaled_to_unit_range_in_planar_order() {
        let mut image = RgbImage::new(4, 4);
        for p in image.pixels_mut() {
            *p = image::Rgb([255, 0, 51]);
        }
        let data = prepare_input(&image, 2, TensorLayout::Nchw);
        assert_eq!(data.len(), 12);
        assert!(data[..4].iter().all(|v| (*v - 1.0).abs() < 1e-6));
        assert!(data[4..8].iter().all(|v| (*v + 1.0).abs() < 1e-6));
        assert!(data[8..].iter().all(|v| (*v + 0.6).abs() < 1e-6));

        let interleaved = prepare_input(&image, 2, TensorLayout::Nhwc);
        assert!((interleaved[0] - 1.0).abs() < 1e-6);
        assert!((interleaved[1] + 1.0).abs() < 1e-6);
        assert!((interleaved[2] + 0.6).abs() < 1e-6);
    }

    #[test]
    fn mesh_points_scale_to_frame_pixels() {
        let mut raw = vec![0.0f32; MESH_POINTS * 3];
        for i in 0..MESH_POINTS {
            raw[3 * i] = 96.0;
            raw[3 * i + 1] = 96.0;
        }
        raw[3 * 33] = 48.0;
        raw[3 * 33 + 1] = 24.0;
        raw[3 * 152 + 1] = 192.0;

        let frame = BoundingBox::new(0.0, 0.0, 640.0, 480.0);
        let face = candidate_from_mesh(&raw, 192, &frame).unwrap();
        let eye = face.landmark(CanonicalLandmark::LeftEyeOuter);
        assert!((eye.x - 160.0).abs() < 1e-3);
        assert!((eye.y - 60.0).abs() < 1e-3);
        let nose = face.landmark(CanonicalLandmark::NoseTip);
        assert!((nose.x - 320.0).abs() < 1e-3 && (nose.y - 240.0).abs() < 1e-3);
        assert!((face.landmark(CanonicalLandmark::Chin).y - 480.0).abs() < 1e-3);
        assert!((face.region.x - 160.0).abs() < 1e-3);
        assert!((face.region.height - 420.0).abs() < 1e-3);
    }

    #[test]
    fn crop_points_map_back_to_the_frame() {
        let face = BoundingBox::new(400.0, 200.0, 96.0, 96.0);
        let roi = face_roi(&face, 640, 480);
        assert_eq!(roi, BoundingBox::new(388.0, 188.0, 120.0, 120.0));

        let mut raw = vec![96.0f32; MESH_POINTS * 3];
        raw[3 * 33] = 0.0;
        raw[3 * 33 + 1] = 0.0;
        raw[3 * 152] = 192.0;
        raw[3 * 152 + 1] = 192.0;

        let candidate = candidate_from_mesh(&raw, 192, &roi).unwrap();
        let eye = candidate.landmark(CanonicalLandmark::LeftEyeOuter);
        assert!((eye.x - 388.0).abs() < 1e-3 && (eye.y - 188.0).abs() < 1e-3);
        let nose = candidate.landmark(CanonicalLandmark::NoseTip);
        assert!((nose.x - 448.0).abs() < 1e-3 && (nose.y - 248.0).abs() < 1e-3);
        let chin = candidate.landmark(CanonicalLandmark::Chin);
        assert!((chin.x - 508.0).abs() < 1e-3 && (chin.y - 308.0).abs() < 1e-3);
    }

    #[test]
    fn roi_is_clipped_to_the_frame() {
        let roi = face_roi(&BoundingBox::new(-10.0, 420.0, 100.0, 100.0), 640, 480);
        assert_eq!(roi.x, 0.0);
        assert_eq!(roi.y, 407.0);
        assert!(roi.x + roi.width <= 640.0);
        assert_eq!(roi.y + roi.height, 480.0);

        let roi = face_roi(&BoundingBox::new(0.0, 0.0, 640.0, 480.0), 640, 480);
        assert_eq!(roi, BoundingBox::new(0.0, 0.0, 640.0, 480.0));
    }

    #[test]
    fn short_mesh_output_is_an_inference_error() {
        let frame = BoundingBox::new(0.0, 0.0, 640.0, 480.0);
        let err = candidate_from_mesh(&[0.0; 30], 192, &frame).unwrap_err();
        assert!(matches!(err, Error::Inference(_)));
    }

    #[test]
    fn sigmoid_midpoint() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(8.0) > 0.99);
        assert!(sigmoid(-8.0) < 0.01);
    }
}
