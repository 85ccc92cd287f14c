//! Geometric-feature backend: SeetaFace detection followed by the 68-point
//! regression-tree cascade.

use std::path::Path;

use image::{DynamicImage, GrayImage};
use rustface::{Detector, ImageData};
use tracing::debug;

use crate::config::DetectorOptions;
use crate::dlib::load_landmark_model;
use crate::error::{Error, Result};
use crate::extractor::{Backend, LandmarkExtractor};
use crate::shape_predictor::ShapePredictor;
use crate::types::{BoundingBox, CanonicalLandmark, FaceCandidate};

/// Canonical landmarks in the iBUG 68-point layout.
pub const IBUG_68_INDICES: [usize; CanonicalLandmark::COUNT] = [36, 45, 30, 48, 54, 8];

pub struct GeometricExtractor {
    detector: Box<dyn Detector>,
    predictor: ShapePredictor,
}

impl GeometricExtractor {
    pub fn open(detector_model: &Path, landmark_model: &Path, options: &DetectorOptions) -> Result<Self> {
        let backend = Backend::Geometric.as_str();
        let detector = open_face_detector(Backend::Geometric, detector_model, options)?;

        let predictor = load_landmark_model(landmark_model).map_err(|e| {
            Error::backend_init(
                backend,
                format!("landmark model {}: {e}", landmark_model.display()),
            )
        })?;
        check_landmark_count(&predictor)?;

        debug!(
            landmarks = predictor.num_landmarks(),
            stages = predictor.num_cascade_stages(),
            "geometric backend ready"
        );
        Ok(Self {
            detector,
            predictor,
        })
    }
}

/// Load a SeetaFace model and apply the detector tunables. Failures are
/// reported against `backend`.
pub fn open_face_detector(
    backend: Backend,
    path: &Path,
    options: &DetectorOptions,
) -> Result<Box<dyn Detector>> {
    let path_str = path
        .to_str()
        .ok_or_else(|| Error::backend_init(backend.as_str(), "detector path is not valid UTF-8"))?;
    let mut detector = rustface::create_detector(path_str).map_err(|e| {
        Error::backend_init(
            backend.as_str(),
            format!("face detector {}: {e}", path.display()),
        )
    })?;
    detector.set_min_face_size(options.min_face_size);
    detector.set_score_thresh(options.score_thresh);
    detector.set_pyramid_scale_factor(options.pyramid_scale_factor);
    detector.set_slide_window_step(options.slide_window_step, options.slide_window_step);
    Ok(detector)
}

/// Box of the first face in detector order, in frame pixels.
pub fn detect_first_face(detector: &mut dyn Detector, gray: &GrayImage) -> Option<BoundingBox> {
    let (width, height) = gray.dimensions();
    let faces = detector.detect(&ImageData::new(gray.as_raw(), width, height));
    debug!(faces = faces.len(), "seetaface detection");
    faces.first().map(|face| {
        let bbox = face.bbox();
        BoundingBox::new(
            bbox.x() as f32,
            bbox.y() as f32,
            bbox.width() as f32,
            bbox.height() as f32,
        )
    })
}

fn check_landmark_count(predictor: &ShapePredictor) -> Result<()> {
    if predictor.num_landmarks() < 68 {
        return Err(Error::backend_init(
            Backend::Geometric.as_str(),
            format!(
                "landmark model has {} points, the iBUG 68-point layout is required",
                predictor.num_landmarks()
            ),
        ));
    }
    Ok(())
}

/// Run the cascade inside `region` and keep the canonical six.
fn canonical_landmarks(
    predictor: &ShapePredictor,
    gray: &GrayImage,
    region: BoundingBox,
) -> Result<FaceCandidate> {
    let shape = predictor.predict(gray, &region);
    FaceCandidate::from_dense(region, &shape.points, &IBUG_68_INDICES).ok_or_else(|| {
        Error::Inference(format!(
            "shape predictor returned {} points",
            shape.num_landmarks()
        ))
    })
}

impl LandmarkExtractor for GeometricExtractor {
    fn backend(&self) -> Backend {
        Backend::Geometric
    }

    fn extract(&mut self, image: &DynamicImage) -> Result<Vec<FaceCandidate>> {
        let gray = image.to_luma8();
        let Some(region) = detect_first_face(self.detector.as_mut(), &gray) else {
            return Ok(Vec::new());
        };
        Ok(vec![canonical_landmarks(&self.predictor, &gray, region)?])
    }
}
