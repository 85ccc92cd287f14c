//! End-to-end triage runs with a scripted extractor.
//!
//! The stub reads the red channel of the top-left pixel to decide what face,
//! if any, to report, and projects the generic head model at the requested
//! yaw and pitch to produce its landmarks.

use std::fs;
use std::path::Path;

use frontal_triage::{
    build_intrinsics, Backend, BoundingBox, CanonicalLandmark, FaceCandidate, HeadModel3D,
    LandmarkExtractor, Pipeline, Point, PoseFailurePolicy, RunSummary, TriageConfig,
    DEFAULT_FOV_DEGREES,
};
use image::{DynamicImage, Rgb, RgbImage};
use nalgebra::{Rotation3, Vector3};
use serde_json::Value;

const FRONTAL: u8 = 10;
const MEDIUM: u8 = 15;
const TURNED: u8 = 20;
const NO_FACE: u8 = 30;
const COLLAPSED: u8 = 40;

struct ScriptedExtractor;

fn projected(yaw: f64, pitch: f64, width: u32, height: u32) -> [Point; CanonicalLandmark::COUNT] {
    let camera = build_intrinsics(width, height, DEFAULT_FOV_DEGREES);
    let rotation = Rotation3::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI)
        * Rotation3::from_axis_angle(&Vector3::y_axis(), yaw.to_radians())
        * Rotation3::from_axis_angle(&Vector3::x_axis(), pitch.to_radians());
    let t = Vector3::new(0.0, 0.0, 3000.0);

    let mut out = [Point::default(); CanonicalLandmark::COUNT];
    for (slot, p) in out.iter_mut().zip(HeadModel3D::generic().points()) {
        let px = camera.project(&(rotation * p + t));
        *slot = Point::new(px.x as f32, px.y as f32);
    }
    out
}

impl LandmarkExtractor for ScriptedExtractor {
    fn backend(&self) -> Backend {
        Backend::DenseMesh
    }

    fn extract(&mut self, image: &DynamicImage) -> frontal_triage::Result<Vec<FaceCandidate>> {
        let (w, h) = (image.width(), image.height());
        let region = BoundingBox::new(0.0, 0.0, w as f32, h as f32);
        let landmarks = match image.to_rgb8().get_pixel(0, 0)[0] {
            FRONTAL => projected(0.0, 0.0, w, h),
            MEDIUM => projected(5.0, 15.0, w, h),
            TURNED => projected(20.0, 25.0, w, h),
            COLLAPSED => [Point::new(50.0, 50.0); CanonicalLandmark::COUNT],
            _ => return Ok(Vec::new()),
        };
        Ok(vec![FaceCandidate::new(region, landmarks)])
    }
}

fn write_image(path: &Path, code: u8) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    RgbImage::from_pixel(320, 240, Rgb([code, 0, 0]))
        .save(path)
        .unwrap();
}

fn pipeline(config: TriageConfig) -> Pipeline {
    Pipeline::new(Box::new(ScriptedExtractor), config).unwrap()
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn mixed_batch_is_routed_and_counted() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_image(&root.join("sub/a.png"), FRONTAL);
    fs::write(root.join("b.jpg"), b"definitely not a jpeg").unwrap();
    write_image(&root.join("c.png"), TURNED);
    write_image(&root.join("d.png"), NO_FACE);
    write_image(&root.join("e.png"), COLLAPSED);
    fs::write(root.join("notes.txt"), b"ignored").unwrap();

    let summary = pipeline(TriageConfig::default()).run(root).unwrap();
    assert_eq!(summary.discovered, 5);
    assert_eq!(summary.accepted, 1);
    assert_eq!(summary.levels.high, 1);
    assert_eq!(summary.rejected, 2);
    assert_eq!(summary.no_face, 1);
    assert_eq!(summary.failed, 1);

    // frontal: moved with relative path preserved, sidecar carries the tier
    assert!(!root.join("sub/a.png").exists());
    assert!(root.join("True/sub/a.png").exists());
    let sidecar = read_json(&root.join("True/sub/a.json"));
    assert_eq!(sidecar["classified_level"], "high");
    assert_eq!(sidecar["method"], "dense-mesh");
    assert!(sidecar["yaw"].as_f64().unwrap().abs() < 0.5);
    assert_eq!(sidecar["threshold_levels"]["high"]["pitch"], 11.0);

    // turned away: rejected, no tier
    assert!(root.join("False/c.png").exists());
    let sidecar = read_json(&root.join("False/c.json"));
    assert!(sidecar.get("classified_level").is_none());
    assert!(sidecar["yaw"].as_f64().unwrap().abs() > 12.0);

    // unsolvable pose: rejected with null angles
    let sidecar = read_json(&root.join("False/e.json"));
    assert!(sidecar["roll"].is_null() && sidecar["pitch"].is_null() && sidecar["yaw"].is_null());

    // no face and undecodable: untouched, no sidecar
    assert!(root.join("d.png").exists());
    assert!(!root.join("d.json").exists());
    assert!(!root.join("True/d.json").exists() && !root.join("False/d.json").exists());
    assert!(root.join("b.jpg").exists());
    assert!(root.join("notes.txt").exists());
}

#[test]
fn corrupt_image_does_not_stop_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_image(&root.join("1.png"), FRONTAL);
    fs::write(root.join("2.png"), b"\x89PNG truncated").unwrap();
    write_image(&root.join("3.png"), TURNED);

    let summary = pipeline(TriageConfig::default()).run(root).unwrap();
    assert_eq!(summary.failed, 1);
    assert!(root.join("True/1.png").exists());
    assert!(root.join("False/3.png").exists());
    assert!(root.join("2.png").exists());
}

#[test]
fn medium_tier_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    write_image(&dir.path().join("m.png"), MEDIUM);

    let summary = pipeline(TriageConfig::default()).run(dir.path()).unwrap();
    assert_eq!(summary.levels.medium, 1);
    let sidecar = read_json(&dir.path().join("True/m.json"));
    assert_eq!(sidecar["classified_level"], "medium");
}

#[test]
fn skip_policy_leaves_unsolvable_images_in_place() {
    let dir = tempfile::tempdir().unwrap();
    write_image(&dir.path().join("e.png"), COLLAPSED);

    let config = TriageConfig {
        on_pose_failure: PoseFailurePolicy::Skip,
        ..TriageConfig::default()
    };
    let summary = pipeline(config).run(dir.path()).unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.rejected, 0);
    assert!(dir.path().join("e.png").exists());
    assert!(!dir.path().join("False").exists());
}

#[test]
fn dry_run_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    write_image(&dir.path().join("a.png"), FRONTAL);
    write_image(&dir.path().join("c.png"), TURNED);

    let config = TriageConfig {
        dry_run: true,
        ..TriageConfig::default()
    };
    let summary = pipeline(config).run(dir.path()).unwrap();
    assert_eq!(summary.accepted, 1);
    assert_eq!(summary.rejected, 1);
    assert!(dir.path().join("a.png").exists());
    assert!(!dir.path().join("True").exists());
    assert!(!dir.path().join("False").exists());
}

#[test]
fn rerun_skips_routed_directories() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_image(&root.join("a.png"), FRONTAL);
    write_image(&root.join("c.png"), TURNED);
    write_image(&root.join("d.png"), NO_FACE);

    pipeline(TriageConfig::default()).run(root).unwrap();
    let second = pipeline(TriageConfig::default()).run(root).unwrap();
    assert_eq!(
        second,
        RunSummary {
            discovered: 1,
            no_face: 1,
            ..RunSummary::default()
        }
    );
}

#[test]
fn destination_collision_keeps_source() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_image(&root.join("a.png"), FRONTAL);
    fs::create_dir_all(root.join("True")).unwrap();
    fs::write(root.join("True/a.png"), b"older").unwrap();

    let summary = pipeline(TriageConfig::default()).run(root).unwrap();
    assert_eq!(summary.failed, 1);
    assert!(root.join("a.png").exists());
    assert_eq!(fs::read(root.join("True/a.png")).unwrap(), b"older");
    assert!(!root.join("True/a.json").exists());
}

#[test]
fn shared_stem_keeps_first_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_image(&root.join("shot.png"), FRONTAL);
    write_image(&root.join("shot.tif"), MEDIUM);

    let summary = pipeline(TriageConfig::default()).run(root).unwrap();
    assert_eq!(summary.accepted, 1);
    assert_eq!(summary.levels.high, 1);
    assert_eq!(summary.failed, 1);

    assert!(root.join("True/shot.png").exists());
    assert_eq!(read_json(&root.join("True/shot.json"))["classified_level"], "high");
    assert!(root.join("shot.tif").exists());
    assert!(!root.join("True/shot.tif").exists());
}

#[test]
fn overlays_inside_the_root_are_not_rediscovered() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_image(&root.join("a.png"), FRONTAL);
    fs::create_dir_all(root.join("x")).unwrap();

    let config = TriageConfig {
        annotate_dir: Some(root.join("x/../overlays")),
        ..TriageConfig::default()
    };
    let first = pipeline(config.clone()).run(root).unwrap();
    assert_eq!(first.accepted, 1);
    assert!(root.join("overlays/a.png").exists());

    let second = pipeline(config).run(root).unwrap();
    assert_eq!(second, RunSummary::default());
    assert!(root.join("overlays/a.png").exists());
}

#[test]
fn overlays_are_written_for_classified_images() {
    let dir = tempfile::tempdir().unwrap();
    let overlays = tempfile::tempdir().unwrap();
    write_image(&dir.path().join("sub/a.png"), FRONTAL);
    write_image(&dir.path().join("d.png"), NO_FACE);

    let config = TriageConfig {
        annotate_dir: Some(overlays.path().to_path_buf()),
        dry_run: true,
        ..TriageConfig::default()
    };
    pipeline(config).run(dir.path()).unwrap();
    assert!(overlays.path().join("sub/a.png").exists());
    assert!(!overlays.path().join("d.png").exists());
}

#[test]
fn repeated_classification_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("m.png");
    write_image(&path, MEDIUM);

    let mut pipeline = pipeline(TriageConfig::default());
    let (_, first) = pipeline.classify_file(&path).unwrap().unwrap();
    let (_, second) = pipeline.classify_file(&path).unwrap().unwrap();
    assert_eq!(first, second);
    assert!(path.exists());
}

#[test]
fn missing_root_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let err = pipeline(TriageConfig::default())
        .run(&dir.path().join("nope"))
        .unwrap_err();
    assert!(err.is_fatal());
}
