//! Landmark overlays for auditing a run.

use std::fs;
use std::path::Path;

use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::error::{Error, Result};
use crate::types::FaceCandidate;

const LANDMARK_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const REGION_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Copy of `image` with the face region and the six landmarks drawn.
pub fn draw_landmarks(image: &DynamicImage, face: &FaceCandidate) -> RgbImage {
    let mut canvas = image.to_rgb8();
    let radius = ((canvas.width().min(canvas.height()) / 200).max(2)) as i32;

    let region = &face.region;
    if region.width >= 1.0 && region.height >= 1.0 {
        let rect = Rect::at(region.x.round() as i32, region.y.round() as i32)
            .of_size(region.width.round() as u32, region.height.round() as u32);
        draw_hollow_rect_mut(&mut canvas, rect, REGION_COLOR);
    }
    for p in &face.landmarks {
        draw_filled_circle_mut(
            &mut canvas,
            (p.x.round() as i32, p.y.round() as i32),
            radius,
            LANDMARK_COLOR,
        );
    }
    canvas
}

/// Draw and save as PNG at `out`, creating parent directories.
pub fn write_annotated(image: &DynamicImage, face: &FaceCandidate, out: &Path) -> Result<()> {
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)?;
    }
    draw_landmarks(image, face)
        .save_with_format(out, image::ImageFormat::Png)
        .map_err(|e| Error::Io(std::io::Error::other(e)))
}
