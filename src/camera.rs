use nalgebra::{Matrix3, Vector2, Vector3};
use serde::Serialize;

/// Default assumed horizontal field of view, in degrees.
pub const DEFAULT_FOV_DEGREES: f64 = 60.0;

/// Pinhole intrinsics derived from the image size; square pixels, no skew,
/// zero lens distortion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CameraIntrinsics {
    pub focal_length: f64,
    pub center_x: f64,
    pub center_y: f64,
}

impl CameraIntrinsics {
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.focal_length,
            0.0,
            self.center_x,
            0.0,
            self.focal_length,
            self.center_y,
            0.0,
            0.0,
            1.0,
        )
    }

    /// Project a camera-frame point to pixels.
    pub fn project(&self, p: &Vector3<f64>) -> Vector2<f64> {
        Vector2::new(
            self.focal_length * p.x / p.z + self.center_x,
            self.focal_length * p.y / p.z + self.center_y,
        )
    }

    /// Pixel to normalised image-plane coordinates.
    pub fn normalize(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(
            (pixel.x - self.center_x) / self.focal_length,
            (pixel.y - self.center_y) / self.focal_length,
        )
    }
}

/// Principal point at the image centre; focal length from the horizontal FOV.
pub fn build_intrinsics(width: u32, height: u32, fov_degrees: f64) -> CameraIntrinsics {
    let half_width = width as f64 / 2.0;
    CameraIntrinsics {
        focal_length: half_width / (fov_degrees.to_radians() / 2.0).tan(),
        center_x: half_width,
        center_y: height as f64 / 2.0,
    }
}
