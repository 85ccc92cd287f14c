use std::path::PathBuf;

use thiserror::Error;

/// Reasons the perspective-n-point solve can fail.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoseSolveError {
    #[error("expected {expected} point correspondences, got {got}")]
    PointCount { expected: usize, got: usize },

    #[error("degenerate correspondence: {0}")]
    Degenerate(String),

    #[error("solver did not converge after {iterations} iterations (rms {rms:.3}px)")]
    NotConverged { iterations: usize, rms: f64 },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model deserialization error: {0}")]
    Deserialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Failed to initialise {backend} backend: {message}")]
    BackendInit { backend: String, message: String },

    #[error("Landmark inference failed: {0}")]
    Inference(String),

    #[error("Could not decode {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("Pose solve failed: {0}")]
    PoseSolve(#[from] PoseSolveError),

    #[error("Could not move {from} to {to}: {message}")]
    FileMove {
        from: PathBuf,
        to: PathBuf,
        message: String,
    },

    #[error("Could not write sidecar {path}: {message}")]
    Sidecar { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn backend_init(backend: impl Into<String>, message: impl ToString) -> Self {
        Self::BackendInit {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error must abort a whole run rather than a single image.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BackendInit { .. } | Self::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
