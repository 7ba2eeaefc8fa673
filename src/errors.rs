use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the segmentation pipeline.
///
/// Every stage of [`crate::Segmenter::segment`] fails with exactly one of these
/// variants; the caller never receives a partially built overlay.
#[derive(Error, Debug)]
pub enum SegError {
    #[error("Invalid image: {reason}")]
    InvalidImage { reason: String },

    /// The load cause is shared so that every caller blocked on the same
    /// load attempt observes the same failure.
    #[error("Model load error: {operation} failed for {locator}")]
    ModelLoad {
        locator: String,
        operation: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    #[error("Model is not ready (state: {state})")]
    NotReady { state: &'static str },

    #[error("Inference error: {operation} failed")]
    Inference {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Invalid model output: expected {expected}, got shape {actual:?}")]
    InvalidOutput { expected: String, actual: Vec<usize> },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: BoxError,
    },
}

pub type Result<T> = std::result::Result<T, SegError>;

impl SegError {
    pub fn invalid_image(reason: impl Into<String>) -> Self {
        Self::InvalidImage {
            reason: reason.into(),
        }
    }

    pub fn model_load<E>(locator: impl ToString, operation: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ModelLoad {
            locator: locator.to_string(),
            operation: operation.into(),
            source: Arc::new(source),
        }
    }

    pub fn inference<E>(operation: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Inference {
            operation: operation.into(),
            source: source.into(),
        }
    }
}

/// Convert ONNX Runtime errors to inference errors.
///
/// Load-time engine failures are wrapped explicitly with
/// [`SegError::model_load`]; anything reaching this conversion happened while
/// running a session.
impl From<ort::Error> for SegError {
    fn from(err: ort::Error) -> Self {
        Self::inference("ort operation", err)
    }
}

/// Convert ndarray shape errors to inference errors.
impl From<ndarray::ShapeError> for SegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::inference("tensor shape conversion", err)
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that has a path at hand should construct [`SegError::FileSystem`]
/// directly.
impl From<std::io::Error> for SegError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for SegError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}
