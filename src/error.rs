use thiserror::Error;

use crate::enums::ScalarType;

/// Errors raised inside the reslice pipeline.
///
/// Pipeline entry points never return these to callers: a layer that hits one
/// logs it and produces no output for the current update.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResliceError {
    /// Resampling is only defined for types exactly representable as `f64`
    #[error("Unsupported scalar type for resampling: {0:?}")]
    UnsupportedScalarType(ScalarType),

    /// A matrix that must be inverted has a zero determinant
    #[error("Singular matrix: {0}")]
    SingularMatrix(&'static str),

    /// The volume has no voxels along at least one axis
    #[error("Empty volume: dimensions {0:?}")]
    EmptyVolume((usize, usize, usize)),

    /// Buffer or tensor field does not match the expected shape
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Configuration could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Reading or writing a file failed
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ResliceError {
    fn from(err: std::io::Error) -> Self {
        ResliceError::Io(err.to_string())
    }
}

impl From<image::ImageError> for ResliceError {
    fn from(err: image::ImageError) -> Self {
        ResliceError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ResliceError {
    fn from(err: serde_json::Error) -> Self {
        ResliceError::Config(err.to_string())
    }
}
