//! Error taxonomy shared by every stage of the pipeline.
//!
//! Nothing in the workspace retries: a `QatError` always surfaces to the
//! top-level caller and terminates the run.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, QatError>;

#[derive(Debug, Error)]
pub enum QatError {
    /// Missing or invalid user input; the pipeline does not start.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Representative input does not fit the model's first layer.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A state transition was attempted while its invariants were not met.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// The quantizer could not rewrite the float graph.
    #[error("graph rewrite failed: {0}")]
    GraphRewrite(String),

    /// The converter could not lower the frozen graph.
    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Fieldless discriminant of [`QatError`], convenient for matching in tests
/// and for structured log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    ShapeMismatch,
    Precondition,
    GraphRewrite,
    Conversion,
    Candle,
    Io,
    Json,
}

impl QatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
            Self::Precondition(_) => ErrorKind::Precondition,
            Self::GraphRewrite(_) => ErrorKind::GraphRewrite,
            Self::Conversion(_) => ErrorKind::Conversion,
            Self::Candle(_) => ErrorKind::Candle,
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_) => ErrorKind::Json,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn rewrite(msg: impl Into<String>) -> Self {
        Self::GraphRewrite(msg.into())
    }

    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion(msg.into())
    }
}
