use std::io;

use thiserror::Error;

/// Everything that can abort a load, training run or render.
#[derive(Debug, Error)]
pub enum HebbError {
    /// Missing/misnamed layer, degenerate model, invalid run parameters.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tensor dimensions that do not line up.
    #[error("shape error: {0}")]
    Shape(String),

    /// No unit survived the activation cutoff (or the weight filter).
    #[error("no units selected: {0}")]
    EmptySelection(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("render error: {0}")]
    Render(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HebbError>;

impl From<ndarray::ShapeError> for HebbError {
    fn from(e: ndarray::ShapeError) -> Self {
        Self::Shape(e.to_string())
    }
}

impl HebbError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }
}
