// src/error.rs
use std::fmt;

use crate::model::Mode;

/// Fatal errors raised by graph construction and batch validation.
///
/// All of them are surfaced through `anyhow::Result` by the public API and can
/// be recovered with `err.downcast_ref::<ModelError>()`.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    /// Unknown cell/encoder/context/optimizer type or an invalid combination.
    Configuration(String),
    /// Batch or turn dimensions disagree.
    ShapeMismatch(String),
    /// The operation is not available in the instance's mode.
    ModeMismatch { expected: Mode, actual: Mode },
}

impl ModelError {
    pub fn config(msg: impl Into<String>) -> Self {
        ModelError::Configuration(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        ModelError::ShapeMismatch(msg.into())
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            ModelError::ShapeMismatch(msg) => write!(f, "shape mismatch: {}", msg),
            ModelError::ModeMismatch { expected, actual } => {
                write!(f, "operation requires {} mode, model was built for {}", expected, actual)
            }
        }
    }
}

impl std::error::Error for ModelError {}
