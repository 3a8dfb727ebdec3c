use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("tensor does not require gradient and has no gradient function")]
    NotTracked,

    #[error("gradient can only be implicitly created for single-element outputs, got shape {shape:?}")]
    ImplicitGradientForNonScalar { shape: Vec<usize> },

    #[error("upstream gradient has shape {actual:?}, but the output has shape {expected:?}")]
    GradientShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("shape mismatch in {operation}: expected {expected}, got {actual:?}")]
    ShapeMismatch {
        operation: &'static str,
        expected: String,
        actual: Vec<usize>,
    },

    #[error("padded input length {padded_length} is shorter than the kernel's receptive field {receptive_field}")]
    InputTooShort {
        padded_length: usize,
        receptive_field: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
