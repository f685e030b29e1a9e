//! Custom error types for diffusion-canvas.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the diffusion-canvas library.
#[derive(Error, Debug)]
pub enum Error {
    /// A region rectangle is empty or inverted.
    #[error("invalid region bounds: {reason}")]
    InvalidRegion { reason: String },

    /// Invalid parameter value.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// A prompt was encoded before being tokenized.
    #[error("prompt in diffusion region must be tokenized before encoding")]
    PromptNotTokenized,

    /// Classifier-free-guidance pairing was attempted before the prompt was encoded.
    #[error("prompt in diffusion region must be encoded before guidance pairing")]
    PromptNotEncoded,

    /// An image region entered the diffusion loop before its reference was encoded.
    #[error("reference image must be encoded into latents before generation")]
    ReferenceNotEncoded,

    /// Failed to load an image file.
    #[error("failed to load image from {path}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Failed to save an image file.
    #[error("failed to save image to {path}: {source}")]
    ImageSave {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Failed to download a model.
    #[error("failed to download model {name}: {source}")]
    ModelDownload {
        name: String,
        #[source]
        source: reqwest::Error,
    },

    /// Failed to load an ONNX model.
    #[error("failed to load ONNX model {name}: {source}")]
    ModelLoad {
        name: String,
        #[source]
        source: ort::Error,
    },

    /// Model inference failed.
    #[error("model inference failed: {source}")]
    Inference {
        #[source]
        source: ort::Error,
    },

    /// Tokenizer loading or encoding failed.
    #[error("tokenizer error: {message}")]
    Tokenizer { message: String },

    /// Failed to create cache directory.
    #[error("failed to create cache directory {path}: {source}")]
    CacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Shape mismatch in tensor operations.
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },
}

/// Result type alias for diffusion-canvas operations.
pub type Result<T> = std::result::Result<T, Error>;
