//! Error types for checkpoint conversion.

use std::path::PathBuf;

use safetensors::Dtype;
use thiserror::Error;

/// Errors raised while converting a checkpoint.
///
/// Every error is fatal to the run; none are retried.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("no *index.json manifest found in {}", dir.display())]
    IndexNotFound { dir: PathBuf },

    #[error("multiple index manifests found: {} and {}", first.display(), second.display())]
    AmbiguousIndex { first: PathBuf, second: PathBuf },

    #[error("malformed index manifest {}: {reason}", path.display())]
    InvalidIndex { path: PathBuf, reason: String },

    #[error("unexpected layer name {0}")]
    UnmappedTensor(String),

    #[error("tensor `{name}` is not listed in the weight index")]
    MissingTensor { name: String },

    #[error("invalid architecture: {0}")]
    InvalidArchitecture(String),

    #[error("tensor parallel size must be at least 1, got {0}")]
    InvalidTensorParallelSize(usize),

    #[error("{what} ({size}) is not divisible by tensor parallel size {parts}")]
    NotDivisible { what: String, size: usize, parts: usize },

    #[error("shape mismatch for `{name}`: {reason}")]
    ShapeMismatch { name: String, reason: String },

    #[error("unsupported dtype {dtype:?} for `{name}`")]
    UnsupportedDtype { name: String, dtype: Dtype },

    #[error("safetensors error in {}: {source}", path.display())]
    SafeTensors {
        path: PathBuf,
        #[source]
        source: safetensors::SafeTensorError,
    },

    #[error("failed to write archive {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConvertError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// True for errors caused by the input layout or requested settings
    /// rather than by the storage layer.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::IndexNotFound { .. }
                | Self::AmbiguousIndex { .. }
                | Self::UnmappedTensor(_)
                | Self::MissingTensor { .. }
                | Self::InvalidArchitecture(_)
                | Self::InvalidTensorParallelSize(_)
                | Self::NotDivisible { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ConvertError>;
