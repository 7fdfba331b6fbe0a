use std::path::{Path, PathBuf};

use sample_kit_common::{Resolution, SampleKitError};
use thiserror::Error;

use crate::record::Field;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Stage '{stage}' requires field '{field}' which is not present")]
    MissingField { stage: &'static str, field: Field },

    #[error("Field '{field}' holds a {found} value, expected {expected}")]
    FieldType {
        field: Field,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Required input '{field}' not found at {path}")]
    MissingInput { field: Field, path: PathBuf },

    #[error("Malformed raster at {path}: {source}")]
    MalformedRaster {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No compatible bucket for {resolution}: {reason}")]
    Bucket { resolution: Resolution, reason: String },

    #[error("Cache entry {path} unusable: {reason}")]
    CacheCorrupt { path: PathBuf, reason: String },

    #[error("Collaborator '{name}' failed: {message}")]
    Collaborator { name: String, message: String },

    #[error("Raster shape error: {0}")]
    Shape(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Common(#[from] SampleKitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cannot write cache entry {path}: {reason}")]
    CacheWrite { path: PathBuf, reason: String },

    #[error("Worker pool error: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl PipelineError {
    /// Build a closure that wraps an IO error with the offending path
    pub fn io(path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError + '_ {
        move |source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Errors confined to one sample. These skip the sample and are reported;
    /// everything else aborts the run.
    pub fn is_sample_local(&self) -> bool {
        matches!(
            self,
            PipelineError::MissingInput { .. }
                | PipelineError::MalformedRaster { .. }
                | PipelineError::Io { .. }
                | PipelineError::Bucket { .. }
                | PipelineError::CacheCorrupt { .. }
                | PipelineError::Collaborator { .. }
                | PipelineError::Shape(_)
                | PipelineError::CacheWrite { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
