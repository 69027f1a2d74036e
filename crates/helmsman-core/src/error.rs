//! Core error types

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("{path}: environment variable '{variable}' is referenced but not set")]
    UnsetVariable { path: PathBuf, variable: String },

    #[error("{path}: failed to fetch SSM parameter '{parameter}': {message}")]
    Parameter {
        path: PathBuf,
        parameter: String,
        message: String,
    },

    #[error("failed to download {uri}: {message}")]
    Download { uri: String, message: String },

    #[error("template error in '{entity}': {message}")]
    Template { entity: String, message: String },

    #[error("{entity}: {message}")]
    Validation { entity: String, message: String },

    #[error("invalid chart metadata in {path}: {message}")]
    ChartMetadata { path: PathBuf, message: String },

    #[error("Invalid version: {0}")]
    InvalidVersion(#[from] semver::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Build a validation error for the named entity
    pub fn validation(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            entity: entity.into(),
            message: message.into(),
        }
    }

    pub(crate) fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
