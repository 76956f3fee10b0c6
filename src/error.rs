// ABOUTME: Application-wide error types for shipwright.
// ABOUTME: Uses thiserror for ergonomic error handling.

use crate::deploy::DeployError;
use crate::infra::InfraError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("file already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("configuration file not found in {0}")]
    ConfigNotFound(PathBuf),

    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no previous run found for this project")]
    NoPreviousRun,

    #[error("invalid run id: {0}")]
    InvalidRunId(String),

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error("infrastructure: {0}")]
    Infra(#[from] InfraError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
