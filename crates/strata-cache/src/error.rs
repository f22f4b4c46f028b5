use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the tiered file cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to determine home directory for default cache path")]
    MissingHomeDir,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no such file: {path}")]
    NotFound { path: PathBuf },

    #[error("cannot copy {from}: source file does not exist")]
    CopySourceMissing { from: PathBuf },

    #[error("cannot create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot delete fast-storage file {path}: {source}")]
    DeleteFast {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to publish {path}: {source}")]
    Publish {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid resource path {path:?} for location {location}")]
    InvalidPath { location: String, path: String },

    #[error("cache engine for {resource} has been dropped")]
    EngineDropped { resource: String },
}

impl CacheError {
    /// Returns `true` when the error reports a missing source rather than an I/O failure.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } | Self::CopySourceMissing { .. } => true,
            Self::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
