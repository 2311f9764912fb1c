use std::path::PathBuf;

use thiserror::Error;

/// Failure reading one shard's schema-specific tables.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("unrecognised schema: neither Timestamp nor DBInfo table present")]
    Unknown,
    #[error("no start time metadata")]
    MissingStartTime,
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
}

#[derive(Debug)]
pub struct CloseFailure {
    pub path: PathBuf,
    pub source: rusqlite::Error,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("{path}: {source}")]
    Shard {
        path: PathBuf,
        #[source]
        source: SchemaError,
    },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid filename pattern: {0}")]
    Pattern(#[from] regex_lite::Error),
    #[error("failed to close {} connection(s)", .0.len())]
    CloseAll(Vec<CloseFailure>),
    #[error("{path}: connection still in use")]
    InUse { path: PathBuf },
    #[error("cancelled")]
    Cancelled,
}

impl StoreError {
    pub(crate) fn shard(path: impl Into<PathBuf>, source: impl Into<SchemaError>) -> Self {
        Self::Shard { path: path.into(), source: source.into() }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
