use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("invalid key format: {0}")]
    InvalidKeyFormat(String),
    #[error("{path}: file too small ({size} bytes, need at least one {page_size}-byte page)")]
    FileTooSmall {
        path: PathBuf,
        size: u64,
        page_size: usize,
    },
    #[error("page {page}: ciphertext length {len} is not a multiple of the AES block size")]
    UnalignedCiphertext { page: u32, len: usize },
    #[error("page {page}: HMAC verification failed")]
    HmacMismatch { page: u32 },
    #[error("page {page}: expected {expected} bytes, got {actual}")]
    PageLength {
        page: u32,
        expected: usize,
        actual: usize,
    },
    #[error("{0}: not a plaintext SQLite database")]
    NotSqlite(PathBuf),
    #[error("{path}: pages reserve {reserved} bytes, sealing needs at least {required}")]
    InsufficientReserve {
        path: PathBuf,
        reserved: usize,
        required: usize,
    },
    #[error("invalid cipher parameters: {0}")]
    InvalidParams(String),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cancelled")]
    Cancelled,
}

impl CodecError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// True for failures that indicate a wrong key or a corrupted/tampered file.
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::HmacMismatch { .. })
    }
}

pub type CodecResult<T> = Result<T, CodecError>;
