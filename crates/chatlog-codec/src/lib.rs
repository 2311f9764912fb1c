//! Page codec for SQLCipher-compatible encrypted databases.
//!
//! Files are processed as a sequence of fixed-size pages. Page 1 starts with a 16-byte salt;
//! every page ends with an 80-byte reserve region `[IV][HMAC-SHA512 tag]`. Keys are derived with
//! PBKDF2-HMAC-SHA512, pages are authenticated before they are decrypted with AES-256-CBC, and
//! all-zero pages pass through untouched.

pub mod batch;
mod error;
mod file;
mod key;
pub mod page;
pub mod params;

pub use batch::{BatchConfig, BatchDecryptor, BatchFailure, BatchJob, BatchReport, BatchSuccess};
pub use error::{CodecError, CodecResult};
pub use file::{decrypt_file, DecryptOutcome, PageCodec};
pub use key::{DerivedKeys, SecretKey};
pub use params::CipherParams;
