//! Fixed-format constants of the paged encryption layout.

use crate::error::{CodecError, CodecResult};

/// Literal header of an unencrypted SQLite file, including the trailing NUL.
pub const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

/// Prefix length used to recognise a file that is already plaintext.
pub const PLAINTEXT_MARKER_LEN: usize = 15;

pub const KEY_SIZE: usize = 32;
pub const SALT_SIZE: usize = 16;
pub const IV_SIZE: usize = 16;
pub const HMAC_SHA512_SIZE: usize = 64;
pub const AES_BLOCK_SIZE: usize = 16;

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const DEFAULT_KDF_ITERATIONS: u32 = 256_000;
pub const DEFAULT_MAC_KDF_ITERATIONS: u32 = 2;
pub const MAC_SALT_MASK: u8 = 0x3a;

/// Page geometry and key-derivation cost.
///
/// The defaults reproduce the on-disk format byte for byte. Lowering
/// `kdf_iterations` yields files that only this codec (configured the same way) can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherParams {
    pub page_size: usize,
    pub kdf_iterations: u32,
    pub mac_kdf_iterations: u32,
}

impl Default for CipherParams {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            mac_kdf_iterations: DEFAULT_MAC_KDF_ITERATIONS,
        }
    }
}

impl CipherParams {
    #[must_use]
    pub fn with_kdf_iterations(mut self, iterations: u32) -> Self {
        self.kdf_iterations = iterations;
        self
    }

    /// Trailing bytes of every page: `[IV][HMAC tag]`.
    #[must_use]
    pub const fn reserve_size(&self) -> usize {
        IV_SIZE + HMAC_SHA512_SIZE
    }

    /// Offset where the reserve region starts, which is also where ciphertext ends. Zero when the
    /// page is too small to hold a reserve, which validation rejects.
    #[must_use]
    pub const fn reserve_offset(&self) -> usize {
        self.page_size.saturating_sub(self.reserve_size())
    }

    /// Offset where ciphertext starts on the given 1-based page.
    #[must_use]
    pub const fn data_offset(&self, page_no: u32) -> usize {
        if page_no == 1 {
            SALT_SIZE
        } else {
            0
        }
    }

    pub(crate) fn validate(&self) -> CodecResult<()> {
        if self.page_size <= SALT_SIZE + self.reserve_size() {
            return Err(CodecError::InvalidParams(format!(
                "page size {} leaves no room for page data",
                self.page_size
            )));
        }
        if !self.page_size.is_power_of_two() {
            return Err(CodecError::InvalidParams(format!(
                "page size {} is not a power of two",
                self.page_size
            )));
        }
        if self.kdf_iterations == 0 || self.mac_kdf_iterations == 0 {
            return Err(CodecError::InvalidParams("KDF iterations must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_matches_on_disk_format() {
        let params = CipherParams::default();
        assert_eq!(params.reserve_size(), 80);
        assert_eq!(params.reserve_offset(), 4016);
        assert_eq!(params.data_offset(1), 16);
        assert_eq!(params.data_offset(2), 0);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn ciphertext_regions_are_block_aligned() {
        let params = CipherParams::default();
        for page_no in [1_u32, 2] {
            let len = params.reserve_offset() - params.data_offset(page_no);
            assert_eq!(len % AES_BLOCK_SIZE, 0, "page {page_no}");
        }
    }

    #[test]
    fn tiny_pages_are_rejected() {
        let params = CipherParams { page_size: 64, ..CipherParams::default() };
        assert_eq!(params.reserve_offset(), 0);
        assert!(matches!(params.validate(), Err(CodecError::InvalidParams(_))));
    }
}
