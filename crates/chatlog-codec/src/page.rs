//! Single-page transforms. A page is always exactly `params.page_size` bytes here; short reads
//! are handled by the file loop.

use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Sha512;

use crate::error::{CodecError, CodecResult};
use crate::key::DerivedKeys;
use crate::params::{
    CipherParams, AES_BLOCK_SIZE, HMAC_SHA512_SIZE, IV_SIZE, SALT_SIZE, SQLITE_HEADER,
};

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type HmacSha512 = Hmac<Sha512>;

/// Unallocated storage is never encrypted.
#[must_use]
pub fn is_zero_page(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

/// Reject parameters with no room for page data and buffers that are not exactly one page.
fn check_page(params: &CipherParams, page_no: u32, page: &[u8]) -> CodecResult<()> {
    params.validate()?;
    if page.len() == params.page_size {
        Ok(())
    } else {
        Err(CodecError::PageLength {
            page: page_no,
            expected: params.page_size,
            actual: page.len(),
        })
    }
}

/// HMAC-SHA512 over `ciphertext || IV || page_no (LE u32)`.
fn page_mac(
    keys: &DerivedKeys,
    page_no: u32,
    ciphertext_and_iv: &[u8],
) -> CodecResult<HmacSha512> {
    let mut mac = <HmacSha512 as Mac>::new_from_slice(keys.mac_key())
        .map_err(|err| CodecError::InvalidParams(err.to_string()))?;
    mac.update(ciphertext_and_iv);
    mac.update(&page_no.to_le_bytes());
    Ok(mac)
}

/// Check the authentication tag of one encrypted page without decrypting it.
///
/// # Errors
/// Returns [`CodecError::HmacMismatch`] when the tag does not verify and
/// [`CodecError::PageLength`] when `page` is not exactly one page.
pub fn verify_page(
    params: &CipherParams,
    keys: &DerivedKeys,
    page_no: u32,
    page: &[u8],
) -> CodecResult<()> {
    check_page(params, page_no, page)?;
    let start = params.data_offset(page_no);
    let iv_end = params.reserve_offset() + IV_SIZE;
    let tag = &page[iv_end..iv_end + HMAC_SHA512_SIZE];

    page_mac(keys, page_no, &page[start..iv_end])?
        .verify_slice(tag)
        .map_err(|_| CodecError::HmacMismatch { page: page_no })
}

/// Decrypt one physical page, appending a full output page to `out`.
///
/// Page 1 gets the canonical SQLite header in place of its salt. The reserve region
/// (`IV || tag`) is carried through unchanged.
///
/// # Errors
/// Fails on a wrong-sized page, a misaligned ciphertext region or an HMAC mismatch.
pub fn decrypt_page(
    params: &CipherParams,
    keys: &DerivedKeys,
    page_no: u32,
    page: &[u8],
    out: &mut Vec<u8>,
) -> CodecResult<()> {
    check_page(params, page_no, page)?;
    if is_zero_page(page) {
        out.extend_from_slice(page);
        return Ok(());
    }

    let start = params.data_offset(page_no);
    let end = params.reserve_offset();
    let ciphertext = &page[start..end];
    if ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(CodecError::UnalignedCiphertext {
            page: page_no,
            len: ciphertext.len(),
        });
    }

    verify_page(params, keys, page_no, page)?;

    let iv = &page[end..end + IV_SIZE];
    let mut plaintext = ciphertext.to_vec();
    Aes256CbcDec::new_from_slices(keys.enc_key(), iv)
        .map_err(|err| CodecError::InvalidParams(err.to_string()))?
        .decrypt_padded_mut::<NoPadding>(&mut plaintext)
        .map_err(|_| CodecError::UnalignedCiphertext { page: page_no, len: ciphertext.len() })?;

    if page_no == 1 {
        out.extend_from_slice(SQLITE_HEADER);
    }
    out.extend_from_slice(&plaintext);
    out.extend_from_slice(&page[end..]);
    Ok(())
}

/// Encrypt one plaintext page with the given IV, appending the sealed page to `out`.
///
/// The plaintext's own reserve bytes are discarded. On page 1 the SQLite header is replaced by
/// `salt`.
///
/// # Errors
/// Fails on a wrong-sized page or when the parameters produce a misaligned data region.
pub fn encrypt_page(
    params: &CipherParams,
    keys: &DerivedKeys,
    page_no: u32,
    page: &[u8],
    salt: &[u8; SALT_SIZE],
    iv: &[u8; IV_SIZE],
    out: &mut Vec<u8>,
) -> CodecResult<()> {
    check_page(params, page_no, page)?;
    if is_zero_page(page) {
        out.extend_from_slice(page);
        return Ok(());
    }

    let start = params.data_offset(page_no);
    let end = params.reserve_offset();
    let len = end - start;
    if len % AES_BLOCK_SIZE != 0 {
        return Err(CodecError::UnalignedCiphertext { page: page_no, len });
    }

    let sealed_start = out.len();
    if page_no == 1 {
        out.extend_from_slice(salt);
    }
    let mut ciphertext = page[start..end].to_vec();
    Aes256CbcEnc::new_from_slices(keys.enc_key(), iv)
        .map_err(|err| CodecError::InvalidParams(err.to_string()))?
        .encrypt_padded_mut::<NoPadding>(&mut ciphertext, len)
        .map_err(|_| CodecError::UnalignedCiphertext { page: page_no, len })?;
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(iv);

    let tag = page_mac(keys, page_no, &out[sealed_start + start..])?.finalize().into_bytes();
    out.extend_from_slice(&tag);
    Ok(())
}
