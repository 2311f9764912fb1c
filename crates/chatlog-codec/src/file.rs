//! Whole-file transforms built on the page codec.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use chatlog_core::CancellationToken;
use rand::rngs::OsRng;
use rand::RngCore;
use tempfile::NamedTempFile;

use crate::error::{CodecError, CodecResult};
use crate::key::{DerivedKeys, SecretKey};
use crate::page::{decrypt_page, encrypt_page, verify_page};
use crate::params::{CipherParams, IV_SIZE, PLAINTEXT_MARKER_LEN, SALT_SIZE, SQLITE_HEADER};

/// What `decrypt_file` did with its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptOutcome {
    /// Input was already plaintext and was copied byte for byte.
    AlreadyPlaintext,
    Decrypted { pages: u32 },
}

/// Page-at-a-time codec for SQLCipher-shaped files.
#[derive(Debug, Clone, Default)]
pub struct PageCodec {
    params: CipherParams,
}

impl PageCodec {
    /// # Errors
    /// Rejects parameters whose page geometry cannot hold the reserve region.
    pub fn new(params: CipherParams) -> CodecResult<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    #[must_use]
    pub fn params(&self) -> &CipherParams {
        &self.params
    }

    /// Decrypt `src` into `dst`.
    ///
    /// Output is staged in a temporary file next to `dst` and renamed into place only after
    /// every page authenticated, so a failure never leaves partial plaintext behind.
    ///
    /// # Errors
    /// Input, integrity and I/O failures abort this file only. Cancellation is checked between
    /// pages.
    pub fn decrypt_file(
        &self,
        src: &Path,
        dst: &Path,
        key: &SecretKey,
        cancel: &CancellationToken,
    ) -> CodecResult<DecryptOutcome> {
        let page_size = self.params.page_size;
        let file = File::open(src).map_err(|err| CodecError::io(src, err))?;
        let size = file.metadata().map_err(|err| CodecError::io(src, err))?.len();
        let mut reader = BufReader::new(file);

        let mut page = vec![0u8; page_size];
        let filled = read_page(&mut reader, &mut page).map_err(|err| CodecError::io(src, err))?;

        if is_plaintext(&page[..filled]) {
            let mut out = StagedOutput::create(dst)?;
            out.write_all(&page[..filled])?;
            io::copy(&mut reader, out.writer()).map_err(|err| CodecError::io(dst, err))?;
            out.commit()?;
            tracing::debug!("{} is already plaintext, copied to {}", src.display(), dst.display());
            return Ok(DecryptOutcome::AlreadyPlaintext);
        }

        if filled < page_size {
            return Err(CodecError::FileTooSmall { path: src.to_path_buf(), size, page_size });
        }

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&page[..SALT_SIZE]);
        let keys = DerivedKeys::derive(key, &salt, &self.params);

        let total_pages = size.div_ceil(page_size as u64);
        let mut out = StagedOutput::create(dst)?;
        let mut plain = Vec::with_capacity(page_size);
        let mut page_no: u32 = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(CodecError::Cancelled);
            }

            plain.clear();
            decrypt_page(&self.params, &keys, page_no, &page, &mut plain)?;
            out.write_all(&plain)?;

            let filled =
                read_page(&mut reader, &mut page).map_err(|err| CodecError::io(src, err))?;
            if filled < page_size {
                if filled > 0 {
                    tracing::debug!(
                        "{}: ignoring {filled} trailing bytes after page {page_no}",
                        src.display()
                    );
                }
                break;
            }
            page_no += 1;
        }

        out.commit()?;
        tracing::debug!(
            "decrypted {} ({page_no}/{total_pages} pages) to {}",
            src.display(),
            dst.display()
        );
        Ok(DecryptOutcome::Decrypted { pages: page_no })
    }

    /// Seal a plaintext SQLite file into the encrypted page format with a fresh random salt and
    /// per-page IVs. Returns the number of pages written.
    ///
    /// The IV and tag overwrite the last 80 bytes of every page, so the source must declare at
    /// least that much reserved space in its header (byte 20). Pages without it hold live cell
    /// data there.
    ///
    /// # Errors
    /// Fails when `src` is not plaintext SQLite, its page size differs from the codec's, it
    /// reserves fewer than 80 bytes per page, or on I/O errors.
    pub fn encrypt_file(
        &self,
        src: &Path,
        dst: &Path,
        key: &SecretKey,
        cancel: &CancellationToken,
    ) -> CodecResult<u32> {
        let page_size = self.params.page_size;
        let file = File::open(src).map_err(|err| CodecError::io(src, err))?;
        let mut reader = BufReader::new(file);

        let mut page = vec![0u8; page_size];
        let filled = read_page(&mut reader, &mut page).map_err(|err| CodecError::io(src, err))?;
        if filled < SQLITE_HEADER.len() || !is_plaintext(&page[..filled]) {
            return Err(CodecError::NotSqlite(src.to_path_buf()));
        }
        let declared = header_page_size(&page);
        if declared != page_size || filled < page_size {
            return Err(CodecError::InvalidParams(format!(
                "{} uses {declared}-byte pages, codec expects {page_size}",
                src.display()
            )));
        }
        let reserved = usize::from(page[HEADER_RESERVE_OFFSET]);
        if reserved < self.params.reserve_size() {
            return Err(CodecError::InsufficientReserve {
                path: src.to_path_buf(),
                reserved,
                required: self.params.reserve_size(),
            });
        }

        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        let keys = DerivedKeys::derive(key, &salt, &self.params);

        let mut out = StagedOutput::create(dst)?;
        let mut sealed = Vec::with_capacity(page_size);
        let mut iv = [0u8; IV_SIZE];
        let mut page_no: u32 = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(CodecError::Cancelled);
            }

            OsRng.fill_bytes(&mut iv);
            sealed.clear();
            encrypt_page(&self.params, &keys, page_no, &page, &salt, &iv, &mut sealed)?;
            out.write_all(&sealed)?;

            let filled =
                read_page(&mut reader, &mut page).map_err(|err| CodecError::io(src, err))?;
            if filled < page_size {
                break;
            }
            page_no += 1;
        }

        out.commit()?;
        Ok(page_no)
    }

    /// Check a key against page 1 of `src` without decrypting the file.
    ///
    /// Plaintext files accept any key.
    ///
    /// # Errors
    /// Returns input and I/O errors; a wrong key is `Ok(false)`, not an error.
    pub fn verify_key(&self, src: &Path, key: &SecretKey) -> CodecResult<bool> {
        let page_size = self.params.page_size;
        let mut file = File::open(src).map_err(|err| CodecError::io(src, err))?;
        let mut page = vec![0u8; page_size];
        let filled = read_page(&mut file, &mut page).map_err(|err| CodecError::io(src, err))?;

        if is_plaintext(&page[..filled]) {
            return Ok(true);
        }
        if filled < page_size {
            return Err(CodecError::FileTooSmall {
                path: src.to_path_buf(),
                size: filled as u64,
                page_size,
            });
        }

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&page[..SALT_SIZE]);
        let keys = DerivedKeys::derive(key, &salt, &self.params);
        match verify_page(&self.params, &keys, 1, &page) {
            Ok(()) => Ok(true),
            Err(CodecError::HmacMismatch { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Decrypt `src` into `dst` with the default on-disk parameters.
///
/// # Errors
/// See [`PageCodec::decrypt_file`].
pub fn decrypt_file(src: &Path, dst: &Path, key: &SecretKey) -> CodecResult<()> {
    PageCodec::default()
        .decrypt_file(src, dst, key, &CancellationToken::new())
        .map(|_| ())
}

/// Header offset of the per-page reserved byte count.
const HEADER_RESERVE_OFFSET: usize = 20;

fn is_plaintext(head: &[u8]) -> bool {
    head.len() >= PLAINTEXT_MARKER_LEN
        && head[..PLAINTEXT_MARKER_LEN] == SQLITE_HEADER[..PLAINTEXT_MARKER_LEN]
}

/// Fill `buf` from `reader`, returning fewer bytes only at end of file.
fn read_page<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Page size declared at header offset 16 (big-endian; 1 means 65536).
fn header_page_size(page: &[u8]) -> usize {
    match u16::from_be_bytes([page[16], page[17]]) {
        1 => 65_536,
        n => usize::from(n),
    }
}

/// Output written to a sibling temp file and renamed over the destination on commit.
struct StagedOutput<'a> {
    dst: &'a Path,
    writer: BufWriter<NamedTempFile>,
}

impl<'a> StagedOutput<'a> {
    fn create(dst: &'a Path) -> CodecResult<Self> {
        let parent = match dst.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(|err| CodecError::io(parent, err))?;
        let temp = NamedTempFile::new_in(parent).map_err(|err| CodecError::io(parent, err))?;
        Ok(Self { dst, writer: BufWriter::new(temp) })
    }

    fn writer(&mut self) -> &mut BufWriter<NamedTempFile> {
        &mut self.writer
    }

    fn write_all(&mut self, bytes: &[u8]) -> CodecResult<()> {
        self.writer.write_all(bytes).map_err(|err| CodecError::io(self.dst, err))
    }

    fn commit(self) -> CodecResult<()> {
        let dst = self.dst;
        let temp = self.writer.into_inner().map_err(|err| CodecError::io(dst, err.into_error()))?;
        temp.as_file().sync_all().map_err(|err| CodecError::io(dst, err))?;
        temp.persist(dst).map_err(|err| CodecError::io(dst, err.error))?;
        Ok(())
    }
}
