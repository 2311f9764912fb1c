//! Bulk decryption of a storage tree with bounded concurrency.
//!
//! Each file runs the page loop synchronously on a blocking worker; files run in parallel up to
//! `max_concurrent`. One file's failure never aborts its siblings.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chatlog_core::CancellationToken;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use crate::error::{CodecError, CodecResult};
use crate::file::{DecryptOutcome, PageCodec};
use crate::key::SecretKey;
use crate::params::CipherParams;

/// Batch decryption configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum files decrypted at once
    pub max_concurrent: usize,
    pub params: CipherParams,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_concurrent: 8, params: CipherParams::default() }
    }
}

/// One source file and where its plaintext goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJob {
    pub src: PathBuf,
    pub dst: PathBuf,
}

#[derive(Debug)]
pub struct BatchSuccess {
    pub job: BatchJob,
    pub outcome: DecryptOutcome,
}

#[derive(Debug)]
pub struct BatchFailure {
    pub job: BatchJob,
    pub error: CodecError,
}

/// Per-file tally of a batch run. Entries keep job order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<BatchSuccess>,
    pub failed: Vec<BatchFailure>,
    pub cancelled: bool,
}

impl BatchReport {
    #[must_use]
    pub fn first_error(&self) -> Option<&BatchFailure> {
        self.failed.first()
    }

    /// Surface the first error when nothing succeeded, otherwise keep the partial report.
    ///
    /// # Errors
    /// Returns the first failure's error when every attempted file failed.
    pub fn into_result(mut self) -> CodecResult<Self> {
        if self.succeeded.is_empty() && !self.failed.is_empty() {
            return Err(self.failed.remove(0).error);
        }
        Ok(self)
    }
}

pub struct BatchDecryptor {
    codec: Arc<PageCodec>,
    max_concurrent: usize,
}

impl BatchDecryptor {
    /// # Errors
    /// Rejects invalid cipher parameters.
    pub fn new(config: BatchConfig) -> CodecResult<Self> {
        Ok(Self {
            codec: Arc::new(PageCodec::new(config.params)?),
            max_concurrent: config.max_concurrent.max(1),
        })
    }

    /// Collect every `*.db` file under `src_root`, mapped to the same relative path under
    /// `dst_root`. Sorted by source path.
    ///
    /// # Errors
    /// Fails when `src_root` cannot be walked.
    pub fn plan(src_root: &Path, dst_root: &Path) -> CodecResult<Vec<BatchJob>> {
        let mut jobs = Vec::new();
        for entry in WalkDir::new(src_root).follow_links(false) {
            let entry = entry.map_err(|err| {
                let path = err.path().unwrap_or(src_root).to_path_buf();
                CodecError::io(path, err.into())
            })?;
            if !entry.file_type().is_file() || !is_db_file(entry.path()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(src_root) else {
                continue;
            };
            jobs.push(BatchJob { src: entry.path().to_path_buf(), dst: dst_root.join(relative) });
        }
        jobs.sort_by(|a, b| a.src.cmp(&b.src));
        Ok(jobs)
    }

    /// Decrypt every job, at most `max_concurrent` at a time.
    ///
    /// Jobs not yet started when `cancel` fires are dropped from the report; jobs interrupted
    /// mid-file are neither successes nor failures.
    pub async fn run(
        &self,
        jobs: Vec<BatchJob>,
        key: &SecretKey,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let key = Arc::new(key.clone());
        let mut handles: Vec<(BatchJob, JoinHandle<CodecResult<DecryptOutcome>>)> =
            Vec::with_capacity(jobs.len());
        let mut report = BatchReport::default();

        for job in jobs {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };

            let codec = self.codec.clone();
            let key = key.clone();
            let cancel = cancel.clone();
            let task_job = job.clone();
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                codec.decrypt_file(&task_job.src, &task_job.dst, &key, &cancel)
            });
            handles.push((job, handle));
        }

        for (job, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(CodecError::io(
                    &job.src,
                    std::io::Error::other(format!("decrypt worker failed: {join_err}")),
                )),
            };

            match result {
                Ok(outcome) => report.succeeded.push(BatchSuccess { job, outcome }),
                Err(CodecError::Cancelled) => report.cancelled = true,
                Err(error) => {
                    tracing::warn!("Failed to decrypt {}: {}", job.src.display(), error);
                    report.failed.push(BatchFailure { job, error });
                }
            }
        }

        tracing::info!(
            "Batch decrypt complete: {} succeeded, {} failed{}",
            report.succeeded.len(),
            report.failed.len(),
            if report.cancelled { " (cancelled)" } else { "" }
        );
        report
    }
}

fn is_db_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("db"))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn plan_mirrors_relative_paths_and_skips_sidecars() -> std::io::Result<()> {
        let src = TempDir::new()?;
        let dst = TempDir::new()?;
        fs::create_dir_all(src.path().join("message"))?;
        fs::write(src.path().join("message/message_0.db"), b"x")?;
        fs::write(src.path().join("message/message_0.db-wal"), b"x")?;
        fs::write(src.path().join("contact.DB"), b"x")?;
        fs::write(src.path().join("notes.txt"), b"x")?;

        let jobs = BatchDecryptor::plan(src.path(), dst.path())
            .unwrap_or_else(|err| panic!("plan failed: {err}"));
        let dsts: Vec<_> = jobs.iter().map(|job| job.dst.clone()).collect();
        assert_eq!(
            dsts,
            vec![dst.path().join("contact.DB"), dst.path().join("message/message_0.db")]
        );
        Ok(())
    }

    #[test]
    fn all_failed_report_surfaces_first_error() {
        let job = BatchJob { src: "a.db".into(), dst: "b.db".into() };
        let report = BatchReport {
            succeeded: vec![],
            failed: vec![
                BatchFailure { job: job.clone(), error: CodecError::HmacMismatch { page: 1 } },
                BatchFailure { job, error: CodecError::Cancelled },
            ],
            cancelled: false,
        };
        assert!(matches!(report.into_result(), Err(CodecError::HmacMismatch { page: 1 })));
    }

    #[test]
    fn partial_success_is_not_an_error() {
        let job = BatchJob { src: "a.db".into(), dst: "b.db".into() };
        let report = BatchReport {
            succeeded: vec![BatchSuccess {
                job: job.clone(),
                outcome: DecryptOutcome::AlreadyPlaintext,
            }],
            failed: vec![BatchFailure { job, error: CodecError::HmacMismatch { page: 2 } }],
            cancelled: false,
        };
        let report = report.into_result().unwrap_or_else(|err| panic!("unexpected: {err}"));
        assert_eq!(report.first_error().map(|f| f.job.src.clone()), Some(PathBuf::from("a.db")));
    }
}
