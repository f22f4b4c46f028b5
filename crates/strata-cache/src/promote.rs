//! Reading from the main tier while a background job copies the file to the fast tier.
//!
//! The copy starts on the first read, opens its own handle on the main file and writes
//! the fast copy through an [`AtomicFileWriter`], so a failed or abandoned copy never
//! leaves a partial file at the fast-tier path. Closing the reader waits for the copy.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::atomic::AtomicFileWriter;
use crate::error::Result;
use crate::joinable::{HandleKind, JoinableFileManager};
use crate::pool::{TaskHandle, TransferPool};
use crate::transfer::PromotionClaim;
use crate::util::{remove_file_best_effort, with_suffix};
use crate::SUFFIX_TO_WRITE;

struct PendingCopy {
    pool: Arc<TransferPool>,
    claim: PromotionClaim,
    joins: Option<JoinableFileManager>,
}

/// A reader over the main-tier file that promotes it to `fast_path` in the background.
pub struct PromotingReader {
    main_path: PathBuf,
    fast_path: PathBuf,
    main: File,
    pending: Option<PendingCopy>,
    task: Option<TaskHandle<Result<u64>>>,
}

impl PromotingReader {
    pub(crate) fn new(
        main_path: PathBuf,
        main: File,
        fast_path: PathBuf,
        pool: Arc<TransferPool>,
        claim: PromotionClaim,
        joins: Option<JoinableFileManager>,
    ) -> Self {
        Self {
            main_path,
            fast_path,
            main,
            pending: Some(PendingCopy { pool, claim, joins }),
            task: None,
        }
    }

    pub fn main_path(&self) -> &Path {
        &self.main_path
    }

    pub fn fast_path(&self) -> &Path {
        &self.fast_path
    }

    /// Whether the background copy has been submitted.
    pub fn started(&self) -> bool {
        self.pending.is_none()
    }

    fn start(&mut self) {
        let Some(PendingCopy { pool, claim, joins }) = self.pending.take() else {
            return;
        };
        let main_path = self.main_path.clone();
        let fast_path = self.fast_path.clone();
        tracing::debug!(
            target = "strata.cache",
            from = %main_path.display(),
            to = %fast_path.display(),
            "promoting file to fast storage"
        );
        self.task = Some(pool.submit(move || {
            let _claim = claim;
            copy_to_fast(&main_path, &fast_path, joins.as_ref())
        }));
    }

    /// Waits for the background copy, if one started. Never fails the read side:
    /// copy failures are logged and their partial output removed.
    pub fn close(mut self) -> io::Result<()> {
        self.finish();
        Ok(())
    }

    fn finish(&mut self) {
        // Never read: nothing to promote, and the claim is released here.
        self.pending = None;
        let Some(task) = self.task.take() else {
            return;
        };
        match task.join() {
            Ok(Ok(bytes)) => tracing::debug!(
                target = "strata.cache",
                path = %self.fast_path.display(),
                bytes,
                "promoted file to fast storage"
            ),
            Ok(Err(err)) => tracing::error!(
                target = "strata.cache",
                from = %self.main_path.display(),
                to = %self.fast_path.display(),
                error = %err,
                "fast storage copy failed"
            ),
            Err(interrupted) => {
                tracing::error!(
                    target = "strata.cache",
                    from = %self.main_path.display(),
                    to = %self.fast_path.display(),
                    error = %interrupted,
                    "fast storage copy did not complete"
                );
                remove_file_best_effort(
                    &with_suffix(&self.fast_path, SUFFIX_TO_WRITE),
                    "promote.interrupted",
                );
            }
        }
    }
}

impl Read for PromotingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.start();
        self.main.read(buf)
    }
}

impl Drop for PromotingReader {
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for PromotingReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromotingReader")
            .field("main_path", &self.main_path)
            .field("fast_path", &self.fast_path)
            .field("started", &self.started())
            .finish()
    }
}

/// Copies `main` to `fast` atomically. On failure the temp file is removed and `fast`
/// is left as it was.
fn copy_to_fast(main: &Path, fast: &Path, joins: Option<&JoinableFileManager>) -> Result<u64> {
    let _read = joins.map(|joins| joins.register(main, HandleKind::Read));
    let _write = joins.map(|joins| joins.register(fast, HandleKind::Write));

    let mut source = File::open(main)?;
    let mut writer = AtomicFileWriter::create(fast)?;
    match io::copy(&mut source, &mut writer) {
        Ok(bytes) => {
            let temp = writer.temp_path().to_path_buf();
            writer.commit().inspect_err(|_| {
                remove_file_best_effort(&temp, "promote.publish_failed");
            })?;
            Ok(bytes)
        }
        Err(err) => {
            writer.abort();
            Err(err.into())
        }
    }
}
