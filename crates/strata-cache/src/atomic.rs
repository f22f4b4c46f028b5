use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{CacheError, Result};
use crate::util::{create_parent_dirs, remove_file_best_effort, sync_dir_best_effort, with_suffix};
use crate::SUFFIX_TO_WRITE;

/// A writer whose bytes land in `<target>.to-write` and only appear under `target` once
/// published.
///
/// Only [`commit`](Self::commit) publishes. Dropping an uncommitted writer discards the
/// temp file, so a producer that fails midway never exposes a truncated file under
/// `target`.
pub struct AtomicFileWriter {
    target: PathBuf,
    temp: PathBuf,
    file: Option<BufWriter<File>>,
    failed: bool,
}

impl AtomicFileWriter {
    /// Creates missing parent directories and opens the temp sibling for writing.
    pub fn create(target: impl Into<PathBuf>) -> Result<Self> {
        let target = target.into();
        create_parent_dirs(&target)?;
        let temp = with_suffix(&target, SUFFIX_TO_WRITE);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)?;
        Ok(Self {
            target,
            temp,
            file: Some(BufWriter::new(file)),
            failed: false,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Flushes, syncs and renames the temp file onto the target.
    pub fn commit(mut self) -> Result<()> {
        self.publish()
    }

    /// Discards everything written so far, removing the temp file.
    pub fn abort(mut self) {
        self.file = None;
        remove_file_best_effort(&self.temp, "atomic_writer.abort");
    }

    fn publish(&mut self) -> Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        if self.failed {
            return Err(CacheError::Publish {
                path: self.target.clone(),
                source: io::Error::other(format!(
                    "an earlier write failed; partial data left in {}",
                    self.temp.display()
                )),
            });
        }

        let synced = file
            .flush()
            .and_then(|()| file.into_inner().map_err(|err| err.into_error()))
            .and_then(|file| file.sync_all());
        if let Err(source) = synced {
            return Err(CacheError::Publish {
                path: self.target.clone(),
                source,
            });
        }

        fs::rename(&self.temp, &self.target).map_err(|source| CacheError::Publish {
            path: self.target.clone(),
            source,
        })?;
        if let Some(parent) = self.target.parent() {
            sync_dir_best_effort(parent, "atomic_writer.publish");
        }
        Ok(())
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("atomic writer already closed"))
    }
}

impl Write for AtomicFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = self.writer()?.write(buf);
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn flush(&mut self) -> io::Result<()> {
        let result = self.writer()?.flush();
        if result.is_err() {
            self.failed = true;
        }
        result
    }
}

impl Drop for AtomicFileWriter {
    fn drop(&mut self) {
        if self.file.take().is_none() {
            return;
        }
        tracing::debug!(
            target = "strata.cache",
            path = %self.target.display(),
            temp = %self.temp.display(),
            "discarding uncommitted write"
        );
        remove_file_best_effort(&self.temp, "atomic_writer.drop");
    }
}

/// Copies `from` onto `to` through an [`AtomicFileWriter`].
pub(crate) fn copy_file_atomic(from: &Path, to: &Path) -> Result<u64> {
    let mut reader = File::open(from)?;
    let mut writer = AtomicFileWriter::create(to)?;
    match io::copy(&mut reader, &mut writer) {
        Ok(copied) => {
            writer.commit()?;
            Ok(copied)
        }
        Err(err) => {
            writer.abort();
            Err(err.into())
        }
    }
}
