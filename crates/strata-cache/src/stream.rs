//! Stream types handed out by [`CacheEngine`](crate::CacheEngine).

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::atomic::AtomicFileWriter;
use crate::error::Result;
use crate::joinable::HandleGuard;
use crate::model::ConcreteResource;
use crate::promote::PromotingReader;
use crate::spi::{fire_best_effort, BoxWrite, FileEvent, FileEventEmitter, OpenMode};

/// Fires [`FileEvent::Closed`] when dropped.
pub(crate) struct CloseNotice {
    pub(crate) emitter: Arc<dyn FileEventEmitter>,
    pub(crate) resource: ConcreteResource,
    pub(crate) mode: OpenMode,
}

impl Drop for CloseNotice {
    fn drop(&mut self) {
        fire_best_effort(
            self.emitter.as_ref(),
            FileEvent::Closed {
                resource: self.resource.clone(),
                mode: self.mode,
            },
        );
    }
}

pub(crate) enum ReaderSource {
    Plain(File),
    Promoting(PromotingReader),
}

/// A read stream over a cached file.
///
/// Drop order matters: the source (and any background copy it waits for) goes first,
/// then the close event fires.
pub struct CacheReader {
    source: ReaderSource,
    path: PathBuf,
    _handle: Option<HandleGuard>,
    _close: CloseNotice,
}

impl CacheReader {
    pub(crate) fn new(
        source: ReaderSource,
        path: PathBuf,
        handle: Option<HandleGuard>,
        close: CloseNotice,
    ) -> Self {
        Self {
            source,
            path,
            _handle: handle,
            _close: close,
        }
    }

    /// The file this stream reads.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `true` if this stream will copy the file to the fast tier once read.
    pub fn is_promoting(&self) -> bool {
        matches!(self.source, ReaderSource::Promoting(_))
    }

    /// Closes the stream, waiting for any background fast-tier copy to finish.
    pub fn close(self) -> io::Result<()> {
        let Self { source, .. } = self;
        match source {
            ReaderSource::Promoting(reader) => reader.close(),
            ReaderSource::Plain(_) => Ok(()),
        }
    }
}

impl Read for CacheReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.source {
            ReaderSource::Plain(file) => file.read(buf),
            ReaderSource::Promoting(reader) => reader.read(buf),
        }
    }
}

impl std::fmt::Debug for CacheReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheReader")
            .field("path", &self.path)
            .field("promoting", &self.is_promoting())
            .finish()
    }
}

/// A write stream to the main tier, mirrored to the fast tier when one is configured.
///
/// Main-tier failures are returned to the caller. Fast-tier failures are logged and the
/// fast copy is abandoned, leaving the fast-tier path untouched. Nothing is published
/// until [`commit`](Self::commit); dropping the writer discards both temp files.
pub struct CacheWriter {
    main: Option<AtomicFileWriter>,
    fast: Option<AtomicFileWriter>,
    _handles: Vec<HandleGuard>,
    _close: CloseNotice,
}

impl CacheWriter {
    pub(crate) fn new(
        main: AtomicFileWriter,
        fast: Option<AtomicFileWriter>,
        handles: Vec<HandleGuard>,
        close: CloseNotice,
    ) -> Self {
        Self {
            main: Some(main),
            fast,
            _handles: handles,
            _close: close,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.main.as_ref().map(AtomicFileWriter::target)
    }

    pub fn has_fast_copy(&self) -> bool {
        self.fast.is_some()
    }

    /// Publishes the main-tier file, then the fast copy.
    pub fn commit(mut self) -> Result<()> {
        self.publish()
    }

    /// Discards the write on both tiers; existing files are left untouched.
    pub fn abort(mut self) {
        if let Some(main) = self.main.take() {
            main.abort();
        }
        if let Some(fast) = self.fast.take() {
            fast.abort();
        }
    }

    fn publish(&mut self) -> Result<()> {
        let Some(main) = self.main.take() else {
            return Ok(());
        };
        if let Err(err) = main.commit() {
            if let Some(fast) = self.fast.take() {
                fast.abort();
            }
            return Err(err);
        }
        if let Some(fast) = self.fast.take() {
            let path = fast.target().to_path_buf();
            if let Err(err) = fast.commit() {
                tracing::warn!(
                    target = "strata.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to publish fast storage copy"
                );
            }
        }
        Ok(())
    }

    fn abandon_fast(&mut self, err: &io::Error) {
        if let Some(fast) = self.fast.take() {
            tracing::warn!(
                target = "strata.cache",
                path = %fast.target().display(),
                error = %err,
                "fast storage write failed; continuing with main storage only"
            );
            fast.abort();
        }
    }

    fn main(&mut self) -> io::Result<&mut AtomicFileWriter> {
        self.main
            .as_mut()
            .ok_or_else(|| io::Error::other("cache writer already closed"))
    }
}

impl Write for CacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.main()?.write(buf)?;
        if let Some(fast) = self.fast.as_mut() {
            if let Err(err) = fast.write_all(&buf[..written]) {
                self.abandon_fast(&err);
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.main()?.flush()?;
        if let Some(fast) = self.fast.as_mut() {
            if let Err(err) = fast.flush() {
                self.abandon_fast(&err);
            }
        }
        Ok(())
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if let Some(main) = &self.main {
            tracing::debug!(
                target = "strata.cache",
                path = %main.target().display(),
                "cache write dropped without commit; discarding"
            );
        }
    }
}

impl std::fmt::Debug for CacheWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWriter")
            .field("path", &self.path())
            .field("fast", &self.has_fast_copy())
            .finish()
    }
}

struct SharedWriter(Arc<Mutex<Option<CacheWriter>>>);

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock().as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(io::Error::other("cache writer already closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.lock().as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

/// A [`CacheWriter`] behind a [`Transfer`](crate::Transfer)'s stream decorator.
///
/// Bytes go through the decorated stream. [`commit`](Self::commit) drops that stream
/// first, so a decorator can emit trailing bytes, then publishes. Dropping without a
/// commit discards the write.
pub struct TransferWriter {
    stream: Option<BoxWrite>,
    writer: Arc<Mutex<Option<CacheWriter>>>,
}

impl TransferWriter {
    pub(crate) fn new(
        writer: CacheWriter,
        decorate: impl FnOnce(BoxWrite) -> io::Result<BoxWrite>,
    ) -> io::Result<Self> {
        let writer = Arc::new(Mutex::new(Some(writer)));
        let stream = decorate(Box::new(SharedWriter(Arc::clone(&writer))))?;
        Ok(Self {
            stream: Some(stream),
            writer,
        })
    }

    pub fn commit(mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.flush()?;
            drop(stream);
        }
        let writer = self.writer.lock().take();
        match writer {
            Some(writer) => writer.commit(),
            None => Ok(()),
        }
    }

    pub fn abort(mut self) {
        self.stream = None;
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            writer.abort();
        }
    }

    fn stream(&mut self) -> io::Result<&mut BoxWrite> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::other("transfer writer already closed"))
    }
}

impl Write for TransferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream()?.flush()
    }
}

impl std::fmt::Debug for TransferWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferWriter")
            .field("open", &self.stream.is_some())
            .finish()
    }
}
