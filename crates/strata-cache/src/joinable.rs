//! In-process registry of open cache file handles.
//!
//! Every stream opened under the joinable strategy registers a [`HandleGuard`] for the
//! file it touches. Lock queries look at those registrations, and the `wait_for_*`
//! calls block on a condition variable until the matching handles are released.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleSnapshot {
    pub path: PathBuf,
    pub kind: HandleKind,
    pub thread: ThreadId,
    pub age: Duration,
}

#[derive(Debug)]
struct HandleEntry {
    id: u64,
    kind: HandleKind,
    thread: ThreadId,
    opened_at: Instant,
}

struct Reporter {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

#[derive(Default)]
struct ManagerInner {
    handles: Mutex<HashMap<PathBuf, Vec<HandleEntry>>>,
    released: Condvar,
    next_id: AtomicU64,
    reporter: Mutex<Option<Reporter>>,
}

impl ManagerInner {
    fn release(&self, path: &Path, id: u64) {
        let mut handles = self.handles.lock();
        if let Some(entries) = handles.get_mut(path) {
            entries.retain(|entry| entry.id != id);
            if entries.is_empty() {
                handles.remove(path);
            }
        }
        drop(handles);
        self.released.notify_all();
    }

    fn has(&self, path: &Path, kind: HandleKind) -> bool {
        self.handles
            .lock()
            .get(path)
            .is_some_and(|entries| entries.iter().any(|entry| entry.kind == kind))
    }

    fn wait_for(&self, path: &Path, kind: HandleKind) {
        let mut handles = self.handles.lock();
        while handles
            .get(path)
            .is_some_and(|entries| entries.iter().any(|entry| entry.kind == kind))
        {
            self.released.wait(&mut handles);
        }
    }

    fn snapshot(&self) -> Vec<HandleSnapshot> {
        let now = Instant::now();
        let handles = self.handles.lock();
        let mut out: Vec<_> = handles
            .iter()
            .flat_map(|(path, entries)| {
                entries.iter().map(move |entry| HandleSnapshot {
                    path: path.clone(),
                    kind: entry.kind,
                    thread: entry.thread,
                    age: now.saturating_duration_since(entry.opened_at),
                })
            })
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }
}

/// Shared handle registry. Clones refer to the same registry.
#[derive(Clone, Default)]
pub struct JoinableFileManager {
    inner: Arc<ManagerInner>,
}

impl JoinableFileManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an open handle on `path` until the returned guard is dropped.
    pub fn register(&self, path: &Path, kind: HandleKind) -> HandleGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handles
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .push(HandleEntry {
                id,
                kind,
                thread: std::thread::current().id(),
                opened_at: Instant::now(),
            });
        HandleGuard {
            manager: Arc::clone(&self.inner),
            path: path.to_path_buf(),
            id,
        }
    }

    pub fn is_read_locked(&self, path: &Path) -> bool {
        self.inner.has(path, HandleKind::Read)
    }

    pub fn is_write_locked(&self, path: &Path) -> bool {
        self.inner.has(path, HandleKind::Write)
    }

    /// Blocks until no read handle on `path` remains.
    pub fn wait_for_read_unlock(&self, path: &Path) {
        self.inner.wait_for(path, HandleKind::Read);
    }

    /// Blocks until no write handle on `path` remains.
    pub fn wait_for_write_unlock(&self, path: &Path) {
        self.inner.wait_for(path, HandleKind::Write);
    }

    /// Forgets every handle the calling thread registered, returning how many were dropped.
    ///
    /// Guards still alive afterwards release nothing.
    pub fn cleanup_current_thread(&self) -> usize {
        let current = std::thread::current().id();
        let mut removed = 0;
        let mut handles = self.inner.handles.lock();
        handles.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|entry| entry.thread != current);
            removed += before - entries.len();
            !entries.is_empty()
        });
        drop(handles);
        if removed > 0 {
            self.inner.released.notify_all();
        }
        removed
    }

    pub fn active_handles(&self) -> Vec<HandleSnapshot> {
        self.inner.snapshot()
    }

    /// Starts a thread that logs outstanding handles every `interval`.
    ///
    /// Calling this while a reporter runs is a no-op.
    pub fn start_reporting(&self, interval: Duration) {
        let mut reporter = self.inner.reporter.lock();
        if reporter.is_some() {
            return;
        }

        let (stop, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let spawned = std::thread::Builder::new()
            .name("strata-lock-report".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let Some(inner) = weak.upgrade() else { break };
                report(&inner.snapshot());
            });

        match spawned {
            Ok(thread) => *reporter = Some(Reporter { stop, thread }),
            Err(err) => tracing::warn!(
                target = "strata.cache",
                error = %err,
                "failed to start lock reporting thread"
            ),
        }
    }

    pub fn stop_reporting(&self) {
        let Some(reporter) = self.inner.reporter.lock().take() else {
            return;
        };
        drop(reporter.stop);
        if reporter.thread.join().is_err() {
            tracing::debug!(target = "strata.cache", "lock reporting thread panicked");
        }
    }

    pub fn is_reporting(&self) -> bool {
        self.inner.reporter.lock().is_some()
    }
}

impl std::fmt::Debug for JoinableFileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinableFileManager")
            .field("open_paths", &self.inner.handles.lock().len())
            .finish()
    }
}

fn report(handles: &[HandleSnapshot]) {
    if handles.is_empty() {
        tracing::debug!(target = "strata.cache", "no open cache file handles");
        return;
    }
    for handle in handles {
        tracing::info!(
            target = "strata.cache",
            path = %handle.path.display(),
            kind = ?handle.kind,
            thread = ?handle.thread,
            age_ms = handle.age.as_millis() as u64,
            "open cache file handle"
        );
    }
}

/// Registration of one open handle; dropping it releases the handle and wakes waiters.
#[must_use = "the handle is released when the guard is dropped"]
pub struct HandleGuard {
    manager: Arc<ManagerInner>,
    path: PathBuf,
    id: u64,
}

impl HandleGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.manager.release(&self.path, self.id);
    }
}

impl std::fmt::Debug for HandleGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleGuard")
            .field("path", &self.path)
            .field("id", &self.id)
            .finish()
    }
}
