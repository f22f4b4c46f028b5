//! The tiered cache engine.
//!
//! Every operation resolves tier paths through the [`PathResolver`] (which applies lazy
//! TTL eviction) and then works against the main tier, consulting the fast tier when the
//! resource's location has one. The main tier is authoritative: its failures are
//! returned, while fast-tier failures are logged and the fast tier is skipped.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::atomic::{copy_file_atomic, AtomicFileWriter};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::joinable::{HandleKind, JoinableFileManager};
use crate::locking::LockingSupport;
use crate::model::ConcreteResource;
use crate::pool::TransferPool;
use crate::promote::PromotingReader;
use crate::resolve::{PathResolver, TtlPolicy};
use crate::spi::{
    fire_best_effort, FileEvent, FileEventEmitter, LocationNamePathGenerator, NoOpFileEventEmitter,
    NoOpTransferDecorator, OpenMode, PathGenerator, TransferDecorator,
};
use crate::stream::{CacheReader, CacheWriter, CloseNotice, ReaderSource};
use crate::transfer::{Transfer, TransferRegistry};
use crate::util::remove_dir_best_effort;
use crate::HIDDEN_SUFFIXES;

pub(crate) struct EngineInner {
    pub(crate) config: CacheConfig,
    pub(crate) resolver: Arc<PathResolver>,
    pub(crate) registry: TransferRegistry,
    pub(crate) locking: Arc<dyn LockingSupport>,
    pub(crate) joins: Option<JoinableFileManager>,
    pub(crate) pool: Arc<TransferPool>,
    pub(crate) events: Arc<dyn FileEventEmitter>,
    pub(crate) decorator: Arc<dyn TransferDecorator>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.locking.stop_reporting();
    }
}

pub struct CacheEngineBuilder {
    config: CacheConfig,
    generator: Arc<dyn PathGenerator>,
    events: Arc<dyn FileEventEmitter>,
    decorator: Arc<dyn TransferDecorator>,
    pool: Option<Arc<TransferPool>>,
}

impl CacheEngineBuilder {
    pub fn path_generator(mut self, generator: impl PathGenerator + 'static) -> Self {
        self.generator = Arc::new(generator);
        self
    }

    pub fn event_emitter(mut self, events: impl FileEventEmitter + 'static) -> Self {
        self.events = Arc::new(events);
        self
    }

    pub fn decorator(mut self, decorator: impl TransferDecorator + 'static) -> Self {
        self.decorator = Arc::new(decorator);
        self
    }

    /// Shares an existing promotion pool instead of starting one per engine.
    pub fn transfer_pool(mut self, pool: Arc<TransferPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn build(self) -> CacheEngine {
        let config = self.config;
        let resolver = Arc::new(PathResolver::new(
            config.base_dir.clone(),
            self.generator,
            TtlPolicy::from_config(&config),
        ));
        let (locking, joins) = config.strategy.create_locking(&resolver, &config);
        let pool = self
            .pool
            .unwrap_or_else(|| Arc::new(TransferPool::new(config.transfer_threads)));

        tracing::debug!(
            target = "strata.cache",
            base_dir = %config.base_dir.display(),
            strategy = ?config.strategy,
            transfer_threads = pool.threads(),
            "cache engine ready"
        );

        CacheEngine {
            inner: Arc::new(EngineInner {
                config,
                resolver,
                registry: TransferRegistry::new(),
                locking,
                joins,
                pool,
                events: self.events,
                decorator: self.decorator,
            }),
        }
    }
}

/// A tiered file cache. Clones share state.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<EngineInner>,
}

impl CacheEngine {
    pub fn new(config: CacheConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: CacheConfig) -> CacheEngineBuilder {
        CacheEngineBuilder {
            config,
            generator: Arc::new(LocationNamePathGenerator),
            events: Arc::new(NoOpFileEventEmitter),
            decorator: Arc::new(NoOpTransferDecorator),
            pool: None,
        }
    }

    pub(crate) fn from_inner(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &EngineInner {
        &self.inner
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.inner.resolver
    }

    /// Whether aliases are requested as hardlinks. Linking is not implemented, so
    /// [`create_alias`](Self::create_alias) copies either way.
    pub fn is_alias_linking_enabled(&self) -> bool {
        self.inner
            .config
            .strategy
            .alias_linking_enabled(self.inner.config.alias_linking)
    }

    pub fn exists(&self, resource: &ConcreteResource) -> bool {
        if let Some(fast) = self.inner.resolver.fast_path(resource) {
            if fast.exists() {
                return true;
            }
        }
        self.inner.resolver.main_path(resource).exists()
    }

    pub fn is_directory(&self, resource: &ConcreteResource) -> bool {
        self.inner.resolver.fastest_existing(resource).is_dir()
    }

    pub fn is_file(&self, resource: &ConcreteResource) -> bool {
        self.inner.resolver.fastest_existing(resource).is_file()
    }

    /// Size in bytes, or 0 if the resource does not exist.
    pub fn length(&self, resource: &ConcreteResource) -> u64 {
        fs::metadata(self.inner.resolver.fastest_existing(resource))
            .map(|meta| meta.len())
            .unwrap_or(0)
    }

    pub fn last_modified(&self, resource: &ConcreteResource) -> Option<SystemTime> {
        fs::metadata(self.inner.resolver.fastest_existing(resource))
            .and_then(|meta| meta.modified())
            .ok()
    }

    /// Entry names of the main-tier directory, excluding dotfiles and in-flight
    /// temp/eviction files. `None` if the directory cannot be listed.
    pub fn list(&self, resource: &ConcreteResource) -> Option<Vec<String>> {
        let dir = self.inner.resolver.main_path(resource);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(
                        target = "strata.cache",
                        path = %dir.display(),
                        error = %err,
                        "failed to list directory"
                    );
                }
                return None;
            }
        };
        Some(
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .filter(|name| is_listed(name))
                .collect(),
        )
    }

    pub fn mkdirs(&self, resource: &ConcreteResource) -> Result<()> {
        let main = self.inner.resolver.main_path(resource);
        fs::create_dir_all(&main).map_err(|source| CacheError::CreateDir {
            path: main.clone(),
            source,
        })?;
        if let Some(fast) = self.inner.resolver.fast_path(resource) {
            if let Err(err) = fs::create_dir_all(&fast) {
                tracing::warn!(
                    target = "strata.cache",
                    path = %fast.display(),
                    error = %err,
                    "failed to create fast storage directory"
                );
            }
        }
        Ok(())
    }

    /// Creates an empty file (and its parents) if none exists; existing content is kept.
    pub fn create_file(&self, resource: &ConcreteResource) -> Result<()> {
        let main = self.inner.resolver.main_path(resource);
        touch(&main)?;
        if let Some(fast) = self.inner.resolver.fast_path(resource) {
            if let Err(err) = touch(&fast) {
                tracing::warn!(
                    target = "strata.cache",
                    path = %fast.display(),
                    error = %err,
                    "failed to create fast storage file"
                );
            }
        }
        Ok(())
    }

    pub fn copy(&self, from: &ConcreteResource, to: &ConcreteResource) -> Result<()> {
        let source = self.inner.resolver.main_path(from);
        if !source.exists() {
            return Err(CacheError::CopySourceMissing { from: source });
        }
        let target = self.inner.resolver.main_path(to);
        copy_file_atomic(&source, &target)?;

        let fast_from = self.inner.resolver.fast_path(from);
        let fast_to = self.inner.resolver.fast_path(to);
        if let (Some(fast_from), Some(fast_to)) = (fast_from, fast_to) {
            if fast_from.exists() {
                if let Err(err) = copy_file_atomic(&fast_from, &fast_to) {
                    tracing::warn!(
                        target = "strata.cache",
                        from = %fast_from.display(),
                        to = %fast_to.display(),
                        error = %err,
                        "failed to copy fast storage file"
                    );
                }
            }
        }
        Ok(())
    }

    /// Makes `to` hold the same content as `from`. A no-op when both name the same
    /// resource.
    pub fn create_alias(&self, from: &ConcreteResource, to: &ConcreteResource) -> Result<()> {
        if from == to {
            return Ok(());
        }
        if self.is_alias_linking_enabled() {
            tracing::debug!(
                target = "strata.cache",
                from = %from,
                to = %to,
                "alias linking is not implemented; copying"
            );
        }
        self.copy(from, to)
    }

    /// Deletes the fast copy, then the main-tier file. Returns whether the main-tier file
    /// was deleted.
    pub fn delete(&self, resource: &ConcreteResource) -> Result<bool> {
        if let Some(fast) = self.inner.resolver.fast_path(resource) {
            if fast.exists() {
                remove_path(&fast).map_err(|source| CacheError::DeleteFast {
                    path: fast.clone(),
                    source,
                })?;
            }
        }

        let main = self.inner.resolver.main_path(resource);
        let deleted = match remove_path(&main) {
            Ok(()) => true,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(
                        target = "strata.cache",
                        path = %main.display(),
                        error = %err,
                        "failed to delete cache file"
                    );
                }
                false
            }
        };
        if deleted {
            fire_best_effort(
                self.inner.events.as_ref(),
                FileEvent::Deleted {
                    resource: resource.clone(),
                },
            );
        }
        Ok(deleted)
    }

    /// Opens an atomic writer on the main tier, mirrored to the fast tier if configured.
    pub fn open_output_stream(&self, resource: &ConcreteResource) -> Result<CacheWriter> {
        let main_path = self.inner.resolver.main_path(resource);
        let main = AtomicFileWriter::create(&main_path)?;
        let fast = self
            .inner
            .resolver
            .fast_path(resource)
            .and_then(|path| match AtomicFileWriter::create(&path) {
                Ok(writer) => Some(writer),
                Err(err) => {
                    tracing::warn!(
                        target = "strata.cache",
                        path = %path.display(),
                        error = %err,
                        "cannot write fast storage copy"
                    );
                    None
                }
            });

        let mut handles = Vec::new();
        if let Some(joins) = &self.inner.joins {
            handles.push(joins.register(&main_path, HandleKind::Write));
            if let Some(fast) = &fast {
                handles.push(joins.register(fast.target(), HandleKind::Write));
            }
        }

        let close = self.opened(resource, OpenMode::Write);
        Ok(CacheWriter::new(main, fast, handles, close))
    }

    /// Opens the resource for reading.
    ///
    /// Serves the fast copy when present. Otherwise reads the main tier and, if the
    /// location has a fast tier and no promotion of this resource is already running,
    /// copies the file there in the background once reading starts.
    pub fn open_input_stream(&self, resource: &ConcreteResource) -> Result<CacheReader> {
        let fast_path = self.inner.resolver.fast_path(resource);
        if let Some(fast) = &fast_path {
            if fast.is_file() {
                match File::open(fast) {
                    Ok(file) => {
                        return Ok(self.reader(resource, ReaderSource::Plain(file), fast.clone()))
                    }
                    Err(err) => tracing::warn!(
                        target = "strata.cache",
                        path = %fast.display(),
                        error = %err,
                        "cannot open fast storage copy; reading main storage"
                    ),
                }
            }
        }

        let main_path = self.inner.resolver.main_path(resource);
        if !main_path.is_file() {
            return Err(CacheError::NotFound { path: main_path });
        }
        let main = File::open(&main_path)?;

        let source = match fast_path {
            Some(fast) => match self.get_transfer(resource).claim_promotion() {
                Some(claim) => ReaderSource::Promoting(PromotingReader::new(
                    main_path.clone(),
                    main,
                    fast,
                    Arc::clone(&self.inner.pool),
                    claim,
                    self.inner.joins.clone(),
                )),
                None => {
                    tracing::debug!(
                        target = "strata.cache",
                        resource = %resource,
                        "promotion already in flight; reading main storage"
                    );
                    ReaderSource::Plain(main)
                }
            },
            None => ReaderSource::Plain(main),
        };
        Ok(self.reader(resource, source, main_path))
    }

    /// A plain path for callers that need direct file access.
    ///
    /// Prefers the fast tier, promoting the main-tier file or directory tree there
    /// first when the fast copy is missing. Root resources get their directory
    /// created. Serialized per resource.
    pub fn detached_file(&self, resource: &ConcreteResource) -> Result<PathBuf> {
        let transfer = self.get_transfer(resource);
        let _monitor = transfer.lock_monitor();

        let main = self.inner.resolver.main_path(resource);
        let path = match self.inner.resolver.fast_path(resource) {
            Some(fast) if fast.exists() => fast,
            Some(fast) if main.exists() => match copy_tree(&main, &fast) {
                Ok(()) => fast,
                Err(err) => {
                    tracing::warn!(
                        target = "strata.cache",
                        from = %main.display(),
                        to = %fast.display(),
                        error = %err,
                        "failed to promote to fast storage; using main storage"
                    );
                    if fast.is_dir() {
                        remove_dir_best_effort(&fast, "detached_file.promote_failed");
                    }
                    main
                }
            },
            Some(fast) if resource.is_root() => fast,
            _ => main,
        };

        if resource.is_root() && !path.exists() {
            fs::create_dir_all(&path).map_err(|source| CacheError::CreateDir {
                path: path.clone(),
                source,
            })?;
        }
        Ok(path)
    }

    /// The default main-tier path, ignoring alt-storage overrides.
    pub fn file_path(&self, resource: &ConcreteResource) -> PathBuf {
        self.inner.resolver.file_path(resource)
    }

    /// The canonical handle for `resource`; every call for an equal resource returns
    /// the same instance until [`clear_transfer_cache`](Self::clear_transfer_cache).
    pub fn get_transfer(&self, resource: &ConcreteResource) -> Arc<Transfer> {
        self.inner.registry.get_or_create(resource, || {
            Transfer::new(resource.clone(), Arc::downgrade(&self.inner))
        })
    }

    pub fn clear_transfer_cache(&self) {
        self.inner.registry.clear();
    }

    pub fn transfer_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn lock_read(&self, resource: &ConcreteResource) {
        self.inner.locking.lock_read(resource);
    }

    pub fn unlock_read(&self, resource: &ConcreteResource) {
        self.inner.locking.unlock_read(resource);
    }

    pub fn lock_write(&self, resource: &ConcreteResource) {
        self.inner.locking.lock_write(resource);
    }

    pub fn unlock_write(&self, resource: &ConcreteResource) {
        self.inner.locking.unlock_write(resource);
    }

    pub fn is_read_locked(&self, resource: &ConcreteResource) -> bool {
        self.inner.locking.is_read_locked(resource)
    }

    pub fn is_write_locked(&self, resource: &ConcreteResource) -> bool {
        self.inner.locking.is_write_locked(resource)
    }

    /// Blocks, without a timeout, until nobody reads the resource.
    pub fn wait_for_read_unlock(&self, resource: &ConcreteResource) {
        self.inner.locking.wait_for_read_unlock(resource);
    }

    /// Blocks, without a timeout, until nobody writes the resource.
    pub fn wait_for_write_unlock(&self, resource: &ConcreteResource) {
        self.inner.locking.wait_for_write_unlock(resource);
    }

    pub fn cleanup_current_thread(&self) {
        self.inner.locking.cleanup_current_thread();
    }

    pub fn start_reporting(&self) {
        self.inner.locking.start_reporting();
    }

    pub fn stop_reporting(&self) {
        self.inner.locking.stop_reporting();
    }

    fn opened(&self, resource: &ConcreteResource, mode: OpenMode) -> CloseNotice {
        fire_best_effort(
            self.inner.events.as_ref(),
            FileEvent::Opened {
                resource: resource.clone(),
                mode,
            },
        );
        CloseNotice {
            emitter: Arc::clone(&self.inner.events),
            resource: resource.clone(),
            mode,
        }
    }

    fn reader(&self, resource: &ConcreteResource, source: ReaderSource, path: PathBuf) -> CacheReader {
        let handle = self
            .inner
            .joins
            .as_ref()
            .map(|joins| joins.register(&path, HandleKind::Read));
        let close = self.opened(resource, OpenMode::Read);
        CacheReader::new(source, path, handle, close)
    }
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("base_dir", &self.inner.config.base_dir)
            .field("strategy", &self.inner.config.strategy)
            .field("transfers", &self.inner.registry.len())
            .finish()
    }
}

fn is_listed(name: &str) -> bool {
    !name.starts_with('.') && !HIDDEN_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

fn touch(path: &Path) -> Result<()> {
    crate::util::create_parent_dirs(path)?;
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    Ok(())
}

fn remove_path(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    }
}

/// Copies a file, or a directory tree file by file, from `from` to `to`.
fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    if !from.is_dir() {
        copy_file_atomic(from, to)?;
        return Ok(());
    }
    for entry in walkdir::WalkDir::new(from).follow_links(true) {
        let entry = entry.map_err(io::Error::from)?;
        let Ok(relative) = entry.path().strip_prefix(from) else {
            continue;
        };
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|source| CacheError::CreateDir {
                path: target.clone(),
                source,
            })?;
        } else if is_listed(&entry.file_name().to_string_lossy()) {
            copy_file_atomic(entry.path(), &target)?;
        }
    }
    Ok(())
}
