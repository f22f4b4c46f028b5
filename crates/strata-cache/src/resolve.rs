//! Resource-to-path resolution across the main and fast tiers, with lazy TTL eviction.
//!
//! Eviction is not a background sweep: every call that resolves a tier path first checks
//! whether the file at that path has outlived its location's TTL and, if so, renames it
//! to `<path>.to-delete` and deletes the renamed file. Readers that already hold the
//! original inode keep reading. Failures are logged and never block resolution.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::CacheConfig;
use crate::model::ConcreteResource;
use crate::spi::PathGenerator;
use crate::util::{join_relative, with_suffix};
use crate::SUFFIX_TO_DELETE;

/// When a cached file counts as expired. Pure: no filesystem access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TtlPolicy {
    enabled: bool,
    default_timeout_seconds: u64,
    min_timeout: Duration,
}

impl TtlPolicy {
    pub fn new(default_timeout_seconds: u64, min_timeout: Duration) -> Self {
        Self {
            enabled: true,
            default_timeout_seconds,
            min_timeout,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            default_timeout_seconds: 0,
            min_timeout: Duration::ZERO,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        if !config.timeout_processing {
            return Self::disabled();
        }
        Self::new(config.default_timeout_seconds, config.min_timeout())
    }

    /// The TTL actually applied for a location's configured timeout, or `None` if files
    /// never expire.
    pub fn effective_timeout(&self, configured_seconds: Option<u64>) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        let seconds = configured_seconds.unwrap_or(self.default_timeout_seconds);
        if seconds == 0 {
            return None;
        }
        Some(Duration::from_secs(seconds).max(self.min_timeout))
    }

    pub fn is_expired(
        &self,
        now: SystemTime,
        last_modified: SystemTime,
        configured_seconds: Option<u64>,
    ) -> bool {
        let Some(timeout) = self.effective_timeout(configured_seconds) else {
            return false;
        };
        // A modification time in the future is treated as fresh.
        match now.duration_since(last_modified) {
            Ok(age) => age > timeout,
            Err(_) => false,
        }
    }
}

/// Computes tier paths for resources.
pub struct PathResolver {
    base_dir: PathBuf,
    generator: Arc<dyn PathGenerator>,
    ttl: TtlPolicy,
}

impl PathResolver {
    pub fn new(base_dir: impl Into<PathBuf>, generator: Arc<dyn PathGenerator>, ttl: TtlPolicy) -> Self {
        Self {
            base_dir: base_dir.into(),
            generator,
            ttl,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn ttl(&self) -> &TtlPolicy {
        &self.ttl
    }

    /// Default main-tier location: the path generator's output under the base directory.
    ///
    /// Ignores alt-storage overrides and performs no eviction.
    pub fn file_path(&self, resource: &ConcreteResource) -> PathBuf {
        join_relative(&self.base_dir, &self.generator.file_path(resource))
    }

    pub fn main_path(&self, resource: &ConcreteResource) -> PathBuf {
        let path = match resource.location().alt_storage_path() {
            Some(alt) => join_relative(&alt, resource.path()),
            None => self.file_path(resource),
        };
        self.evict_if_expired(resource, &path);
        path
    }

    /// `None` when the resource's location has no fast tier.
    pub fn fast_path(&self, resource: &ConcreteResource) -> Option<PathBuf> {
        let fast_dir = resource.location().fast_storage_path()?;
        let path = join_relative(&fast_dir, resource.path());
        self.evict_if_expired(resource, &path);
        Some(path)
    }

    /// The fast-tier path if that file currently exists, else the main-tier path.
    pub fn fastest_existing(&self, resource: &ConcreteResource) -> PathBuf {
        match self.fast_path(resource) {
            Some(fast) if fast.exists() => fast,
            _ => self.main_path(resource),
        }
    }

    /// Returns `true` if a file was moved out of the way.
    pub(crate) fn evict_if_expired(&self, resource: &ConcreteResource, path: &Path) -> bool {
        if resource.is_root() {
            return false;
        }
        let configured = resource.location().timeout_seconds();
        if self.ttl.effective_timeout(configured).is_none() {
            return false;
        }
        let Ok(meta) = fs::metadata(path) else {
            return false;
        };
        if meta.is_dir() {
            return false;
        }
        let Ok(modified) = meta.modified() else {
            return false;
        };
        let now = SystemTime::now();
        if !self.ttl.is_expired(now, modified, configured) {
            return false;
        }

        let moved = with_suffix(path, SUFFIX_TO_DELETE);
        if let Err(err) = fs::rename(path, &moved) {
            tracing::warn!(
                target = "strata.cache",
                path = %path.display(),
                error = %err,
                "failed to move expired cache file aside"
            );
            return false;
        }

        tracing::info!(
            target = "strata.cache",
            path = %path.display(),
            moved = %moved.display(),
            age_secs = now.duration_since(modified).map(|d| d.as_secs()).unwrap_or_default(),
            timeout_secs = self.ttl.effective_timeout(configured).map(|d| d.as_secs()).unwrap_or_default(),
            "deleting expired cache file"
        );
        if let Err(err) = fs::remove_file(&moved) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::error!(
                    target = "strata.cache",
                    path = %moved.display(),
                    error = %err,
                    "failed to delete expired cache file"
                );
            }
        }
        true
    }
}
