use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Floor applied to every configured TTL.
pub const MIN_CACHE_TIMEOUT_SECONDS: u64 = 60 * 60;

/// Environment variable overriding the default cache base directory.
pub const CACHE_DIR_ENV: &str = "STRATA_CACHE_DIR";

/// Which locking/coordination variant the engine is built with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// No-op locking; plain file handles.
    #[default]
    Simple,
    /// Every stream is registered with a joinable file manager that answers the
    /// read/write-lock queries and waits.
    Joinable,
}

impl CacheStrategy {
    /// Whether `create_alias` is asked to link rather than copy.
    ///
    /// Linking is not implemented: the request is logged and a copy is made instead.
    pub fn alias_linking_enabled(self, requested: bool) -> bool {
        match self {
            Self::Simple => requested,
            Self::Joinable => false,
        }
    }
}

/// Configuration for a [`crate::CacheEngine`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Main-tier root for locations without an alt-storage override.
    pub base_dir: PathBuf,
    pub strategy: CacheStrategy,
    /// Ask for hardlinked aliases (currently always copies).
    pub alias_linking: bool,
    /// Enable lazy TTL eviction during path resolution.
    pub timeout_processing: bool,
    /// TTL applied when a location carries no timeout attribute. `0` disables expiry.
    pub default_timeout_seconds: u64,
    pub min_timeout_seconds: u64,
    /// Size of the background promotion pool.
    pub transfer_threads: usize,
    /// Period of the joinable strategy's outstanding-handle report.
    pub report_interval_secs: u64,
}

impl CacheConfig {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Resolve the base directory from `STRATA_CACHE_DIR`, falling back to `~/.strata/cache`.
    pub fn from_env() -> Result<Self, CacheError> {
        let base_dir = match std::env::var_os(CACHE_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => default_cache_root()?,
        };
        Ok(Self::new(base_dir))
    }

    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn min_timeout(&self) -> Duration {
        Duration::from_secs(self.min_timeout_seconds)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs.max(1))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        let base_dir = default_cache_root().unwrap_or_else(|err| {
            let fallback = std::env::temp_dir().join("strata-cache");
            tracing::debug!(
                target = "strata.cache",
                error = %err,
                fallback = %fallback.display(),
                "no home directory; using temp dir as cache base"
            );
            fallback
        });
        Self {
            base_dir,
            strategy: CacheStrategy::default(),
            alias_linking: false,
            timeout_processing: true,
            default_timeout_seconds: 0,
            min_timeout_seconds: MIN_CACHE_TIMEOUT_SECONDS,
            transfer_threads: 2,
            report_interval_secs: 30,
        }
    }
}

pub(crate) fn default_cache_root() -> Result<PathBuf, CacheError> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or(CacheError::MissingHomeDir)?;

    Ok(home.join(".strata").join("cache"))
}
