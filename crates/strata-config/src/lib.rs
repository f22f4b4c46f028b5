//! `strata.toml` loading and process-wide logging setup.
//!
//! ```toml
//! [cache]
//! base_dir = "cache"
//! strategy = "joinable"
//!
//! [logging]
//! level = "strata.cache=debug,info"
//!
//! [[locations]]
//! name = "central"
//! uri = "https://repo.maven.apache.org/maven2"
//! fast_storage_path = "/mnt/ssd/strata"
//! timeout_seconds = 86400
//! ```
//!
//! Relative paths are resolved against the directory holding the config file.

mod logging;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use strata_cache::{
    CacheConfig, Location, ATTR_ALT_STORAGE_PATH, ATTR_FAST_STORAGE_PATH, ATTR_MAX_CONNECTIONS,
    ATTR_TIMEOUT_SECONDS, CACHE_DIR_ENV,
};
use thiserror::Error;

pub use logging::{init_tracing, LoggingConfig};

/// Environment variable naming the config file to load when none is given explicitly.
pub const CONFIG_ENV: &str = "STRATA_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StrataConfig {
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub locations: Vec<LocationConfig>,
}

/// A `[[locations]]` entry; becomes a [`Location`] with the matching attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocationConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast_storage_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_storage_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

impl LocationConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: None,
            fast_storage_path: None,
            alt_storage_path: None,
            timeout_seconds: None,
            max_connections: None,
        }
    }

    pub fn to_location(&self) -> Location {
        let mut location = Location::new(self.name.clone());
        if let Some(uri) = &self.uri {
            location = location.with_uri(uri.clone());
        }
        if let Some(path) = &self.fast_storage_path {
            location.set_attribute(ATTR_FAST_STORAGE_PATH, path.to_string_lossy());
        }
        if let Some(path) = &self.alt_storage_path {
            location.set_attribute(ATTR_ALT_STORAGE_PATH, path.to_string_lossy());
        }
        if let Some(timeout) = self.timeout_seconds {
            location.set_attribute(ATTR_TIMEOUT_SECONDS, timeout.to_string());
        }
        if let Some(max) = self.max_connections {
            location.set_attribute(ATTR_MAX_CONNECTIONS, max.to_string());
        }
        location
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Redacts user-supplied values from a TOML/serde error message so config contents
/// never end up in logs.
fn sanitize_toml_error_message(message: &str) -> String {
    static QUOTED_STRING_RE: OnceLock<Option<regex::Regex>> = OnceLock::new();
    static SINGLE_QUOTED_STRING_RE: OnceLock<Option<regex::Regex>> = OnceLock::new();

    let mut out = message.to_owned();
    // `\"` may appear inside a quoted value, so a plain `"[^"]*"` would stop early.
    if let Some(re) = QUOTED_STRING_RE
        .get_or_init(|| regex::Regex::new(r#""(?:\\.|[^"\\])*""#).ok())
        .as_ref()
    {
        out = re.replace_all(&out, r#""<redacted>""#).into_owned();
    }
    if let Some(re) = SINGLE_QUOTED_STRING_RE
        .get_or_init(|| regex::Regex::new(r#"'(?:\\.|[^'\\])*'"#).ok())
        .as_ref()
    {
        out = re.replace_all(&out, "'<redacted>'").into_owned();
    }

    // Backticked segments are user input after `unknown field`/`unknown variant` and in
    // the value part of `invalid type`/`invalid value`; schema names elsewhere stay.
    let mut start = ["unknown field `", "unknown variant `"]
        .iter()
        .filter_map(|pattern| out.find(pattern).map(|pos| pos + pattern.len() - 1))
        .min();
    if start.is_none() && (out.contains("invalid type:") || out.contains("invalid value:")) {
        let boundary = out.find(", expected").unwrap_or(out.len());
        start = out[..boundary].find('`');
    }
    if let Some(start) = start {
        let after_start = &out[start + 1..];
        let end = after_start
            .find('`')
            .map(|end_rel| start + 1 + end_rel);
        if let Some(end) = end {
            out.replace_range(start + 1..end, "<redacted>");
        }
    }

    out
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // `Display` includes a snippet of the input; keep only the message.
        ConfigError::Toml(sanitize_toml_error_message(err.message()))
    }
}

impl StrataConfig {
    /// Loads `explicit`, else the file named by `STRATA_CONFIG`, else defaults.
    /// `STRATA_CACHE_DIR` overrides the cache base directory in every case.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var_os(CONFIG_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        let mut config = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        if let Some(dir) = std::env::var_os(CACHE_DIR_ENV).filter(|value| !value.is_empty()) {
            config.cache.base_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::load_from_str(&text)?;
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            config.resolve_relative_paths(dir);
        }
        tracing::debug!(
            target = "strata.config",
            path = %path.display(),
            locations = config.locations.len(),
            "loaded config"
        );
        Ok(config)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let config: StrataConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.transfer_threads == 0 {
            return Err(ConfigError::Invalid(
                "cache.transfer_threads must be at least 1".to_owned(),
            ));
        }
        let mut seen = BTreeSet::new();
        for location in &self.locations {
            if location.name.trim().is_empty() {
                return Err(ConfigError::Invalid("location name must not be empty".to_owned()));
            }
            if location.name.contains(['/', '\\']) {
                return Err(ConfigError::Invalid(format!(
                    "location name {:?} must not contain path separators",
                    location.name
                )));
            }
            if !seen.insert(location.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate location {:?}",
                    location.name
                )));
            }
        }
        Ok(())
    }

    /// Makes every relative path absolute against `root`.
    pub fn resolve_relative_paths(&mut self, root: &Path) {
        fn resolve(root: &Path, path: &mut PathBuf) {
            if path.is_relative() {
                *path = root.join(&*path);
            }
        }

        resolve(root, &mut self.cache.base_dir);
        if let Some(file) = self.logging.file.as_mut() {
            resolve(root, file);
        }
        for location in &mut self.locations {
            if let Some(path) = location.fast_storage_path.as_mut() {
                resolve(root, path);
            }
            if let Some(path) = location.alt_storage_path.as_mut() {
                resolve(root, path);
            }
        }
    }

    pub fn locations(&self) -> Vec<Arc<Location>> {
        self.locations
            .iter()
            .map(|location| Arc::new(location.to_location()))
            .collect()
    }

    pub fn location(&self, name: &str) -> Option<Arc<Location>> {
        self.locations
            .iter()
            .find(|location| location.name == name)
            .map(|location| Arc::new(location.to_location()))
    }
}
