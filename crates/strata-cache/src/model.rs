//! Identity types: storage [`Location`]s and the [`ConcreteResource`]s cached under them.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{CacheError, Result};

/// Directory root of the fast (low-latency) storage tier.
pub const ATTR_FAST_STORAGE_PATH: &str = "fast-storage-path";
/// Override root of the main storage tier, bypassing the cache base directory.
pub const ATTR_ALT_STORAGE_PATH: &str = "alt-storage-path";
/// Time-to-live for cached files, in seconds. Absent or `0` means "never expire".
pub const ATTR_TIMEOUT_SECONDS: &str = "timeout-seconds";
/// Connection limit for the transport layer; carried but unused by the cache.
pub const ATTR_MAX_CONNECTIONS: &str = "max-connections";

/// A named storage endpoint (remote mirror, local root, ...).
///
/// Locations compare and hash by name. Attributes may be populated lazily after the
/// location has been handed to resources, so the attribute map sits behind a lock.
pub struct Location {
    name: String,
    uri: Option<String>,
    attributes: RwLock<BTreeMap<String, String>>,
}

impl Location {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: None,
            attributes: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_attribute(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.write().insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn attribute(&self, key: &str) -> Option<String> {
        self.attributes.read().get(key).cloned()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.write().insert(key.into(), value.into());
    }

    pub fn remove_attribute(&self, key: &str) -> Option<String> {
        self.attributes.write().remove(key)
    }

    pub fn fast_storage_path(&self) -> Option<PathBuf> {
        self.path_attribute(ATTR_FAST_STORAGE_PATH)
    }

    /// Sets the fast-tier root. Empty values are ignored.
    pub fn set_fast_storage_path(&self, path: impl AsRef<str>) {
        let path = path.as_ref();
        if !path.is_empty() {
            self.set_attribute(ATTR_FAST_STORAGE_PATH, path);
        }
    }

    pub fn alt_storage_path(&self) -> Option<PathBuf> {
        self.path_attribute(ATTR_ALT_STORAGE_PATH)
    }

    /// Sets the main-tier override root. Empty values are ignored.
    pub fn set_alt_storage_path(&self, path: impl AsRef<str>) {
        let path = path.as_ref();
        if !path.is_empty() {
            self.set_attribute(ATTR_ALT_STORAGE_PATH, path);
        }
    }

    pub fn timeout_seconds(&self) -> Option<u64> {
        self.parsed_attribute(ATTR_TIMEOUT_SECONDS)
    }

    pub fn max_connections(&self) -> Option<u32> {
        self.parsed_attribute(ATTR_MAX_CONNECTIONS)
    }

    fn path_attribute(&self, key: &str) -> Option<PathBuf> {
        self.attribute(key)
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
    }

    fn parsed_attribute<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.attribute(key)?;
        match raw.trim().parse::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::debug!(
                    target = "strata.cache",
                    location = %self.name,
                    attribute = key,
                    value = %raw,
                    "ignoring unparseable location attribute"
                );
                None
            }
        }
    }
}

impl PartialEq for Location {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Location {}

impl Hash for Location {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Location")
            .field("name", &self.name)
            .field("uri", &self.uri)
            .field("attributes", &*self.attributes.read())
            .finish()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// One cacheable item: a relative path under a [`Location`].
///
/// Equality and hashing use `(location, path)`. The path is normalized at construction
/// (no leading slash, no `.`/`..` segments); an empty path denotes the location's root.
#[derive(Clone)]
pub struct ConcreteResource {
    location: Arc<Location>,
    path: String,
}

impl ConcreteResource {
    pub fn new(location: Arc<Location>, path: impl AsRef<str>) -> Result<Self> {
        let raw = path.as_ref();
        let path = normalize(raw).ok_or_else(|| CacheError::InvalidPath {
            location: location.name().to_owned(),
            path: raw.to_owned(),
        })?;
        Ok(Self { location, path })
    }

    /// The synthetic resource naming the location's top-level directory.
    pub fn root(location: Arc<Location>) -> Self {
        Self {
            location,
            path: String::new(),
        }
    }

    pub fn location(&self) -> &Arc<Location> {
        &self.location
    }

    /// Normalized relative path; empty for the root resource.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    pub fn child(&self, name: impl AsRef<str>) -> Result<Self> {
        Self::new(
            self.location.clone(),
            format!("{}/{}", self.path, name.as_ref()),
        )
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let parent = match self.path.rfind('/') {
            Some(idx) => self.path[..idx].to_owned(),
            None => String::new(),
        };
        Some(Self {
            location: self.location.clone(),
            path: parent,
        })
    }
}

impl PartialEq for ConcreteResource {
    fn eq(&self, other: &Self) -> bool {
        self.location == other.location && self.path == other.path
    }
}

impl Eq for ConcreteResource {}

impl Hash for ConcreteResource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.location.hash(state);
        self.path.hash(state);
    }
}

impl fmt::Debug for ConcreteResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConcreteResource({self})")
    }
}

impl fmt::Display for ConcreteResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:/{}", self.location.name(), self.path)
    }
}

/// Collapses separators and `.`/`..` segments. Returns `None` when the path would leave
/// its root or contains a NUL byte.
fn normalize(raw: &str) -> Option<String> {
    if raw.contains('\0') {
        return None;
    }
    let mut segments: Vec<&str> = Vec::new();
    for segment in raw.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    Some(segments.join("/"))
}
