//! Tiered on-disk file cache for resolved artifacts.
//!
//! Content for a [`ConcreteResource`] lives in a durable main tier and, when its
//! [`Location`] names one, a fast tier that acts as a read cache of the main tier.
//! [`CacheEngine`] is the entry point; it hands out atomic write streams, read streams
//! that promote cold files to the fast tier in the background, and one canonical
//! [`Transfer`] handle per resource.

mod atomic;
mod config;
mod engine;
mod error;
mod joinable;
mod locking;
mod model;
mod pool;
mod promote;
mod resolve;
mod spi;
mod stream;
mod transfer;
mod util;

pub use atomic::AtomicFileWriter;
pub use config::{CacheConfig, CacheStrategy, CACHE_DIR_ENV, MIN_CACHE_TIMEOUT_SECONDS};
pub use engine::{CacheEngine, CacheEngineBuilder};
pub use error::{CacheError, Result};
pub use joinable::{HandleGuard, HandleKind, HandleSnapshot, JoinableFileManager};
pub use locking::{JoinableLockingSupport, LockingSupport, NoOpLockingSupport};
pub use model::{
    ConcreteResource, Location, ATTR_ALT_STORAGE_PATH, ATTR_FAST_STORAGE_PATH,
    ATTR_MAX_CONNECTIONS, ATTR_TIMEOUT_SECONDS,
};
pub use pool::{Interrupted, TaskHandle, TransferPool};
pub use promote::PromotingReader;
pub use resolve::{PathResolver, TtlPolicy};
pub use spi::{
    BoxRead, BoxWrite, EventError, FileEvent, FileEventEmitter, LocationNamePathGenerator,
    NoOpFileEventEmitter, NoOpTransferDecorator, OpenMode, PathGenerator, TransferDecorator,
};
pub use stream::{CacheReader, CacheWriter, TransferWriter};
pub use transfer::{Transfer, TransferRegistry};

/// Suffix of the temp file an in-progress write goes to.
pub const SUFFIX_TO_WRITE: &str = ".to-write";

/// Suffix an expired file is renamed to just before it is deleted.
pub const SUFFIX_TO_DELETE: &str = ".to-delete";

/// Names ending in these are never listed or treated as content.
pub const HIDDEN_SUFFIXES: &[&str] = &[SUFFIX_TO_WRITE, SUFFIX_TO_DELETE];
