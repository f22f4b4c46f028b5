//! Collaborator interfaces the cache consumes but does not implement itself.

use std::fmt;
use std::io::{Read, Write};

use crate::model::ConcreteResource;
use crate::transfer::Transfer;

pub type BoxRead = Box<dyn Read + Send + 'static>;
pub type BoxWrite = Box<dyn Write + Send + 'static>;

/// Maps a resource to its relative file path under the cache base directory.
///
/// Only consulted for the main tier's default location (no alt-storage override).
pub trait PathGenerator: Send + Sync {
    fn file_path(&self, resource: &ConcreteResource) -> String;
}

/// Lays resources out as `<location name>/<resource path>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocationNamePathGenerator;

impl PathGenerator for LocationNamePathGenerator {
    fn file_path(&self, resource: &ConcreteResource) -> String {
        if resource.is_root() {
            resource.location().name().to_owned()
        } else {
            format!("{}/{}", resource.location().name(), resource.path())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Opened {
        resource: ConcreteResource,
        mode: OpenMode,
    },
    Closed {
        resource: ConcreteResource,
        mode: OpenMode,
    },
    Deleted {
        resource: ConcreteResource,
    },
}

impl FileEvent {
    pub fn resource(&self) -> &ConcreteResource {
        match self {
            Self::Opened { resource, .. }
            | Self::Closed { resource, .. }
            | Self::Deleted { resource } => resource,
        }
    }
}

impl fmt::Display for FileEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened { resource, mode } => write!(f, "opened {resource} ({mode:?})"),
            Self::Closed { resource, mode } => write!(f, "closed {resource} ({mode:?})"),
            Self::Deleted { resource } => write!(f, "deleted {resource}"),
        }
    }
}

pub type EventError = Box<dyn std::error::Error + Send + Sync>;

/// Fire-and-forget listener for file access.
///
/// A returned error is logged by the caller; it never fails the file operation.
pub trait FileEventEmitter: Send + Sync {
    fn fire(&self, event: &FileEvent) -> Result<(), EventError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpFileEventEmitter;

impl FileEventEmitter for NoOpFileEventEmitter {
    fn fire(&self, _event: &FileEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// Optional filter over streams opened through a [`Transfer`].
///
/// Both methods default to returning the stream unchanged.
pub trait TransferDecorator: Send + Sync {
    fn decorate_read(&self, stream: BoxRead, _transfer: &Transfer) -> std::io::Result<BoxRead> {
        Ok(stream)
    }

    fn decorate_write(&self, stream: BoxWrite, _transfer: &Transfer) -> std::io::Result<BoxWrite> {
        Ok(stream)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpTransferDecorator;

impl TransferDecorator for NoOpTransferDecorator {}

pub(crate) fn fire_best_effort(emitter: &dyn FileEventEmitter, event: FileEvent) {
    if let Err(err) = emitter.fire(&event) {
        tracing::debug!(
            target = "strata.cache",
            event = %event,
            error = %err,
            "file event listener failed"
        );
    }
}
