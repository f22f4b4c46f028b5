use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::{Mutex, MutexGuard};

use crate::engine::{CacheEngine, EngineInner};
use crate::error::{CacheError, Result};
use crate::model::{ConcreteResource, Location};
use crate::spi::BoxRead;
use crate::stream::TransferWriter;

/// The shared per-resource handle.
///
/// At most one `Transfer` exists per resource per engine (see
/// [`CacheEngine::get_transfer`]), so its monitor serializes the operations that need
/// it across every caller. Operations delegate to the engine, applying the engine's
/// [`TransferDecorator`](crate::TransferDecorator) to streams.
pub struct Transfer {
    resource: ConcreteResource,
    engine: Weak<EngineInner>,
    monitor: Mutex<()>,
    promoting: AtomicBool,
}

impl Transfer {
    pub(crate) fn new(resource: ConcreteResource, engine: Weak<EngineInner>) -> Self {
        Self {
            resource,
            engine,
            monitor: Mutex::new(()),
            promoting: AtomicBool::new(false),
        }
    }

    pub fn resource(&self) -> &ConcreteResource {
        &self.resource
    }

    pub fn location(&self) -> &Arc<Location> {
        self.resource.location()
    }

    pub fn path(&self) -> &str {
        self.resource.path()
    }

    fn engine(&self) -> Result<CacheEngine> {
        self.engine
            .upgrade()
            .map(CacheEngine::from_inner)
            .ok_or_else(|| CacheError::EngineDropped {
                resource: self.resource.to_string(),
            })
    }

    pub fn exists(&self) -> Result<bool> {
        Ok(self.engine()?.exists(&self.resource))
    }

    pub fn is_directory(&self) -> Result<bool> {
        Ok(self.engine()?.is_directory(&self.resource))
    }

    pub fn is_file(&self) -> Result<bool> {
        Ok(self.engine()?.is_file(&self.resource))
    }

    pub fn length(&self) -> Result<u64> {
        Ok(self.engine()?.length(&self.resource))
    }

    pub fn last_modified(&self) -> Result<Option<SystemTime>> {
        Ok(self.engine()?.last_modified(&self.resource))
    }

    pub fn list(&self) -> Result<Option<Vec<String>>> {
        Ok(self.engine()?.list(&self.resource))
    }

    pub fn mkdirs(&self) -> Result<()> {
        self.engine()?.mkdirs(&self.resource)
    }

    pub fn create_file(&self) -> Result<()> {
        self.engine()?.create_file(&self.resource)
    }

    pub fn delete(&self) -> Result<bool> {
        self.engine()?.delete(&self.resource)
    }

    pub fn copy_from(&self, source: &Transfer) -> Result<()> {
        self.engine()?.copy(&source.resource, &self.resource)
    }

    /// Makes `target` an alias of this resource.
    pub fn create_alias_to(&self, target: &Transfer) -> Result<()> {
        self.engine()?.create_alias(&self.resource, &target.resource)
    }

    pub fn open_input_stream(&self) -> Result<BoxRead> {
        let engine = self.engine()?;
        let reader = engine.open_input_stream(&self.resource)?;
        Ok(engine
            .inner()
            .decorator
            .decorate_read(Box::new(reader), self)?)
    }

    /// Opens a decorated write stream. Nothing is published until
    /// [`TransferWriter::commit`].
    pub fn open_output_stream(&self) -> Result<TransferWriter> {
        let engine = self.engine()?;
        let writer = engine.open_output_stream(&self.resource)?;
        let decorator = &engine.inner().decorator;
        Ok(TransferWriter::new(writer, |stream| {
            decorator.decorate_write(stream, self)
        })?)
    }

    pub fn detached_file(&self) -> Result<PathBuf> {
        self.engine()?.detached_file(&self.resource)
    }

    pub fn file_path(&self) -> Result<PathBuf> {
        Ok(self.engine()?.file_path(&self.resource))
    }

    pub fn child(&self, name: &str) -> Result<Arc<Transfer>> {
        let child = self.resource.child(name)?;
        Ok(self.engine()?.get_transfer(&child))
    }

    pub fn parent(&self) -> Result<Option<Arc<Transfer>>> {
        let Some(parent) = self.resource.parent() else {
            return Ok(None);
        };
        Ok(Some(self.engine()?.get_transfer(&parent)))
    }

    pub fn is_read_locked(&self) -> Result<bool> {
        Ok(self.engine()?.is_read_locked(&self.resource))
    }

    pub fn is_write_locked(&self) -> Result<bool> {
        Ok(self.engine()?.is_write_locked(&self.resource))
    }

    pub fn wait_for_read_unlock(&self) -> Result<()> {
        self.engine()?.wait_for_read_unlock(&self.resource);
        Ok(())
    }

    pub fn wait_for_write_unlock(&self) -> Result<()> {
        self.engine()?.wait_for_write_unlock(&self.resource);
        Ok(())
    }

    /// Whether a background fast-tier copy of this resource is running.
    pub fn is_promoting(&self) -> bool {
        self.promoting.load(Ordering::Acquire)
    }

    pub(crate) fn lock_monitor(&self) -> MutexGuard<'_, ()> {
        self.monitor.lock()
    }

    /// Claims the right to promote this resource; `None` if a promotion already runs.
    pub(crate) fn claim_promotion(self: &Arc<Self>) -> Option<PromotionClaim> {
        self.promoting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PromotionClaim {
                transfer: Arc::clone(self),
            })
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("resource", &self.resource)
            .field("promoting", &self.is_promoting())
            .finish()
    }
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.resource, f)
    }
}

/// Held by the promotion job; releases the in-flight flag when dropped.
pub(crate) struct PromotionClaim {
    transfer: Arc<Transfer>,
}

impl Drop for PromotionClaim {
    fn drop(&mut self) {
        self.transfer.promoting.store(false, Ordering::Release);
    }
}

/// Interns [`Transfer`] handles by resource.
#[derive(Default)]
pub struct TransferRegistry {
    transfers: Mutex<HashMap<ConcreteResource, Arc<Transfer>>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle for `resource`, building it with `create` on first request.
    ///
    /// The check and insert happen under one lock, so racing callers share a handle.
    pub fn get_or_create(
        &self,
        resource: &ConcreteResource,
        create: impl FnOnce() -> Transfer,
    ) -> Arc<Transfer> {
        let mut transfers = self.transfers.lock();
        if let Some(existing) = transfers.get(resource) {
            return Arc::clone(existing);
        }
        let transfer = Arc::new(create());
        transfers.insert(resource.clone(), Arc::clone(&transfer));
        transfer
    }

    pub fn get(&self, resource: &ConcreteResource) -> Option<Arc<Transfer>> {
        self.transfers.lock().get(resource).cloned()
    }

    pub fn len(&self) -> usize {
        self.transfers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.lock().is_empty()
    }

    /// Forgets every handle. Holders of existing handles keep them, but later lookups
    /// create fresh ones.
    pub fn clear(&self) {
        self.transfers.lock().clear();
    }
}

impl fmt::Debug for TransferRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRegistry")
            .field("len", &self.len())
            .finish()
    }
}
