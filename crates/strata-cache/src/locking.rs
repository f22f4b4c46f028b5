use std::sync::Arc;
use std::time::Duration;

use crate::config::{CacheConfig, CacheStrategy};
use crate::joinable::JoinableFileManager;
use crate::model::ConcreteResource;
use crate::resolve::PathResolver;

/// Per-resource lock coordination exposed by the cache engine.
///
/// `lock_*`/`unlock_*` do not take locks under any strategy shipped here: mutual exclusion
/// between streams is not provided. Only the queries and waits carry meaning, and only
/// for [`JoinableLockingSupport`].
pub trait LockingSupport: Send + Sync {
    fn lock_read(&self, _resource: &ConcreteResource) {}
    fn unlock_read(&self, _resource: &ConcreteResource) {}
    fn lock_write(&self, _resource: &ConcreteResource) {}
    fn unlock_write(&self, _resource: &ConcreteResource) {}

    fn is_read_locked(&self, resource: &ConcreteResource) -> bool;
    fn is_write_locked(&self, resource: &ConcreteResource) -> bool;

    fn wait_for_read_unlock(&self, resource: &ConcreteResource);
    fn wait_for_write_unlock(&self, resource: &ConcreteResource);

    fn cleanup_current_thread(&self) {}
    fn start_reporting(&self) {}
    fn stop_reporting(&self) {}
}

/// Never locked; waits return immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpLockingSupport;

impl LockingSupport for NoOpLockingSupport {
    fn is_read_locked(&self, _resource: &ConcreteResource) -> bool {
        false
    }

    fn is_write_locked(&self, _resource: &ConcreteResource) -> bool {
        false
    }

    fn wait_for_read_unlock(&self, _resource: &ConcreteResource) {}

    fn wait_for_write_unlock(&self, _resource: &ConcreteResource) {}
}

/// Answers lock queries from the handles registered with a [`JoinableFileManager`].
///
/// Read queries look at the fastest existing file for the resource, since that is the
/// file readers open. Write queries look at the main-tier file.
pub struct JoinableLockingSupport {
    manager: JoinableFileManager,
    resolver: Arc<PathResolver>,
    report_interval: Duration,
}

impl JoinableLockingSupport {
    pub fn new(
        manager: JoinableFileManager,
        resolver: Arc<PathResolver>,
        report_interval: Duration,
    ) -> Self {
        Self {
            manager,
            resolver,
            report_interval,
        }
    }

    pub fn manager(&self) -> &JoinableFileManager {
        &self.manager
    }

    fn not_implemented(&self, op: &'static str, resource: &ConcreteResource) {
        tracing::trace!(
            target = "strata.cache",
            op,
            resource = %resource,
            "explicit locking is not implemented; ignoring"
        );
    }
}

impl LockingSupport for JoinableLockingSupport {
    fn lock_read(&self, resource: &ConcreteResource) {
        self.not_implemented("lock_read", resource);
    }

    fn unlock_read(&self, resource: &ConcreteResource) {
        self.not_implemented("unlock_read", resource);
    }

    fn lock_write(&self, resource: &ConcreteResource) {
        self.not_implemented("lock_write", resource);
    }

    fn unlock_write(&self, resource: &ConcreteResource) {
        self.not_implemented("unlock_write", resource);
    }

    fn is_read_locked(&self, resource: &ConcreteResource) -> bool {
        self.manager
            .is_read_locked(&self.resolver.fastest_existing(resource))
    }

    fn is_write_locked(&self, resource: &ConcreteResource) -> bool {
        self.manager
            .is_write_locked(&self.resolver.main_path(resource))
    }

    fn wait_for_read_unlock(&self, resource: &ConcreteResource) {
        self.manager
            .wait_for_read_unlock(&self.resolver.fastest_existing(resource));
    }

    fn wait_for_write_unlock(&self, resource: &ConcreteResource) {
        self.manager
            .wait_for_write_unlock(&self.resolver.main_path(resource));
    }

    fn cleanup_current_thread(&self) {
        let removed = self.manager.cleanup_current_thread();
        if removed > 0 {
            tracing::debug!(
                target = "strata.cache",
                removed,
                "released handles held by current thread"
            );
        }
    }

    fn start_reporting(&self) {
        self.manager.start_reporting(self.report_interval);
    }

    fn stop_reporting(&self) {
        self.manager.stop_reporting();
    }
}

impl CacheStrategy {
    /// The locking support for this strategy, plus the handle registry streams must
    /// register with (joinable only).
    pub(crate) fn create_locking(
        self,
        resolver: &Arc<PathResolver>,
        config: &CacheConfig,
    ) -> (Arc<dyn LockingSupport>, Option<JoinableFileManager>) {
        match self {
            Self::Simple => (Arc::new(NoOpLockingSupport), None),
            Self::Joinable => {
                let manager = JoinableFileManager::new();
                let locking = JoinableLockingSupport::new(
                    manager.clone(),
                    Arc::clone(resolver),
                    config.report_interval(),
                );
                (Arc::new(locking), Some(manager))
            }
        }
    }
}
