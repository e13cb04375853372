use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Weak};

use super::error::ResourceError;
use super::key::EngineKey;

/// A decoded artifact managed by the engine.
pub trait Resource: Send + Sync + 'static {
    /// Estimated size in bytes, counted against the memory cache budget.
    fn size(&self) -> u64;

    /// Returns the memory held by this resource to wherever it came from.
    ///
    /// Called at most once, when the engine no longer hands out the resource.
    fn recycle(&self) {}
}

/// Gets notified when an [`EngineResource`] is released by its last consumer.
pub trait ResourceListener<R: Resource>: Send + Sync {
    fn on_resource_released(&self, resource: &EngineResource<R>);
}

/// A resource whose last handle was dropped while still acquired.
pub struct ReclaimedResource<R: Resource> {
    pub key: EngineKey,
    pub payload: Arc<R>,
}

/// Connects resources with the engine that created them.
pub struct ResourceHooks<R: Resource> {
    pub(crate) listener: Option<Weak<dyn ResourceListener<R>>>,
    pub(crate) reclaim: Option<Sender<ReclaimedResource<R>>>,
}

impl<R: Resource> ResourceHooks<R> {
    pub fn new(
        listener: Weak<dyn ResourceListener<R>>,
        reclaim: Sender<ReclaimedResource<R>>,
    ) -> Self {
        Self {
            listener: Some(listener),
            reclaim: Some(reclaim),
        }
    }

    /// Hooks for a resource that is not tracked by anyone.
    pub fn detached() -> Self {
        Self {
            listener: None,
            reclaim: None,
        }
    }
}

impl<R: Resource> Clone for ResourceHooks<R> {
    fn clone(&self) -> Self {
        Self {
            listener: self.listener.clone(),
            reclaim: self.reclaim.clone(),
        }
    }
}

struct ResourceInner<R: Resource> {
    key: EngineKey,
    payload: Arc<R>,
    size: u64,
    is_memory_cacheable: bool,
    is_recyclable: bool,
    acquired: AtomicUsize,
    recycled: AtomicBool,
    hooks: ResourceHooks<R>,
}

impl<R: Resource> Drop for ResourceInner<R> {
    fn drop(&mut self) {
        if *self.acquired.get_mut() == 0 || !self.is_memory_cacheable {
            return;
        }
        tracing::debug!(key = %self.key, "Resource dropped without being released");
        if let Some(reclaim) = &self.hooks.reclaim {
            // the engine might already be gone
            let _ = reclaim.send(ReclaimedResource {
                key: self.key.clone(),
                payload: self.payload.clone(),
            });
        }
    }
}

/// A reference counted handle to a [`Resource`].
///
/// Consumers receive the handle already [acquired](Self::acquire) on their behalf and have to
/// [`release`](Self::release) it once they are done. When the count drops to zero, the engine
/// moves the resource into its memory cache, or recycles it.
///
/// Clones share the same count. Dropping the last clone while still acquired is noticed by the
/// engine, which then forgets about the resource.
pub struct EngineResource<R: Resource> {
    inner: Arc<ResourceInner<R>>,
}

impl<R: Resource> EngineResource<R> {
    pub fn new(
        key: EngineKey,
        payload: R,
        is_memory_cacheable: bool,
        is_recyclable: bool,
        hooks: ResourceHooks<R>,
    ) -> Self {
        Self::from_shared(
            key,
            Arc::new(payload),
            is_memory_cacheable,
            is_recyclable,
            hooks,
        )
    }

    pub(crate) fn from_shared(
        key: EngineKey,
        payload: Arc<R>,
        is_memory_cacheable: bool,
        is_recyclable: bool,
        hooks: ResourceHooks<R>,
    ) -> Self {
        let size = payload.size();
        Self {
            inner: Arc::new(ResourceInner {
                key,
                payload,
                size,
                is_memory_cacheable,
                is_recyclable,
                acquired: AtomicUsize::new(0),
                recycled: AtomicBool::new(false),
                hooks,
            }),
        }
    }

    pub fn key(&self) -> &EngineKey {
        &self.inner.key
    }

    pub fn get(&self) -> &R {
        &self.inner.payload
    }

    /// The size of the payload, as reported when the handle was created.
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn is_memory_cacheable(&self) -> bool {
        self.inner.is_memory_cacheable
    }

    pub fn is_recyclable(&self) -> bool {
        self.inner.is_recyclable
    }

    pub fn acquired(&self) -> usize {
        self.inner.acquired.load(Ordering::Acquire)
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired() > 0
    }

    pub fn is_recycled(&self) -> bool {
        self.inner.recycled.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same resource.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn acquire(&self) -> Result<(), ResourceError> {
        if self.is_recycled() {
            return Err(ResourceError::Recycled);
        }
        self.inner.acquired.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Gives up one acquisition.
    ///
    /// The release listener is notified when this was the last one.
    pub fn release(&self) -> Result<(), ResourceError> {
        let previous = self
            .inner
            .acquired
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| ResourceError::NotAcquired)?;

        if previous == 1 {
            let listener = self.inner.hooks.listener.as_ref().and_then(Weak::upgrade);
            if let Some(listener) = listener {
                listener.on_resource_released(self);
            }
        }
        Ok(())
    }

    /// Marks the resource as recycled and recycles the payload if it is recyclable.
    pub fn recycle(&self) -> Result<(), ResourceError> {
        if self.is_acquired() {
            return Err(ResourceError::StillAcquired);
        }
        if self.inner.recycled.swap(true, Ordering::AcqRel) {
            return Err(ResourceError::Recycled);
        }
        if self.inner.is_recyclable {
            self.inner.payload.recycle();
        }
        Ok(())
    }

    pub(crate) fn downgrade(&self) -> WeakResource<R> {
        WeakResource(Arc::downgrade(&self.inner))
    }
}

impl<R: Resource> Clone for EngineResource<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Resource> fmt::Debug for EngineResource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineResource")
            .field("key", &self.inner.key)
            .field("size", &self.inner.size)
            .field("acquired", &self.acquired())
            .field("is_memory_cacheable", &self.inner.is_memory_cacheable)
            .field("is_recyclable", &self.inner.is_recyclable)
            .field("recycled", &self.is_recycled())
            .finish()
    }
}

/// A non-owning reference to an [`EngineResource`].
pub(crate) struct WeakResource<R: Resource>(Weak<ResourceInner<R>>);

impl<R: Resource> WeakResource<R> {
    pub fn upgrade(&self) -> Option<EngineResource<R>> {
        self.0.upgrade().map(|inner| EngineResource { inner })
    }

    pub fn is_dead(&self) -> bool {
        self.0.strong_count() == 0
    }

    pub fn points_to(&self, resource: &EngineResource<R>) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&resource.inner))
    }
}
