use std::fmt;
use std::sync::Mutex;

use super::lock;

/// An object that can be handed out again by a [`Pool`].
pub trait Poolable {
    /// Clears all per-use state, leaving allocations in place.
    fn reset(&mut self);
}

/// A bounded free list of reusable objects.
///
/// Objects are created with the pool's factory when the free list is empty and are
/// [reset](Poolable::reset) when they are returned. At most `max_size` idle objects are kept,
/// anything beyond that is dropped.
pub struct Pool<T> {
    items: Mutex<Vec<T>>,
    max_size: usize,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: Poolable> Pool<T> {
    pub fn new(max_size: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            max_size,
            factory: Box::new(factory),
        }
    }

    /// Takes an idle object from the pool, or creates a new one.
    pub fn acquire(&self) -> T {
        let item = lock(&self.items).pop();
        item.unwrap_or_else(|| (self.factory)())
    }

    /// Resets `item` and returns it to the pool.
    pub fn release(&self, mut item: T) {
        item.reset();
        let mut items = lock(&self.items);
        if items.len() < self.max_size {
            items.push(item);
        }
    }

    /// The number of idle objects.
    pub fn idle(&self) -> usize {
        lock(&self.items).len()
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}
