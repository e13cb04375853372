use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};

use super::key::EngineKey;
use super::resource::{EngineResource, ReclaimedResource, Resource, WeakResource};

/// Resources that are currently handed out to at least one consumer.
///
/// Only weak references are kept, consumers own the resources. Resources dropped without being
/// released report back through the reclamation channel, which is drained by
/// [`drain_reclaimed`](Self::drain_reclaimed).
///
/// This is not synchronized by itself and is only ever used under the engine's lock.
pub(crate) struct ActiveResources<R: Resource> {
    retention_allowed: bool,
    entries: HashMap<EngineKey, WeakResource<R>>,
    reclaim_tx: Sender<ReclaimedResource<R>>,
    reclaim_rx: Receiver<ReclaimedResource<R>>,
}

impl<R: Resource> ActiveResources<R> {
    pub fn new(retention_allowed: bool) -> Self {
        let (reclaim_tx, reclaim_rx) = mpsc::channel();
        Self {
            retention_allowed,
            entries: HashMap::new(),
            reclaim_tx,
            reclaim_rx,
        }
    }

    /// The sender given to every resource so it can report being dropped while acquired.
    pub fn reclaim_sender(&self) -> Sender<ReclaimedResource<R>> {
        self.reclaim_tx.clone()
    }

    /// Tracks `resource`, replacing whatever was tracked for its key before.
    pub fn activate(&mut self, resource: &EngineResource<R>) {
        self.entries
            .insert(resource.key().clone(), resource.downgrade());
    }

    /// Stops tracking `resource`, unless its key has since been taken over by another resource.
    ///
    /// Returns whether `resource` was the tracked one.
    pub fn deactivate_if_current(&mut self, resource: &EngineResource<R>) -> bool {
        match self.entries.get(resource.key()) {
            Some(weak) if weak.points_to(resource) => {
                self.entries.remove(resource.key());
                true
            }
            _ => false,
        }
    }

    /// Returns the live resource tracked for `key`.
    pub fn get(&mut self, key: &EngineKey) -> Option<EngineResource<R>> {
        let weak = self.entries.get(key)?;
        match weak.upgrade() {
            Some(resource) if !resource.is_recycled() => Some(resource),
            _ => {
                self.entries.remove(key);
                None
            }
        }
    }

    pub fn contains(&self, key: &EngineKey) -> bool {
        self.entries.get(key).is_some_and(|weak| !weak.is_dead())
    }

    pub fn len(&self) -> usize {
        self.entries.values().filter(|weak| !weak.is_dead()).count()
    }

    /// Processes the resources that were dropped while still acquired.
    ///
    /// Their entries are removed. When retention is allowed, the reclaimed payloads are
    /// returned so they can be moved into the memory cache, unless a live resource has already
    /// taken over their key.
    pub fn drain_reclaimed(&mut self) -> Vec<ReclaimedResource<R>> {
        let mut retained = Vec::new();
        while let Ok(reclaimed) = self.reclaim_rx.try_recv() {
            tracing::debug!(key = %reclaimed.key, "Reclaimed a resource that was never released");
            if self.entries.get(&reclaimed.key).is_some_and(WeakResource::is_dead) {
                self.entries.remove(&reclaimed.key);
            }
            if self.retention_allowed && !self.contains(&reclaimed.key) {
                retained.push(reclaimed);
            }
        }
        retained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{LoadRequest, ResourceHooks};

    struct Payload;

    impl Resource for Payload {
        fn size(&self) -> u64 {
            1
        }
    }

    fn resource(active: &ActiveResources<Payload>, model: &str) -> EngineResource<Payload> {
        let key = EngineKey::new(&LoadRequest::new(model));
        let hooks = ResourceHooks {
            reclaim: Some(active.reclaim_sender()),
            ..ResourceHooks::detached()
        };
        EngineResource::new(key, Payload, true, true, hooks)
    }

    #[test]
    fn test_activate_replaces() {
        let mut active = ActiveResources::new(false);
        let first = resource(&active, "a");
        let second = resource(&active, "a");

        active.activate(&first);
        active.activate(&second);
        assert_eq!(active.len(), 1);
        assert!(active.get(first.key()).unwrap().ptr_eq(&second));

        assert!(!active.deactivate_if_current(&first));
        assert!(active.contains(first.key()));
        assert!(active.deactivate_if_current(&second));
        assert!(active.get(first.key()).is_none());
    }

    #[test]
    fn test_dead_entries_are_pruned() {
        let mut active = ActiveResources::new(false);
        let resource = resource(&active, "a");
        let key = resource.key().clone();
        active.activate(&resource);
        drop(resource);

        assert!(!active.contains(&key));
        assert!(active.get(&key).is_none());
        assert_eq!(active.entries.len(), 0);
    }

    #[test]
    fn test_reclaimed_without_retention() {
        let mut active = ActiveResources::new(false);
        let resource = resource(&active, "a");
        resource.acquire().unwrap();
        active.activate(&resource);
        drop(resource);

        assert!(active.drain_reclaimed().is_empty());
        assert_eq!(active.entries.len(), 0);
    }

    #[test]
    fn test_reclaimed_with_retention() {
        let mut active = ActiveResources::new(true);
        let dropped = resource(&active, "a");
        dropped.acquire().unwrap();
        active.activate(&dropped);
        drop(dropped);

        let other = resource(&active, "b");
        other.acquire().unwrap();
        active.activate(&other);
        let replaced = resource(&active, "b");
        active.activate(&replaced);
        drop(other);

        // `b` has a live replacement, only `a` is retained
        let retained = active.drain_reclaimed();
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].key, EngineKey::new(&LoadRequest::new("a")));
        assert!(active.contains(replaced.key()));
    }
}
