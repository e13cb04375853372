use std::sync::atomic::{AtomicU64, Ordering};

use super::error::LoadError;
use super::resource::{EngineResource, Resource};
use crate::pipeline::DataSource;

/// Receives the outcome of a load.
///
/// Exactly one of the methods is called, once, unless the load is cancelled before it
/// completes, in which case neither is.
pub trait ResourceCallback<R: Resource>: Send + Sync {
    /// The resource is ready.
    ///
    /// The resource has been acquired on behalf of the callback and has to be
    /// [released](crate::engine::Engine::release) once it is no longer used.
    fn on_resource_ready(&self, resource: EngineResource<R>, data_source: DataSource);

    fn on_load_failed(&self, error: LoadError);
}

/// Decides where [`ResourceCallback`]s run.
pub trait CallbackExecutor: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs callbacks inline, on whatever thread completes the load.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectExecutor;

impl CallbackExecutor for DirectExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        task()
    }
}

impl CallbackExecutor for tokio::runtime::Handle {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        self.spawn(async move { task() });
    }
}

/// Identifies a registered callback.
///
/// Ids are unique for the lifetime of the process, so they never match a callback of a later
/// job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

impl CallbackId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let ids: Vec<_> = (0..100).map(|_| CallbackId::next()).collect();
        for (i, id) in ids.iter().enumerate() {
            assert!(!ids[i + 1..].contains(id));
        }
    }

    #[test]
    fn test_direct_executor_runs_inline() {
        let ran = Arc::new(AtomicBool::new(false));
        DirectExecutor.execute(Box::new({
            let ran = ran.clone();
            move || ran.store(true, Ordering::Relaxed)
        }));
        assert!(ran.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_handle_executor_spawns() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::runtime::Handle::current().execute(Box::new(move || {
            tx.send(()).ok();
        }));
        rx.await.unwrap();
    }
}
