use std::collections::HashMap;
use std::sync::Arc;

use super::job::EngineJob;
use super::key::EngineKey;
use super::resource::Resource;

/// The registry of running jobs, at most one per key.
///
/// Jobs that may only read from the caches are kept apart, so that they never serve requests
/// that are allowed to hit the sources, and the other way around.
pub(crate) struct Jobs<R: Resource> {
    jobs: HashMap<EngineKey, Arc<EngineJob<R>>>,
    only_cache_jobs: HashMap<EngineKey, Arc<EngineJob<R>>>,
}

impl<R: Resource> Jobs<R> {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            only_cache_jobs: HashMap::new(),
        }
    }

    pub fn get(&self, key: &EngineKey, only_retrieve_from_cache: bool) -> Option<&Arc<EngineJob<R>>> {
        self.map(only_retrieve_from_cache).get(key)
    }

    pub fn put(&mut self, job: Arc<EngineJob<R>>) {
        let key = job.key().clone();
        self.map_mut(job.only_retrieve_from_cache()).insert(key, job);
    }

    /// Removes the entry for `key` if it still refers to `job`.
    pub fn remove_if_current(&mut self, key: &EngineKey, job: &Arc<EngineJob<R>>) -> bool {
        let jobs = self.map_mut(job.only_retrieve_from_cache());
        if jobs.get(key).is_some_and(|current| Arc::ptr_eq(current, job)) {
            jobs.remove(key);
            true
        } else {
            false
        }
    }

    /// Removes and returns every registered job.
    pub fn drain(&mut self) -> Vec<Arc<EngineJob<R>>> {
        let jobs = self.jobs.drain().map(|(_, job)| job);
        let only_cache_jobs = self.only_cache_jobs.drain().map(|(_, job)| job);
        jobs.chain(only_cache_jobs).collect()
    }

    pub fn contains(&self, key: &EngineKey) -> bool {
        self.jobs.contains_key(key) || self.only_cache_jobs.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.jobs.len() + self.only_cache_jobs.len()
    }

    fn map(&self, only_retrieve_from_cache: bool) -> &HashMap<EngineKey, Arc<EngineJob<R>>> {
        if only_retrieve_from_cache {
            &self.only_cache_jobs
        } else {
            &self.jobs
        }
    }

    fn map_mut(
        &mut self,
        only_retrieve_from_cache: bool,
    ) -> &mut HashMap<EngineKey, Arc<EngineJob<R>>> {
        if only_retrieve_from_cache {
            &mut self.only_cache_jobs
        } else {
            &mut self.jobs
        }
    }
}
