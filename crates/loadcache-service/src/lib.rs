//! Request-deduplicating, multi-tier resource loading engine.
//!
//! The [`Engine`](engine::Engine) is the entry point: it resolves a request from the set of
//! active resources, the in-memory cache, an already running job, or starts exactly one new
//! job whose [`DecodeJob`](pipeline::DecodeJob) pipeline walks the disk caches and the
//! registered fetchers.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod engine;
pub mod logging;
pub mod pipeline;
pub mod utils;

#[cfg(test)]
#[allow(unused)]
pub mod test;
