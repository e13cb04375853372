use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use loadcache_service::config::Config;
use loadcache_service::engine::{Engine, LoadRequest};
use loadcache_service::pipeline::DataSource;
use loadcache_test::{TestDecoder, TestResource};

use crate::workloads::{FetchStats, SyntheticLoader, WorkloadsConfig, process_load};

/// The outcome of running one workload.
#[derive(Default)]
struct Report {
    durations: DDSketch,
    failures: usize,
    from_memory: usize,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // every workload gets its own loader and key space
    let mut builder = Engine::<TestResource>::builder(&config, TestDecoder::new());
    let mut prepared = Vec::with_capacity(workloads.workloads.len());
    for (i, workload) in workloads.workloads.into_iter().enumerate() {
        let prefix = format!("workload-{i}/");
        let stats = Arc::new(FetchStats::default());
        builder = builder.model_loader(SyntheticLoader::new(
            prefix.clone(),
            &workload,
            Arc::clone(&stats),
        ));
        prepared.push((workload, prefix, stats));
    }
    let engine = builder.build().context("failed to start engine")?;

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(prepared.len());
    for (workload, prefix, stats) in prepared {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let engine = engine.clone();
        let concurrency = workload.concurrency.max(1);
        let keys = workload.keys.max(1);

        let task = tokio::spawn(async move {
            let report = Arc::new(Mutex::new(Report::default()));
            let loads = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let engine = engine.clone();
                        let report = Arc::clone(&report);
                        let loads = Arc::clone(&loads);
                        let mut request =
                            LoadRequest::new(format!("{prefix}{}", rand::random_range(0..keys)));
                        if let Some(strategy) = workload.disk_cache_strategy {
                            request = request.disk_cache_strategy(strategy);
                        }

                        tokio::spawn(async move {
                            let task_start = Instant::now();
                            let result = process_load(&engine, request).await;
                            loads.fetch_add(1, Ordering::Relaxed);

                            let mut report = report.lock().unwrap();
                            report.durations.add(task_start.elapsed().as_secs_f64());
                            match result {
                                Ok(DataSource::MemoryCache) => report.from_memory += 1,
                                Ok(_) => {}
                                Err(_) => report.failures += 1,
                            }

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let report = std::mem::take(&mut *report.lock().unwrap());
            (concurrency, loads.load(Ordering::Relaxed), stats, report)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, loads, stats, report) = task.context("workload panicked")?;

        let ops_ps = loads as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {loads} loads, {ops_ps:.2} ops/s");

        let fetches = stats.fetches.load(Ordering::Relaxed);
        let fetch_failures = stats.failures.load(Ordering::Relaxed);
        println!(
            "  fetches: {fetches} ({fetch_failures} failed); from memory: {}; failed loads: {}",
            report.from_memory, report.failures
        );

        let durations = &report.durations;
        if loads == 0 {
            continue;
        }
        let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / loads as f64);
        let quantile = |q| {
            let secs = durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    let stats = engine.stats();
    println!();
    println!(
        "Engine: {} active, {} cached ({} bytes), {} jobs",
        stats.active, stats.cached, stats.cache_size, stats.jobs
    );

    engine.shutdown();
    Ok(())
}
