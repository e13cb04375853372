//! Statsd metrics for the engine.
//!
//! Nothing is reported until [`configure_statsd`] has been called. Use the [`metric!`] macro to
//! emit metrics, every metric automatically carries the configured custom tags.
use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use cadence::{BufferedUdpMetricSink, Metric, MetricBuilder, QueuingMetricSink, StatsdClient};

use crate::config::Metrics;

static METRICS_CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// The metrics prelude that is necessary to use the client.
pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client that adds a fixed set of tags to every metric.
#[derive(Debug)]
pub struct MetricsClient {
    statsd_client: StatsdClient,
    tags: BTreeMap<String, String>,
}

impl MetricsClient {
    pub fn statsd(&self) -> &StatsdClient {
        &self.statsd_client
    }

    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        for (tag, value) in &self.tags {
            metric = metric.with_tag(tag, value);
        }
        metric.send()
    }
}

/// Starts reporting to the statsd server configured in `config`.
///
/// Does nothing if no server is configured. Metrics are buffered and sent from a background
/// thread, so emitting them never blocks a pipeline. Only the first call has an effect.
pub fn configure_statsd(config: &Metrics) -> io::Result<()> {
    let Some(host) = &config.statsd else {
        return Ok(());
    };
    let addr = host
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::other(format!("`{host}` does not resolve")))?;

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = BufferedUdpMetricSink::from(addr, socket).map_err(io::Error::other)?;
    let sink = QueuingMetricSink::from(sink);

    let client = MetricsClient {
        statsd_client: StatsdClient::from_sink(&config.prefix, sink),
        tags: config.custom_tags.clone(),
    };
    if METRICS_CLIENT.set(client).is_err() {
        tracing::warn!("statsd client was already configured");
    } else {
        tracing::info!(%addr, prefix = %config.prefix, "Reporting metrics to statsd");
    }
    Ok(())
}

/// Invoke a callback with the current statsd client.
///
/// If statsd is not configured the callback is not invoked. For the most part
/// the [`metric!`](crate::metric) macro should be used instead.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    match METRICS_CLIENT.get() {
        Some(client) => f(client),
        None => Default::default(),
    }
}

/// Emits a metric.
///
/// ```
/// # use loadcache_service::metric;
/// metric!(counter("engine.load") += 1, "tier" => "memory");
/// metric!(gauge("memory_cache.size") = 1024u64);
/// metric!(timer("engine.jobs.duration") = std::time::Duration::from_millis(3));
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.statsd().count_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.statsd().gauge_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.statsd().time_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};
}
