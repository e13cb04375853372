use std::env;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::Registry;

use crate::config::{LogFormat, Logging};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// The default filter directives for a configured level.
///
/// Verbose levels only apply to the engine's own crates, dependencies stay at `INFO`.
fn default_directives(level: LevelFilter) -> String {
    let verbose = match level {
        LevelFilter::OFF => return String::new(),
        LevelFilter::ERROR => return "ERROR".into(),
        LevelFilter::WARN => return "WARN".into(),
        LevelFilter::INFO => return "INFO".into(),
        LevelFilter::DEBUG => "DEBUG",
        _ => "TRACE",
    };
    format!("INFO,loadcache_service={verbose},loadcache_stress={verbose}")
}

fn format_layer(format: LogFormat) -> BoxedLayer {
    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);

    match (format, console::user_attended()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => layer.pretty().boxed(),
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            layer.compact().with_ansi(false).boxed()
        }
        (LogFormat::Json, _) => layer
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    }
}

/// Initializes the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Events at `ERROR` are additionally
/// reported to sentry.
pub fn init_logging(config: &Logging) {
    let directives = env::var("RUST_LOG").unwrap_or_else(|_| default_directives(config.level));

    tracing_subscriber::registry()
        .with(format_layer(config.format).with_filter(EnvFilter::new(directives)))
        .with(sentry::integrations::tracing::layer())
        .init();
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current()
    {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}
