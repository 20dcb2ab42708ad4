//! Tracing setup: stdout formatting plus an optional JSON-lines file.

mod json;

pub use json::{JsonLogCounts, JsonLogLayer, JsonLogWriter, LOG_BUFFER};

use crate::cli::{NodeConfig, DEFAULT_LOG_JSON_FILTER};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

/// Must be kept alive (and finished) for the JSON log to reach disk.
pub struct TracingGuards {
    pub log_writer: Option<Arc<JsonLogWriter>>,
}

impl TracingGuards {
    /// Flushes the JSON log, if one was opened.
    pub fn finish(&self) -> eyre::Result<Option<JsonLogCounts>> {
        self.log_writer.as_ref().map(|writer| writer.finish()).transpose()
    }
}

/// Stdout filter for a `-v` count, used when `RUST_LOG` is unset.
pub fn default_filter_directive(verbosity: u8) -> String {
    let (global, local) = match verbosity {
        0 => ("warn", "info"),
        1 => ("warn", "debug"),
        2 => ("info", "trace"),
        _ => ("debug", "trace"),
    };
    format!("{global},block_puller_node={local}")
}

pub fn init_tracing(config: &NodeConfig) -> TracingGuards {
    let stdout_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter_directive(config.verbosity)));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_filter(stdout_filter);

    let mut open_error = None;
    let log_writer = config.log_json.as_ref().and_then(|path| {
        match JsonLogWriter::new(path, LOG_BUFFER) {
            Ok(writer) => Some(Arc::new(writer)),
            Err(err) => {
                open_error = Some((path.clone(), err));
                None
            }
        }
    });
    let json_filter = EnvFilter::try_new(&config.log_json_filter)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_JSON_FILTER));
    let json_layer = log_writer
        .as_ref()
        .map(|writer| JsonLogLayer::new(Arc::clone(writer)).with_filter(json_filter));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(json_layer)
        .init();

    // Reported only now that a subscriber exists.
    if let Some((path, err)) = open_error {
        warn!(path = %path.display(), error = %err, "failed to open json log file");
    }
    TracingGuards { log_writer }
}
