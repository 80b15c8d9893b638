//! Tracing setup for the node.
//!
//! Output goes to stderr so stdout stays free for `--version-json`. The
//! configured level applies to the odotrust crates only; dependencies log at
//! `warn` unless a full directive list is given. `ODOTRUST_LOG`, then
//! `RUST_LOG`, replace the configured filter entirely.

use crate::config::LoggingConfig;
use crate::error::{Error, Result};
use std::str::FromStr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CRATES: &[&str] = &[
    "odotrust_core",
    "odotrust_telemetry",
    "odotrust_trust",
    "odotrust_market",
    "odotrust_pipeline",
    "odotrust_node",
];

const DEPENDENCY_LEVEL: &str = "warn";

/// Output encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact single-line text for terminals
    Text,
    /// One flattened JSON object per event, for log shippers
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(Error::Config(format!(
                "logging.format must be text or json, got {}",
                other
            ))),
        }
    }
}

/// Expand a configured level into filter directives.
///
/// A bare level (`debug`) is scoped to the odotrust crates. Anything
/// containing `=` or `,` is taken as a complete directive list.
pub fn directives(level: &str) -> String {
    let level = level.trim();
    if level.contains('=') || level.contains(',') {
        return level.to_string();
    }
    let level = if level.is_empty() { "info" } else { level };

    let mut out = String::from(DEPENDENCY_LEVEL);
    for krate in CRATES {
        out.push(',');
        out.push_str(krate);
        out.push('=');
        out.push_str(level);
    }
    out
}

fn filter(level: &str) -> Result<EnvFilter> {
    for var in ["ODOTRUST_LOG", "RUST_LOG"] {
        if let Ok(filter) = EnvFilter::try_from_env(var) {
            return Ok(filter);
        }
    }
    EnvFilter::try_new(directives(level))
        .map_err(|e| Error::Config(format!("logging.level {:?}: {}", level, e)))
}

/// Install the global subscriber described by `config`.
///
/// Fails on an unknown format, an unparsable level, or when a subscriber
/// is already installed.
pub fn init(config: &LoggingConfig) -> Result<LogFormat> {
    let format: LogFormat = config.format.parse()?;
    let registry = tracing_subscriber::registry().with(filter(&config.level)?);

    let installed = match format {
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_names(true),
            )
            .try_init(),
    };
    installed.map_err(|e| Error::Config(format!("installing log subscriber: {}", e)))?;
    Ok(format)
}
