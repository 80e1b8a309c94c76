use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing::level_filters::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter,
    filter::Directive,
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// HTTP client and server crates capped at `warn` unless `RUST_LOG` is set.
const QUIET_DEPENDENCIES: [&str; 4] = ["hyper=warn", "hyper_util=warn", "reqwest=warn", "rustls=warn"];

/// Install the global subscriber: `logging.level` (or `RUST_LOG`) filtering,
/// span traces for errors, and compact or JSON lines on stdout.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let from_env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let env_filter = env_filter(logging.level, from_env.as_deref())?;

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| InfraError::telemetry(format!("subscriber already installed: {err}")))
}

fn env_filter(level: LevelFilter, from_env: Option<&str>) -> Result<EnvFilter, InfraError> {
    let builder = EnvFilter::builder().with_default_directive(level.into());
    if let Some(directives) = from_env.filter(|value| !value.trim().is_empty()) {
        return builder
            .parse(directives)
            .map_err(|err| InfraError::telemetry(format!("invalid RUST_LOG `{directives}`: {err}")));
    }

    let mut filter = builder.parse_lossy("");
    for directive in QUIET_DEPENDENCIES {
        let directive = directive
            .parse::<Directive>()
            .map_err(|err| InfraError::telemetry(format!("invalid directive `{directive}`: {err}")))?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "qrverse_cache_hit_total",
            Unit::Count,
            "Daily cache lookups answered from a live entry."
        );
        describe_counter!(
            "qrverse_cache_miss_total",
            Unit::Count,
            "Daily cache lookups that had to compute the slot."
        );
        describe_counter!(
            "qrverse_cache_evict_total",
            Unit::Count,
            "Visitor entries (marker and verse together) evicted to stay within max_entries."
        );
        describe_counter!(
            "qrverse_cache_bypass_total",
            Unit::Count,
            "Requests served without the daily cache because no identity was resolved."
        );
        describe_histogram!(
            "qrverse_generation_ms",
            Unit::Milliseconds,
            "Verse generation latency in milliseconds."
        );
        describe_counter!(
            "qrverse_generation_failed_total",
            Unit::Count,
            "Verse generations that ended in an error."
        );
    });
}
