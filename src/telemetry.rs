use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use thiserror::Error;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Debug, Error)]
#[error("telemetry initialization failed: {0}")]
pub struct TelemetryError(String);

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| TelemetryError(format!("failed to install tracing subscriber: {err}")))
}

/// Register descriptions for every metric the cache emits. Safe to call
/// repeatedly.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "optimist_cache_hit_total",
            Unit::Count,
            "Reads served from a fresh cached value."
        );
        describe_counter!(
            "optimist_cache_miss_total",
            Unit::Count,
            "Reads that started a new fetch."
        );
        describe_counter!(
            "optimist_fetch_join_total",
            Unit::Count,
            "Reads that joined a fetch already in flight."
        );
        describe_counter!(
            "optimist_cache_evict_total",
            Unit::Count,
            "Entries evicted because the store exceeded its capacity."
        );
        describe_counter!(
            "optimist_mutation_total",
            Unit::Count,
            "Settled mutations, labelled by outcome."
        );
        describe_histogram!(
            "optimist_mutation_ms",
            Unit::Milliseconds,
            "Time from optimistic write to settlement in milliseconds."
        );
        describe_counter!(
            "optimist_rollback_total",
            Unit::Count,
            "Snapshot entries handled during rollback, labelled by result."
        );
        describe_counter!(
            "optimist_refresh_failed_total",
            Unit::Count,
            "Background refreshes after invalidation that failed."
        );
    });
}
