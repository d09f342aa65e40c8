use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
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
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "pagecache_hit_total",
            Unit::Count,
            "Total number of requests served from the page cache."
        );
        describe_counter!(
            "pagecache_miss_total",
            Unit::Count,
            "Total number of eligible requests not found in the page cache."
        );
        describe_counter!(
            "pagecache_store_total",
            Unit::Count,
            "Total number of responses written to the page cache."
        );
        describe_counter!(
            "pagecache_bypass_total",
            Unit::Count,
            "Total number of requests passed through uncached, by reason."
        );
        describe_counter!(
            "pagecache_clean_total",
            Unit::Count,
            "Total number of completed cache cleans, by scope."
        );
        describe_counter!(
            "pagecache_node_failure_total",
            Unit::Count,
            "Total number of unreachable distributed cache node reports."
        );
        describe_histogram!(
            "pagecache_clean_ms",
            Unit::Milliseconds,
            "Cache clean latency in milliseconds."
        );
    });
}
