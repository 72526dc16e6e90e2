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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "soffio_memo_hit_total",
            Unit::Count,
            "Total number of memoized calls served without running the generator, by tier."
        );
        describe_counter!(
            "soffio_memo_miss_total",
            Unit::Count,
            "Total number of persistent store lookups that found no entry."
        );
        describe_counter!(
            "soffio_memo_compute_total",
            Unit::Count,
            "Total number of generator invocations."
        );
        describe_histogram!(
            "soffio_memo_compute_ms",
            Unit::Milliseconds,
            "Generator latency in milliseconds."
        );
        describe_counter!(
            "soffio_memo_store_error_total",
            Unit::Count,
            "Total number of absorbed store failures, by operation."
        );
        describe_counter!(
            "soffio_memo_cleanup_deleted_total",
            Unit::Count,
            "Total number of entries removed by namespace cleanup."
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describing_metrics_twice_is_harmless() {
        describe_metrics();
        describe_metrics();
        assert!(METRIC_DESCRIPTIONS.is_completed());
    }
}
