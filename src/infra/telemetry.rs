use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};
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

/// Register descriptions for every metric the proxy emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "precache_hit_total",
            Unit::Count,
            "Real requests served from a primed response."
        );
        describe_counter!(
            "precache_miss_total",
            Unit::Count,
            "Real requests forwarded because nothing was primed."
        );
        describe_counter!(
            "precache_prime_accepted_total",
            Unit::Count,
            "Priming requests queued."
        );
        describe_counter!(
            "precache_prime_duplicate_total",
            Unit::Count,
            "Priming requests ignored because the key was already primed."
        );
        describe_counter!(
            "precache_prime_failed_total",
            Unit::Count,
            "Priming jobs that failed or returned a non-success status."
        );
        describe_counter!(
            "precache_store_error_total",
            Unit::Count,
            "Response store operations that failed and degraded to a miss."
        );
        describe_gauge!(
            "precache_queue_pending",
            Unit::Count,
            "Priming jobs currently running under the concurrency limit."
        );
        describe_gauge!(
            "precache_queue_size",
            Unit::Count,
            "Priming jobs waiting for a slot."
        );
        describe_counter!(
            "precache_token_revoked_total",
            Unit::Count,
            "Cancellation token revocations."
        );
    });
}
