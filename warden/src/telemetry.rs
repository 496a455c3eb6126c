use crate::config::{LoggingConfig, MetricsConfig};
use crate::errors::WardenError;
use metrics_exporter_statsd::StatsdBuilder;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const METRICS_PREFIX: &str = "warden";

/// Keeps the sentry client alive. Events are flushed when it is dropped.
pub struct TelemetryGuard {
    _sentry: Option<sentry::ClientInitGuard>,
}

pub fn init(
    metrics: Option<&MetricsConfig>,
    logging: Option<&LoggingConfig>,
) -> Result<TelemetryGuard, WardenError> {
    let dsn = logging
        .and_then(|l| l.sentry_dsn.as_deref())
        .and_then(|dsn| dsn.parse::<sentry::types::Dsn>().ok());

    let sentry = dsn.map(|dsn| {
        sentry::init(sentry::ClientOptions {
            dsn: Some(dsn),
            release: sentry::release_name!(),
            ..Default::default()
        })
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let sentry_layer = sentry
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .try_init()
        .map_err(|e| WardenError::Telemetry(e.to_string()))?;

    if let Some(metrics) = metrics {
        let recorder = StatsdBuilder::from(metrics.statsd_host.clone(), metrics.statsd_port)
            .build(Some(METRICS_PREFIX))
            .map_err(|e| WardenError::Telemetry(e.to_string()))?;
        metrics::set_global_recorder(recorder)
            .map_err(|e| WardenError::Telemetry(e.to_string()))?;
        tracing::info!(
            host = %metrics.statsd_host,
            port = metrics.statsd_port,
            "exporting metrics to statsd"
        );
    }

    Ok(TelemetryGuard { _sentry: sentry })
}
