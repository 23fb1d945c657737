use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── Request-driven ──────────────────────────────────────────────

/// Counter: booking attempts. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "docket_bookings_total";

/// Counter: committed lifecycle transitions. Labels: action.
pub const TRANSITIONS_TOTAL: &str = "docket_transitions_total";

/// Histogram: time spent waiting for a provider lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "docket_lock_wait_seconds";

/// Counter: mutations refused with `Busy`.
pub const LOCK_TIMEOUTS_TOTAL: &str = "docket_lock_timeouts_total";

// ── Background and storage ──────────────────────────────────────

/// Histogram: journal group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "docket_wal_flush_duration_seconds";

/// Histogram: events per journal flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "docket_wal_flush_batch_size";

/// Counter: appointments moved to NO_SHOW by the sweeper.
pub const NO_SHOWS_SWEPT_TOTAL: &str = "docket_no_shows_swept_total";

/// Gauge: providers with state loaded.
pub const PROVIDERS_ACTIVE: &str = "docket_providers_active";

/// Install the Prometheus exporter on `port`. No-op without a port.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://{addr}/metrics");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_prefixed_and_unique() {
        let names = [
            BOOKINGS_TOTAL,
            TRANSITIONS_TOTAL,
            LOCK_WAIT_SECONDS,
            LOCK_TIMEOUTS_TOTAL,
            WAL_FLUSH_DURATION_SECONDS,
            WAL_FLUSH_BATCH_SIZE,
            NO_SHOWS_SWEPT_TOTAL,
            PROVIDERS_ACTIVE,
        ];
        let unique: std::collections::HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
        assert!(names.iter().all(|n| n.starts_with("docket_")));
    }

    #[test]
    fn init_without_port_is_noop() {
        assert!(init(None).is_ok());
    }
}
