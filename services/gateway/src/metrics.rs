//! Prometheus metrics exposition
//!
//! Installs the recorder behind the `metrics` facade; the pool and queue
//! crates emit their counters through it:
//!
//! - `pool_results_total` (counter): label `outcome`
//! - `pool_failover_total` (counter): label `provider`
//! - `pool_drill_injected_total` (counter): label `scenario`
//! - `pool_egress_drift_total` (counter)

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The handle's `render()` method produces the Prometheus text exposition
/// format suitable for serving on a `/metrics` endpoint.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}
