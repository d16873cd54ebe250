//! Metrics collection and exposition.
//!
//! # Metrics
//! - `xsocksd_connections_total` (counter): accepted connections by worker
//! - `xsocksd_active_connections` (gauge): in-flight connections by worker
//! - `xsocksd_accept_errors_total` (counter): failed accepts by worker
//! - `xsocksd_worker_up` (gauge): 1 while a worker's loop runs
//! - `xsocksd_relay_datagrams_total` (counter): UDP datagrams by direction
//! - `xsocksd_stop_requests_total` (counter): stop requests by kind
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder with a scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_connection_opened(worker: usize) {
    ::metrics::counter!("xsocksd_connections_total", "worker" => worker.to_string()).increment(1);
    ::metrics::gauge!("xsocksd_active_connections", "worker" => worker.to_string()).increment(1.0);
}

pub fn record_connection_closed(worker: usize) {
    ::metrics::gauge!("xsocksd_active_connections", "worker" => worker.to_string()).decrement(1.0);
}

pub fn record_accept_error(worker: usize) {
    ::metrics::counter!("xsocksd_accept_errors_total", "worker" => worker.to_string()).increment(1);
}

pub fn record_worker_up(worker: usize, up: bool) {
    let value = if up { 1.0 } else { 0.0 };
    ::metrics::gauge!("xsocksd_worker_up", "worker" => worker.to_string()).set(value);
}

pub fn record_relay_datagram(direction: &'static str) {
    ::metrics::counter!("xsocksd_relay_datagrams_total", "direction" => direction).increment(1);
}

pub fn record_stop_request(kind: &'static str) {
    ::metrics::counter!("xsocksd_stop_requests_total", "kind" => kind).increment(1);
}
