//! Metrics collection and export for roomcast.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use async_trait::async_trait;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use roomcast_core::HubHandle;
use roomcast_transport::{FrameReader, FrameWriter, Incoming, Outgoing, TransportError};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "roomcast_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "roomcast_connections_active";
    pub const FRAMES_TOTAL: &str = "roomcast_frames_total";
    pub const FRAMES_BYTES: &str = "roomcast_frames_bytes";
    pub const ROOMS_ACTIVE: &str = "roomcast_rooms_active";
    pub const CLIENTS_ACTIVE: &str = "roomcast_clients_active";
    pub const EVICTIONS_TOTAL: &str = "roomcast_evictions_total";
    pub const AUTH_FAILURES_TOTAL: &str = "roomcast_auth_failures_total";
    pub const ERRORS_TOTAL: &str = "roomcast_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of envelope frames");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of envelope frames");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of rooms");
    metrics::describe_gauge!(names::CLIENTS_ACTIVE, "Current number of registered clients");
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Clients dropped for overflowing their outbound queue"
    );
    metrics::describe_counter!(names::AUTH_FAILURES_TOTAL, "Rejected upgrade requests");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an envelope frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a rejected upgrade.
pub fn record_auth_failure() {
    counter!(names::AUTH_FAILURES_TOTAL).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Periodically copy hub statistics into gauges.
pub fn spawn_stats_sampler(hub: HubHandle, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let Ok(stats) = hub.stats().await else {
                debug!("Hub stopped, ending stats sampler");
                break;
            };
            gauge!(names::ROOMS_ACTIVE).set(stats.rooms as f64);
            gauge!(names::CLIENTS_ACTIVE).set(stats.clients as f64);
            counter!(names::EVICTIONS_TOTAL).absolute(stats.evictions);
        }
    })
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

/// Counts frames passing through a connection half.
pub struct Metered<T>(pub T);

#[async_trait]
impl<R: FrameReader> FrameReader for Metered<R> {
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError> {
        match self.0.recv().await {
            Ok(frame) => {
                if let Some(Incoming::Text(_) | Incoming::Binary(_)) = &frame {
                    record_frame(frame.as_ref().map_or(0, Incoming::len), "inbound");
                }
                Ok(frame)
            }
            Err(e) => {
                record_error(match e {
                    TransportError::FrameTooLarge { .. } => "frame_too_large",
                    _ => "transport",
                });
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<W: FrameWriter> FrameWriter for Metered<W> {
    async fn send(&mut self, frame: Outgoing) -> Result<(), TransportError> {
        let size = match &frame {
            Outgoing::Envelope(envelope) => Some(envelope.len()),
            _ => None,
        };
        self.0.send(frame).await?;
        if let Some(size) = size {
            record_frame(size, "outbound");
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.0.close().await
    }

    fn is_open(&self) -> bool {
        self.0.is_open()
    }
}
