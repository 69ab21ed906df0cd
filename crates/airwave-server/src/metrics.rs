//! Metrics collection and export for Airwave.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use airwave_core::EventBus;
use airwave_transport::Broadcaster;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "airwave_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "airwave_connections_active";
    pub const FRAMES_INBOUND: &str = "airwave_frames_inbound_total";
    pub const FRAMES_DELIVERED: &str = "airwave_frames_delivered_total";
    pub const FRAMES_STALE: &str = "airwave_frames_stale_total";
    pub const SLOW_CONSUMERS: &str = "airwave_slow_consumers_total";
    pub const DELIVERY_FAILURES: &str = "airwave_delivery_failures_total";
    pub const EVENTS_PUBLISHED: &str = "airwave_events_published_total";
    pub const HANDLER_FAILURES: &str = "airwave_handler_failures_total";
    pub const HANDLER_TIMEOUTS: &str = "airwave_handler_timeouts_total";
    pub const DISPATCHES_DROPPED: &str = "airwave_dispatches_dropped_total";
    pub const DISPATCHES_IN_FLIGHT: &str = "airwave_dispatches_in_flight";
    pub const COMMANDS_TOTAL: &str = "airwave_commands_total";
    pub const COMMAND_SECONDS: &str = "airwave_command_seconds";
    pub const REACTIONS_TOTAL: &str = "airwave_reactions_total";
    pub const ERRORS_TOTAL: &str = "airwave_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::FRAMES_INBOUND, "Client frames received");
    metrics::describe_counter!(names::FRAMES_DELIVERED, "Frames written to listeners");
    metrics::describe_counter!(
        names::FRAMES_STALE,
        "Frames skipped because the listener already had newer state"
    );
    metrics::describe_counter!(
        names::SLOW_CONSUMERS,
        "Connections dropped because their outbox filled up"
    );
    metrics::describe_counter!(
        names::DELIVERY_FAILURES,
        "Writes that failed or timed out"
    );
    metrics::describe_counter!(names::EVENTS_PUBLISHED, "Events published on the bus");
    metrics::describe_counter!(
        names::HANDLER_FAILURES,
        "Event handlers that failed or panicked"
    );
    metrics::describe_counter!(
        names::HANDLER_TIMEOUTS,
        "Event handlers that overran their deadline"
    );
    metrics::describe_counter!(
        names::DISPATCHES_DROPPED,
        "Handler invocations dropped because the bus was saturated"
    );
    metrics::describe_gauge!(names::DISPATCHES_IN_FLIGHT, "Handler invocations not yet finished");
    metrics::describe_counter!(names::COMMANDS_TOTAL, "Playback commands by outcome");
    metrics::describe_histogram!(names::COMMAND_SECONDS, "Playback command latency in seconds");
    metrics::describe_counter!(names::REACTIONS_TOTAL, "Reactions accepted");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

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

/// Record a client frame.
pub fn record_inbound(frame_type: &'static str) {
    counter!(names::FRAMES_INBOUND, "type" => frame_type).increment(1);
}

/// Record a playback command and how long it took.
pub fn record_command(command: &'static str, ok: bool, seconds: f64) {
    let outcome = if ok { "ok" } else { "error" };
    counter!(names::COMMANDS_TOTAL, "command" => command, "outcome" => outcome).increment(1);
    histogram!(names::COMMAND_SECONDS, "command" => command).record(seconds);
}

/// Record an accepted reaction.
pub fn record_reaction(emote: &'static str) {
    counter!(names::REACTIONS_TOTAL, "emote" => emote).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Copy bus and fan-out counters into the registry.
pub fn sample(bus: &EventBus, broadcaster: &Broadcaster) {
    let bus = bus.stats();
    counter!(names::EVENTS_PUBLISHED).absolute(bus.published);
    counter!(names::HANDLER_FAILURES).absolute(bus.failed);
    counter!(names::HANDLER_TIMEOUTS).absolute(bus.timed_out);
    counter!(names::DISPATCHES_DROPPED).absolute(bus.dropped);
    gauge!(names::DISPATCHES_IN_FLIGHT).set(bus.in_flight as f64);

    let fanout = broadcaster.stats();
    counter!(names::FRAMES_DELIVERED).absolute(fanout.delivered);
    counter!(names::FRAMES_STALE).absolute(fanout.stale);
    counter!(names::SLOW_CONSUMERS).absolute(fanout.slow_consumers);
    counter!(names::DELIVERY_FAILURES).absolute(fanout.failed);
}

/// Sample bus and fan-out counters every `interval` until `shutdown`.
pub fn spawn_reporter(
    bus: Arc<EventBus>,
    broadcaster: Broadcaster,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => sample(&bus, &broadcaster),
            }
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
