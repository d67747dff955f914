use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// A container for all Prometheus metric collectors of the simulator.
///
/// Wrapped in an `Arc` and shared across the coordinator, the workers and
/// the metrics endpoint.
pub struct Metrics {
    pub registry: Registry,
    /// Total number of tasks generated by the coordinator.
    pub tasks_created_total: IntCounter,
    /// Total number of tasks awarded to a worker.
    pub tasks_assigned_total: IntCounter,
    /// Total number of tasks confirmed delivered.
    pub tasks_delivered_total: IntCounter,
    /// Total number of tasks that ended in failure (no capacity or no bids).
    pub tasks_failed_total: IntCounter,
    /// Total number of well-formed bids collected across all auctions.
    pub bids_received_total: IntCounter,
    /// Total number of wire messages discarded as malformed.
    pub malformed_messages_total: IntCounter,
    /// Total number of deliveries completed by the whole fleet.
    pub deliveries_completed_total: IntCounter,
    /// Number of workers registered in the directory.
    pub workers_active: IntGauge,
    /// Number of tasks currently live (assigned but not yet confirmed).
    pub tasks_live: IntGauge,
}

impl Metrics {
    /// Creates a new `Metrics` struct, initializing and registering all collectors.
    pub fn new() -> Self {
        // Custom registry so repeated instances never collide on the global one.
        let registry = Registry::new_custom(Some("fleet_sim".into()), None)
            .expect("Failed to create custom metrics registry");

        // A helper macro to create, register, and return a metric collector.
        macro_rules! reg {
            ($metric:expr) => {{
                let collector = $metric;
                registry
                    .register(Box::new(collector.clone()))
                    .expect("Failed to register metric");
                collector
            }};
        }

        Self {
            tasks_created_total: reg!(IntCounter::new(
                "tasks_created_total",
                "Total number of tasks generated"
            )
            .unwrap()),
            tasks_assigned_total: reg!(IntCounter::new(
                "tasks_assigned_total",
                "Total number of tasks awarded to a worker"
            )
            .unwrap()),
            tasks_delivered_total: reg!(IntCounter::new(
                "tasks_delivered_total",
                "Total number of tasks confirmed delivered"
            )
            .unwrap()),
            tasks_failed_total: reg!(IntCounter::new(
                "tasks_failed_total",
                "Total number of tasks that ended in failure"
            )
            .unwrap()),
            bids_received_total: reg!(IntCounter::new(
                "bids_received_total",
                "Total number of well-formed bids collected"
            )
            .unwrap()),
            malformed_messages_total: reg!(IntCounter::new(
                "malformed_messages_total",
                "Total number of wire messages discarded as malformed"
            )
            .unwrap()),
            deliveries_completed_total: reg!(IntCounter::new(
                "deliveries_completed_total",
                "Total number of deliveries completed by the fleet"
            )
            .unwrap()),
            workers_active: reg!(IntGauge::new(
                "workers_active",
                "Number of workers registered in the directory"
            )
            .unwrap()),
            tasks_live: reg!(IntGauge::new(
                "tasks_live",
                "Number of tasks currently assigned and in flight"
            )
            .unwrap()),
            registry,
        }
    }

    /// Creates an `axum::Router` that serves the metrics on the `/metrics` endpoint.
    pub fn router(&self) -> Router {
        let registry = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move {
                    let metric_families = registry.gather();
                    let mut buffer = Vec::new();
                    let encoder = TextEncoder::new();
                    encoder
                        .encode(&metric_families, &mut buffer)
                        .expect("Failed to encode metrics");
                    String::from_utf8(buffer)
                        .expect("Metrics buffer is not valid UTF-8")
                        .into_response()
                }
            }),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
