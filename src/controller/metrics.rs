//! Prometheus metrics for the multi-VPC operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `multivpc_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `multivpc_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `multivpc_remote_commands_total` (counter): commands executed in gateway pods, by outcome.
//! - `multivpc_gateway_transitions_total` (counter): gateway availability edges by direction.
//! - `multivpc_operations_stamped_total` (counter): operations written by the gateway watcher.
//! - `multivpc_dns_probes_total` (counter): DNS probes by result.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "vpcnattunnel"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, see `Error::kind`
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: String, // "success" or "failed"
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    pub gateway: String,
    pub direction: String, // "up" or "down"
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    pub operation: String,
    pub outcome: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 10ms .. ~5min; DNS probes keep a reconcile busy for the settle interval
        Histogram::new(exponential_buckets(0.01, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static REMOTE_COMMANDS_TOTAL: Lazy<Family<OutcomeLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static GATEWAY_TRANSITIONS_TOTAL: Lazy<Family<TransitionLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static OPERATIONS_STAMPED_TOTAL: Lazy<Family<OperationLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static DNS_PROBES_TOTAL: Lazy<Family<OutcomeLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "multivpc_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "multivpc_reconcile_errors_total",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "multivpc_remote_commands_total",
        "Commands executed inside gateway pods",
        REMOTE_COMMANDS_TOTAL.clone(),
    );
    registry.register(
        "multivpc_gateway_transitions_total",
        "Gateway availability transitions observed by the watcher",
        GATEWAY_TRANSITIONS_TOTAL.clone(),
    );
    registry.register(
        "multivpc_operations_stamped_total",
        "Operations written onto VpcConnections by the gateway watcher",
        OPERATIONS_STAMPED_TOTAL.clone(),
    );
    registry.register(
        "multivpc_dns_probes_total",
        "DNS connectivity probes by result",
        DNS_PROBES_TOTAL.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_remote_command(success: bool) {
    let labels = OutcomeLabels {
        outcome: outcome(success),
    };
    REMOTE_COMMANDS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_gateway_transition(gateway: &str, direction: &str) {
    let labels = TransitionLabels {
        gateway: gateway.to_string(),
        direction: direction.to_string(),
    };
    GATEWAY_TRANSITIONS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_operation_stamped(operation: &str, success: bool) {
    let labels = OperationLabels {
        operation: operation.to_string(),
        outcome: outcome(success),
    };
    OPERATIONS_STAMPED_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_dns_probe(connected: bool) {
    let labels = OutcomeLabels {
        outcome: if connected { "connected" } else { "disconnected" }.to_string(),
    };
    DNS_PROBES_TOTAL.get_or_create(&labels).inc();
}

fn outcome(success: bool) -> String {
    if success { "success" } else { "failed" }.to_string()
}
