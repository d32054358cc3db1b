//! Controllers for the multi-VPC resources
//!
//! One kube-rs `Controller` per owned resource kind plus the gateway
//! availability watcher. They share nothing but the API server and the
//! capabilities in [`ControllerState`].

mod connection;
pub mod connection_store;
mod context;
pub mod dns_bridge;
pub mod executor;
mod finalizers;
pub mod gateway_watcher;
pub mod locator;
#[cfg(feature = "metrics")]
pub mod metrics;
#[cfg(test)]
mod test_fixtures;
pub mod tunnel;
pub mod tunnel_strategy;
mod vpc_dns;

pub use connection::{
    run_connection_controller, ConnectionOps, ConnectionReconciler, ConnectionStatusWriter,
};
pub use context::ControllerState;
pub use finalizers::{CONNECTION_FINALIZER, DNS_FINALIZER, TUNNEL_FINALIZER};
pub use gateway_watcher::run_gateway_watcher;
pub use tunnel::run_tunnel_controller;
pub use vpc_dns::{next_probe_in, run_dns_controller, DnsStatusWriter, VpcDnsOps};
