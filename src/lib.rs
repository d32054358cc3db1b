//! Multi-VPC operator: cross-VPC tunnels, DNS forwarding and gateway
//! recovery for Kube-OVN clusters.
//!
//! The operator reconciles three resources. `VpcNatTunnel` keeps a GRE or
//! VXLAN tunnel configured inside a VPC NAT gateway pod, `VpcDns` wires the
//! cross-network DNS domain into a VPC's forwarder, and `VpcConnection` runs
//! the connection scripts on the gateway. A separate watcher turns gateway
//! availability changes into `VpcConnection` operations.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::config::OperatorConfig;
pub use crate::error::{Error, Result};
