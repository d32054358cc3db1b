//! Shared enums for the multi-VPC resources
//!
//! Every field that drives behaviour is a closed enum so that dispatch on it
//! is an exhaustive match.
//!
//! - [`TunnelKind`] - encapsulation used by a [`super::VpcNatTunnel`]
//! - [`ConnectionOperation`] - desired operation of a [`super::VpcConnection`]
//! - [`ConnectionState`] - observed state of a [`super::VpcConnection`]
//! - [`DnsState`] - observed state of a [`super::VpcDns`]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Tunnel encapsulation kind
///
/// Values the operator does not know yet deserialize to `Unrecognized` and are
/// handled by the default strategy instead of failing the reconcile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    /// Generic Routing Encapsulation (`ip tunnel ... mode gre`)
    #[default]
    Gre,
    /// VXLAN over UDP 4789
    Vxlan,
    #[serde(other)]
    Unrecognized,
}

impl std::fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelKind::Gre => write!(f, "gre"),
            TunnelKind::Vxlan => write!(f, "vxlan"),
            TunnelKind::Unrecognized => write!(f, "unrecognized"),
        }
    }
}

/// Operation requested on a VpcConnection
///
/// Written by users (`DnsConnectionCreate`, `VpcConnectionCreate`) and by the
/// gateway watcher (`Recovery`, `Stop`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConnectionOperation {
    #[serde(rename = "DnsConnectionCreate")]
    DnsConnect,
    #[serde(rename = "VpcConnectionCreate")]
    VpcConnect,
    #[serde(rename = "Recovery")]
    Recover,
    Stop,
}

impl std::fmt::Display for ConnectionOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionOperation::DnsConnect => write!(f, "DnsConnectionCreate"),
            ConnectionOperation::VpcConnect => write!(f, "VpcConnectionCreate"),
            ConnectionOperation::Recover => write!(f, "Recovery"),
            ConnectionOperation::Stop => write!(f, "Stop"),
        }
    }
}

/// Observed state of a VpcConnection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConnectionState {
    #[serde(rename = "DNSConnectionRunning")]
    DnsRunning,
    #[serde(rename = "VpcConnectionRunning")]
    VpcRunning,
    Stopped,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::DnsRunning => write!(f, "DNSConnectionRunning"),
            ConnectionState::VpcRunning => write!(f, "VpcConnectionRunning"),
            ConnectionState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Observed state of cross-network DNS for one VPC
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum DnsState {
    DnsRunning,
    DnsStopped,
}

impl std::fmt::Display for DnsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsState::DnsRunning => write!(f, "DnsRunning"),
            DnsState::DnsStopped => write!(f, "DnsStopped"),
        }
    }
}
