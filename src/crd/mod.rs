//! Custom Resource Definitions for the multi-VPC operator
//!
//! Owned resources live in the `kubeovn.ustc.io` group. The Kube-OVN
//! resources the operator only reads are in [`kubeovn`].

pub mod kubeovn;
pub mod types;
mod vpc_connection;
mod vpc_dns;
mod vpc_nat_tunnel;


pub use types::*;
pub use vpc_connection::{VpcConnection, VpcConnectionSpec, VpcConnectionStatus};
pub use vpc_dns::{VpcDns, VpcDnsSpec, VpcDnsStatus};
pub use vpc_nat_tunnel::{VpcNatTunnel, VpcNatTunnelSpec, VpcNatTunnelStatus};
