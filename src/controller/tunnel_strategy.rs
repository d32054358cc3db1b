//! Command builders for each tunnel encapsulation
//!
//! The strategies only produce shell text. Issuing create once per
//! convergence and delete once per teardown is the reconciler's job.

use tracing::warn;

use crate::crd::{TunnelKind, VpcNatTunnelSpec};

pub trait TunnelStrategy: Send + Sync {
    /// Encapsulation the commands are built for
    fn kind(&self) -> TunnelKind;

    fn create_command(&self, name: &str, spec: &VpcNatTunnelSpec) -> String;

    fn delete_command(&self, name: &str) -> String;
}

pub struct GreStrategy;

impl TunnelStrategy for GreStrategy {
    fn kind(&self) -> TunnelKind {
        TunnelKind::Gre
    }

    fn create_command(&self, name: &str, spec: &VpcNatTunnelSpec) -> String {
        format!(
            "ip tunnel add {name} mode gre remote {remote} local {local} ttl 255; \
             ip link set {name} up; \
             ip addr add {addr} dev {name}",
            remote = spec.remote_ip,
            local = spec.internal_ip,
            addr = spec.interface_addr,
        )
    }

    fn delete_command(&self, name: &str) -> String {
        format!("ip tunnel del {name}")
    }
}

pub struct VxlanStrategy;

/// IANA-assigned VXLAN port
const VXLAN_PORT: u16 = 4789;

impl TunnelStrategy for VxlanStrategy {
    fn kind(&self) -> TunnelKind {
        TunnelKind::Vxlan
    }

    fn create_command(&self, name: &str, spec: &VpcNatTunnelSpec) -> String {
        format!(
            "ip link add {name} type vxlan id {vni} remote {remote} local {local} dstport {port}; \
             ip link set {name} up; \
             ip addr add {addr} dev {name}",
            vni = spec.vni,
            remote = spec.remote_ip,
            local = spec.internal_ip,
            port = VXLAN_PORT,
            addr = spec.interface_addr,
        )
    }

    fn delete_command(&self, name: &str) -> String {
        format!("ip link del {name}")
    }
}

static GRE: GreStrategy = GreStrategy;
static VXLAN: VxlanStrategy = VxlanStrategy;

/// Strategy registry keyed by encapsulation
///
/// Unrecognized kinds get the GRE strategy so a newer manifest never blocks
/// reconciliation.
pub fn strategy_for(kind: TunnelKind) -> &'static dyn TunnelStrategy {
    match kind {
        TunnelKind::Gre => &GRE,
        TunnelKind::Vxlan => &VXLAN,
        TunnelKind::Unrecognized => {
            warn!("Unrecognized tunnel type, falling back to gre");
            &GRE
        }
    }
}
