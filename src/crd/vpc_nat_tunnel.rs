//! VpcNatTunnel Custom Resource Definition
//!
//! A point-to-point tunnel terminated inside a Kube-OVN NAT gateway pod.
//! The status mirrors the spec once the tunnel has been configured in the
//! gateway, so any difference between the two is work still to do.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::TunnelKind;

#[derive(CustomResource, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kubeovn.ustc.io",
    version = "v1",
    kind = "VpcNatTunnel",
    namespaced,
    status = "VpcNatTunnelStatus",
    shortname = "vnt",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Gateway","type":"string","jsonPath":".spec.natGwDp"}"#,
    printcolumn = r#"{"name":"Remote","type":"string","jsonPath":".spec.remoteIp"}"#,
    printcolumn = r#"{"name":"Initialized","type":"boolean","jsonPath":".status.initialized"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VpcNatTunnelSpec {
    /// Encapsulation, `gre` when omitted
    #[serde(rename = "type", default)]
    #[schemars(with = "Option<String>")]
    pub kind: TunnelKind,

    /// Address of the local gateway used as the tunnel source
    pub internal_ip: String,

    /// Address of the remote gateway
    pub remote_ip: String,

    /// CIDR assigned to the local end of the tunnel interface
    pub interface_addr: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_interface_addr: Option<String>,

    /// Name of the NAT gateway that owns the tunnel
    pub nat_gw_dp: String,

    /// VXLAN network identifier, ignored for GRE
    #[serde(default = "default_vni")]
    pub vni: u32,
}

fn default_vni() -> u32 {
    1
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VpcNatTunnelStatus {
    #[serde(default)]
    pub initialized: bool,

    /// Parameters the gateway is currently configured with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied: Option<VpcNatTunnelSpec>,
}

impl VpcNatTunnel {
    pub fn is_initialized(&self) -> bool {
        self.status.as_ref().map(|s| s.initialized).unwrap_or(false)
    }

    pub fn last_applied(&self) -> Option<&VpcNatTunnelSpec> {
        self.status.as_ref().and_then(|s| s.last_applied.as_ref())
    }
}
