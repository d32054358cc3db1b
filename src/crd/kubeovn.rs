//! Kube-OVN resources read by the operator
//!
//! Only the fields the operator consumes are modelled. These CRDs are owned
//! and installed by Kube-OVN, so they are never emitted by `crdgen`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// DNS forwarder deployed for a VPC (`vpc-dns-<name>` Deployment)
///
/// Kube-OVN elects at most one active forwarder per VPC.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kubeovn.io",
    version = "v1",
    kind = "VpcDns",
    plural = "vpc-dnses",
    status = "VpcDnsStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VpcDnsSpec {
    #[serde(default)]
    pub vpc: String,
    #[serde(default)]
    pub subnet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VpcDnsStatus {
    #[serde(default)]
    pub active: bool,
}

impl VpcDns {
    pub fn is_active(&self) -> bool {
        self.status.as_ref().map(|s| s.active).unwrap_or(false)
    }
}

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(group = "kubeovn.io", version = "v1", kind = "Subnet")]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    #[serde(default)]
    pub vpc: String,
    #[serde(default)]
    pub cidr_block: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub namespaces: Vec<String>,
}

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(group = "kubeovn.io", version = "v1", kind = "VpcNatGateway", plural = "vpc-nat-gateways")]
#[serde(rename_all = "camelCase")]
pub struct VpcNatGatewaySpec {
    #[serde(default)]
    pub vpc: String,
    #[serde(default)]
    pub subnet: String,
    #[serde(default)]
    pub lan_ip: String,
}
