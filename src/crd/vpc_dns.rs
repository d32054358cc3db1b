//! VpcDns Custom Resource Definition
//!
//! Requests cross-network DNS for one VPC: names under the cross-network
//! domain resolved from inside the VPC are forwarded to the cluster DNS.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::DnsState;

#[derive(CustomResource, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kubeovn.ustc.io",
    version = "v1",
    kind = "VpcDns",
    plural = "vpcdns",
    namespaced,
    status = "VpcDnsStatus",
    printcolumn = r#"{"name":"Vpc","type":"string","jsonPath":".spec.vpc"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VpcDnsSpec {
    #[serde(default)]
    pub vpc: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VpcDnsStatus {
    #[serde(default)]
    pub initialized: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<DnsState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// RFC 3339 timestamp of the last probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<String>,
}
