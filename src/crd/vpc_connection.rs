//! VpcConnection Custom Resource Definition
//!
//! A request to establish, recover or stop connectivity between two VPCs
//! through a NAT gateway, together with the state the operator observed.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ConnectionOperation, ConnectionState};

#[derive(CustomResource, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kubeovn.ustc.io",
    version = "v1",
    kind = "VpcConnection",
    namespaced,
    status = "VpcConnectionStatus",
    shortname = "vc",
    printcolumn = r#"{"name":"Vpc","type":"string","jsonPath":".spec.vpc"}"#,
    printcolumn = r#"{"name":"Gateway","type":"string","jsonPath":".spec.gateway"}"#,
    printcolumn = r#"{"name":"Operation","type":"string","jsonPath":".spec.operation"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VpcConnectionSpec {
    /// Target VPC
    #[serde(default)]
    pub vpc: String,

    /// NAT gateway carrying the connection
    #[serde(default)]
    pub gateway: String,

    #[serde(rename = "cidr", default, skip_serializing_if = "Option::is_none")]
    pub subnet_cidr: Option<String>,

    #[serde(rename = "ip", default, skip_serializing_if = "Option::is_none")]
    pub subnet_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<ConnectionOperation>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VpcConnectionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ConnectionState>,

    /// Generation whose operation has been carried out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl VpcConnection {
    pub fn state(&self) -> Option<ConnectionState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    /// True when the current operation has already been carried out
    pub fn operation_consumed(&self) -> bool {
        let observed = self.status.as_ref().and_then(|s| s.observed_generation);
        observed.is_some() && observed == self.metadata.generation
    }
}
