//! Gateway pod discovery
//!
//! A Kube-OVN NAT gateway is a single-replica StatefulSet. Its pods carry the
//! labels `app=vpc-nat-gw-<gateway>` and `ovn.kubernetes.io/vpc-nat-gw=true`,
//! which is how a logical gateway name is mapped to the pod to exec into.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::config::{OperatorConfig, GATEWAY_LABEL};
use crate::error::{Error, Result};

/// Name and namespace of a located pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
}

impl PodRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Finds the single running pod backing a gateway
///
/// `Ambiguous` and `NotReady` are expected during rollouts; callers requeue
/// after the configured pod back-off.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GatewayLocator: Send + Sync {
    async fn locate(&self, gateway: &str) -> Result<PodRef>;
}

pub struct KubeGatewayLocator {
    client: Client,
    namespace: String,
}

impl KubeGatewayLocator {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

/// Label selector matching the pods of `gateway`
pub fn gateway_pod_selector(gateway: &str) -> String {
    format!(
        "app={},{}=true",
        OperatorConfig::gateway_workload_name(gateway),
        GATEWAY_LABEL
    )
}

#[async_trait]
impl GatewayLocator for KubeGatewayLocator {
    async fn locate(&self, gateway: &str) -> Result<PodRef> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let selector = gateway_pod_selector(gateway);
        let list = pods.list(&ListParams::default().labels(&selector)).await?;
        debug!(
            "Found {} pod(s) for gateway {} ({})",
            list.items.len(),
            gateway,
            selector
        );
        select_gateway_pod(gateway, &list.items)
    }
}

/// Pick the pod to exec into out of the candidates listed for `gateway`
pub fn select_gateway_pod(gateway: &str, pods: &[Pod]) -> Result<PodRef> {
    let pod = match pods {
        [] => return Err(Error::not_found("gateway pod", gateway)),
        [pod] => pod,
        _ => {
            return Err(Error::Ambiguous {
                gateway: gateway.to_string(),
                count: pods.len(),
            })
        }
    };

    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    if phase != "Running" {
        return Err(Error::NotReady {
            pod: pod.name_any(),
            phase,
        });
    }

    Ok(PodRef::new(
        pod.name_any(),
        pod.namespace().unwrap_or_default(),
    ))
}
