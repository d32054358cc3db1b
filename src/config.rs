//! Runtime configuration shared by every controller
//!
//! Built once by the operator binary from command-line flags and environment
//! variables, then passed down explicitly.

use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Label carried by every Kube-OVN NAT gateway StatefulSet and pod
pub const GATEWAY_LABEL: &str = "ovn.kubernetes.io/vpc-nat-gw";

/// Prefix Kube-OVN puts in front of a gateway's StatefulSet name
pub const GATEWAY_WORKLOAD_PREFIX: &str = "vpc-nat-gw-";

/// Label correlating a VpcConnection with its gateway
pub const CONNECTION_GATEWAY_LABEL: &str = "gateway";

/// Field manager used for server-side patches
pub const FIELD_MANAGER: &str = "multi-vpc-operator";

#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace holding the NAT gateway StatefulSets and pods
    pub gateway_namespace: String,
    /// Container inside the gateway pod that runs tunnel commands
    pub gateway_container: String,
    /// Namespace of the cluster DNS service, the corefile and vpc-dns deployments
    pub dns_namespace: String,
    pub dns_service: String,
    pub corefile_config_map: String,
    /// Cross-network DNS domain forwarded to the cluster DNS service
    pub cross_network_domain: String,
    pub probe_query: String,
    pub probe_image: String,
    /// Fixed wait between creating the probe pod and reading its log
    pub probe_settle: Duration,
    /// Minimum interval between two probes of a converged VpcDns
    pub dns_recheck: Duration,
    /// Interval between probes while DNS forwarding is still being wired up
    pub dns_pending_recheck: Duration,
    pub exec_timeout: Duration,
    /// Requeue delay when a gateway has several pods or a pod that is not running
    pub pod_backoff: Duration,
    pub error_requeue: Duration,
    pub concurrency: u16,
    pub scripts: ConnectionScripts,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            gateway_namespace: "kube-system".to_string(),
            gateway_container: "vpc-nat-gw".to_string(),
            dns_namespace: "kube-system".to_string(),
            dns_service: "kube-dns".to_string(),
            corefile_config_map: "vpc-dns-corefile".to_string(),
            cross_network_domain: "clusterset.local".to_string(),
            probe_query: "no.ns1.svc.clusterset.local".to_string(),
            probe_image: "nicolaka/netshoot".to_string(),
            probe_settle: Duration::from_secs(10),
            dns_recheck: Duration::from_secs(300),
            dns_pending_recheck: Duration::from_secs(30),
            exec_timeout: Duration::from_secs(30),
            pod_backoff: Duration::from_secs(5),
            error_requeue: Duration::from_secs(15),
            concurrency: 5,
            scripts: ConnectionScripts::default(),
        }
    }
}

impl OperatorConfig {
    pub fn gateway_workload_name(gateway: &str) -> String {
        format!("{}{}", GATEWAY_WORKLOAD_PREFIX, gateway)
    }
}

/// Shell scripts run inside the gateway pod to bring a VPC connection up or down
///
/// Their content is opaque to the operator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionScripts {
    pub create: String,
    pub delete: String,
}

impl ConnectionScripts {
    pub const CREATE_FILE: &'static str = "create.sh";
    pub const DELETE_FILE: &'static str = "delete.sh";

    /// Load `create.sh` and `delete.sh` from `dir`
    pub fn load(dir: &Path) -> Result<Self> {
        let read = |file: &str| {
            let path = dir.join(file);
            std::fs::read_to_string(&path).map_err(|e| {
                Error::ConfigError(format!("failed to read {}: {}", path.display(), e))
            })
        };

        let scripts = Self {
            create: read(Self::CREATE_FILE)?,
            delete: read(Self::DELETE_FILE)?,
        };
        if scripts.create.trim().is_empty() {
            return Err(Error::ConfigError(format!(
                "{} in {} is empty",
                Self::CREATE_FILE,
                dir.display()
            )));
        }
        Ok(scripts)
    }
}
