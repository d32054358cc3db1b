//! In-memory cluster pieces shared by the controller unit tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{ConfigMap, Container, PodSpec, PodTemplateSpec};
use kube::api::ObjectMeta;

use super::dns_bridge::{DnsProbe, DnsStore, COREFILE_KEY};
use crate::crd::kubeovn::{Subnet, SubnetSpec, VpcDns as Forwarder, VpcDnsSpec, VpcDnsStatus};
use crate::error::{Error, Result};

pub const COREFILE: &str = ".:53 {\n    errors\n    forward . /etc/resolv.conf\n}\n";
pub const ROUTE: &str = "ip -4 route add 10.96.0.10 via 10.0.1.1 dev net1";

pub fn forwarder_deployment() -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some("vpc-dns-dns1".to_string()),
            namespace: Some("kube-system".to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            template: PodTemplateSpec {
                spec: Some(PodSpec {
                    init_containers: Some(vec![Container {
                        name: "init-route".to_string(),
                        command: Some(vec![
                            "sh".to_string(),
                            "-c".to_string(),
                            "ip -4 route add 10.96.0.1 via 10.0.1.1 dev net1;".to_string(),
                        ]),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn subnet(name: &str, gateway: &str, namespaces: &[String]) -> Subnet {
    Subnet::new(
        name,
        SubnetSpec {
            vpc: "vpc1".to_string(),
            cidr_block: "10.0.1.0/24".to_string(),
            gateway: gateway.to_string(),
            namespaces: namespaces.to_vec(),
        },
    )
}

/// One VPC (`vpc1`) with an active forwarder, its deployment and subnets
///
/// `gwB` is a NAT gateway attached to `gw-subnet`.
pub struct FakeStore {
    pub deployment: Mutex<Deployment>,
    pub corefile: Mutex<ConfigMap>,
    pub probe_namespaces: Mutex<Vec<String>>,
    pub deployment_writes: AtomicUsize,
    pub corefile_writes: AtomicUsize,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        let corefile = ConfigMap {
            data: Some(BTreeMap::from([(COREFILE_KEY.to_string(), COREFILE.to_string())])),
            ..Default::default()
        };
        Arc::new(Self {
            deployment: Mutex::new(forwarder_deployment()),
            corefile: Mutex::new(corefile),
            probe_namespaces: Mutex::new(vec!["ns1".to_string()]),
            deployment_writes: AtomicUsize::new(0),
            corefile_writes: AtomicUsize::new(0),
        })
    }

    pub fn routed(&self) -> bool {
        let deployment = self.deployment.lock().unwrap();
        serde_json::to_string(&*deployment).unwrap().contains(ROUTE)
    }

    pub fn corefile_text(&self) -> String {
        self.corefile.lock().unwrap().data.as_ref().unwrap()[COREFILE_KEY].clone()
    }

    /// Leave the forwarder's subnet without namespaces
    pub fn clear_probe_namespaces(&self) {
        self.probe_namespaces.lock().unwrap().clear();
    }
}

#[async_trait]
impl DnsStore for FakeStore {
    async fn dns_service_ip(&self) -> Result<String> {
        Ok("10.96.0.10".to_string())
    }

    async fn active_forwarder(&self, vpc: &str) -> Result<Forwarder> {
        if vpc != "vpc1" {
            return Err(Error::not_found("active vpc-dns for VPC", vpc));
        }
        let mut forwarder = Forwarder::new(
            "dns1",
            VpcDnsSpec {
                vpc: "vpc1".to_string(),
                subnet: "dns-subnet".to_string(),
                replicas: Some(1),
            },
        );
        forwarder.status = Some(VpcDnsStatus { active: true });
        Ok(forwarder)
    }

    async fn subnet(&self, name: &str) -> Result<Subnet> {
        match name {
            "dns-subnet" => Ok(subnet(name, "10.0.1.1", &self.probe_namespaces.lock().unwrap())),
            "gw-subnet" => Ok(subnet(name, "10.0.2.1", &[])),
            _ => Err(Error::not_found("Subnet", name)),
        }
    }

    async fn gateway_subnet(&self, gateway: &str) -> Result<String> {
        match gateway {
            "gwB" => Ok("gw-subnet".to_string()),
            _ => Err(Error::not_found("VpcNatGateway", gateway)),
        }
    }

    async fn corefile(&self) -> Result<ConfigMap> {
        Ok(self.corefile.lock().unwrap().clone())
    }

    async fn replace_corefile(&self, config_map: &ConfigMap) -> Result<()> {
        self.corefile_writes.fetch_add(1, Ordering::SeqCst);
        *self.corefile.lock().unwrap() = config_map.clone();
        Ok(())
    }

    async fn forwarder_deployment(&self, _forwarder: &str) -> Result<Deployment> {
        Ok(self.deployment.lock().unwrap().clone())
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.deployment_writes.fetch_add(1, Ordering::SeqCst);
        *self.deployment.lock().unwrap() = deployment.clone();
        Ok(())
    }
}

/// Resolves as soon as the route is in the forwarder deployment
pub struct RouteProbe(pub Arc<FakeStore>);

#[async_trait]
impl DnsProbe for RouteProbe {
    async fn probe(&self, _namespace: &str, _expected: &str) -> Result<bool> {
        Ok(self.0.routed())
    }
}
