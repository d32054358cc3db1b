//! Cross-network DNS forwarding into a VPC
//!
//! Two edits make names under the cross-network domain resolvable from a VPC:
//!
//! 1. the shared vpc-dns Corefile gets a stanza forwarding the domain to the
//!    cluster DNS service
//! 2. the VPC's active vpc-dns Deployment gets a route to the cluster DNS
//!    address, appended to the startup script of its init containers
//!
//! Both edits are text insertions guarded by a substring check, so repeated
//! connects change nothing. Whether forwarding works is decided by an active
//! probe: a throwaway pod inside the VPC resolves a well-known name and its
//! log is checked for the cluster DNS address.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Container, Pod, PodSpec, Service};
use kube::api::{Api, DeleteParams, ListParams, LogParams, ObjectMeta, PostParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, instrument, warn};

#[cfg(feature = "metrics")]
use super::metrics;
use crate::config::OperatorConfig;
use crate::crd::kubeovn::{Subnet, VpcDns as Forwarder, VpcNatGateway};
use crate::error::{is_kube_not_found, Error, Result};

/// Key of the Corefile inside the vpc-dns ConfigMap
pub const COREFILE_KEY: &str = "Corefile";

/// Prefix of the Deployment Kube-OVN creates for each vpc-dns forwarder
pub const FORWARDER_DEPLOYMENT_PREFIX: &str = "vpc-dns-";

/// Cluster objects the DNS bridge reads and edits
#[async_trait]
pub trait DnsStore: Send + Sync {
    /// ClusterIP of the cluster DNS service
    async fn dns_service_ip(&self) -> Result<String>;

    /// The vpc-dns forwarder Kube-OVN marked active for `vpc`
    async fn active_forwarder(&self, vpc: &str) -> Result<Forwarder>;

    async fn subnet(&self, name: &str) -> Result<Subnet>;

    /// Name of the subnet a NAT gateway is attached to
    async fn gateway_subnet(&self, gateway: &str) -> Result<String>;

    async fn corefile(&self) -> Result<ConfigMap>;

    /// Replace the Corefile ConfigMap, conditional on its resourceVersion
    async fn replace_corefile(&self, config_map: &ConfigMap) -> Result<()>;

    async fn forwarder_deployment(&self, forwarder: &str) -> Result<Deployment>;

    /// Replace a forwarder Deployment, conditional on its resourceVersion
    async fn replace_deployment(&self, deployment: &Deployment) -> Result<()>;
}

/// Active DNS check run inside a VPC
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DnsProbe: Send + Sync {
    /// True when a lookup from `namespace` answers with `expected`
    async fn probe(&self, namespace: &str, expected: &str) -> Result<bool>;
}

/// Which subnet gateway the DNS route goes through
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteVia<'a> {
    /// Gateway of the forwarder's own subnet
    Forwarder,
    /// Gateway of the subnet a NAT gateway is attached to
    NatGateway(&'a str),
}

/// Everything needed to connect, disconnect or probe one VPC
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsTarget {
    /// Name of the active vpc-dns forwarder
    pub forwarder: String,
    pub dns_ip: String,
    pub route_gateway: String,
    pub probe_namespace: String,
}

impl DnsTarget {
    pub fn route(&self) -> String {
        route_command(&self.dns_ip, &self.route_gateway)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The probe already resolved through the cluster DNS
    AlreadyConnected,
    /// Corefile and route are in place, the forwarder still has to roll out
    Applied,
}

pub struct DnsBridge {
    store: Arc<dyn DnsStore>,
    probe: Arc<dyn DnsProbe>,
    domain: String,
}

impl DnsBridge {
    pub fn new(store: Arc<dyn DnsStore>, probe: Arc<dyn DnsProbe>, domain: impl Into<String>) -> Self {
        Self {
            store,
            probe,
            domain: domain.into(),
        }
    }

    pub async fn resolve(&self, vpc: &str, via: RouteVia<'_>) -> Result<DnsTarget> {
        let forwarder = self.store.active_forwarder(vpc).await?;
        self.target(&forwarder, via).await
    }

    /// Like [`resolve`](Self::resolve), but `None` when the VPC has no
    /// active forwarder
    ///
    /// Without a forwarder there is no Deployment carrying a route. Any other
    /// missing piece is still an error: the route may be in place and must
    /// not be forgotten.
    pub async fn resolve_existing(&self, vpc: &str, via: RouteVia<'_>) -> Result<Option<DnsTarget>> {
        let forwarder = match self.store.active_forwarder(vpc).await {
            Ok(forwarder) => forwarder,
            Err(Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        self.target(&forwarder, via).await.map(Some)
    }

    async fn target(&self, forwarder: &Forwarder, via: RouteVia<'_>) -> Result<DnsTarget> {
        let dns_subnet = self.store.subnet(&forwarder.spec.subnet).await?;
        let probe_namespace = dns_subnet
            .spec
            .namespaces
            .first()
            .cloned()
            .ok_or_else(|| Error::not_found("probe namespace of subnet", dns_subnet.name_any()))?;

        let route_gateway = match via {
            RouteVia::Forwarder => dns_subnet.spec.gateway.clone(),
            RouteVia::NatGateway(gateway) => {
                let subnet = self.store.gateway_subnet(gateway).await?;
                self.store.subnet(&subnet).await?.spec.gateway
            }
        };

        Ok(DnsTarget {
            forwarder: forwarder.name_any(),
            dns_ip: self.store.dns_service_ip().await?,
            route_gateway,
            probe_namespace,
        })
    }

    pub async fn probe(&self, target: &DnsTarget) -> Result<bool> {
        let connected = self
            .probe
            .probe(&target.probe_namespace, &target.dns_ip)
            .await?;
        debug!(
            "DNS probe in {} for {}: connected={}",
            target.probe_namespace, target.dns_ip, connected
        );

        #[cfg(feature = "metrics")]
        metrics::inc_dns_probe(connected);

        Ok(connected)
    }

    #[instrument(skip(self, target), fields(forwarder = %target.forwarder))]
    pub async fn connect(&self, target: &DnsTarget) -> Result<ConnectOutcome> {
        if self.probe(target).await? {
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        self.ensure_forward_stanza(&target.dns_ip).await?;

        let mut deployment = self.store.forwarder_deployment(&target.forwarder).await?;
        let route = target.route();
        if insert_route(&mut deployment, &route)? {
            self.store.replace_deployment(&deployment).await?;
            info!("Added DNS route to {}: {}", deployment.name_any(), route);
        } else {
            debug!("DNS route already present in {}", deployment.name_any());
        }

        Ok(ConnectOutcome::Applied)
    }

    /// Remove the route and verify the VPC no longer resolves through it
    #[instrument(skip(self, target), fields(forwarder = %target.forwarder))]
    pub async fn disconnect(&self, target: &DnsTarget) -> Result<()> {
        let mut deployment = self.store.forwarder_deployment(&target.forwarder).await?;
        let route = target.route();
        if remove_route(&mut deployment, &route) {
            self.store.replace_deployment(&deployment).await?;
            info!("Removed DNS route from {}: {}", deployment.name_any(), route);
        }

        if self.probe(target).await? {
            return Err(Error::VerificationFailed(format!(
                "{} still resolves through {} after the route was removed",
                target.probe_namespace, target.dns_ip
            )));
        }
        Ok(())
    }

    async fn ensure_forward_stanza(&self, dns_ip: &str) -> Result<()> {
        let mut config_map = self.store.corefile().await?;
        let current = config_map
            .data
            .as_ref()
            .and_then(|d| d.get(COREFILE_KEY))
            .cloned()
            .unwrap_or_default();

        if let Some(updated) = insert_forward_stanza(&current, &self.domain, dns_ip) {
            config_map
                .data
                .get_or_insert_with(BTreeMap::new)
                .insert(COREFILE_KEY.to_string(), updated);
            self.store.replace_corefile(&config_map).await?;
            info!("Added {} forwarding to the vpc-dns Corefile", self.domain);
        }
        Ok(())
    }
}

pub fn route_command(dns_ip: &str, gateway: &str) -> String {
    format!("ip -4 route add {} via {} dev net1", dns_ip, gateway)
}

/// Corefile with a forwarding stanza for `domain`, or `None` when one exists
pub fn insert_forward_stanza(corefile: &str, domain: &str, dns_ip: &str) -> Option<String> {
    if corefile.contains(&format!("{}:53", domain)) {
        return None;
    }

    let stanza = format!("{domain}:53 {{\n    forward . {dns_ip}\n}}\n");
    let root = ".:53 {";
    Some(match corefile.find(root) {
        Some(at) => format!("{}{}{}", &corefile[..at], stanza, &corefile[at..]),
        None => format!("{}{}", corefile, stanza),
    })
}

fn init_containers_mut(deployment: &mut Deployment) -> Option<&mut Vec<Container>> {
    deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .and_then(|s| s.init_containers.as_mut())
}

/// Last element of the container's args, or of its command when it has none
fn startup_script(container: &mut Container) -> Option<&mut String> {
    if container.args.as_ref().is_some_and(|a| !a.is_empty()) {
        container.args.as_mut().and_then(|a| a.last_mut())
    } else {
        container.command.as_mut().and_then(|c| c.last_mut())
    }
}

/// Append `route` to every init container's startup script that lacks it
///
/// Returns whether the deployment changed. A deployment whose init
/// containers have no startup script at all cannot carry the route.
pub fn insert_route(deployment: &mut Deployment, route: &str) -> Result<bool> {
    let name = deployment.name_any();
    let containers = match init_containers_mut(deployment) {
        Some(containers) if !containers.is_empty() => containers,
        _ => return Err(Error::not_found("init container of deployment", name)),
    };

    let mut scripts = 0;
    let mut changed = false;
    for container in containers.iter_mut() {
        let Some(script) = startup_script(container) else {
            warn!("Init container {} of {} has no startup command", container.name, name);
            continue;
        };
        scripts += 1;
        if !script.contains(route) {
            script.push_str(&format!(" {};", route));
            changed = true;
        }
    }
    if scripts == 0 {
        return Err(Error::not_found("init container startup command of deployment", name));
    }
    Ok(changed)
}

/// Strip `route` from every init container's command and args
pub fn remove_route(deployment: &mut Deployment, route: &str) -> bool {
    let Some(containers) = init_containers_mut(deployment) else {
        return false;
    };

    let inserted = format!(" {};", route);
    let bare = format!("{};", route);
    let mut changed = false;
    for container in containers.iter_mut() {
        let parts = container
            .command
            .iter_mut()
            .chain(container.args.iter_mut())
            .flat_map(|v| v.iter_mut());
        for part in parts {
            let cleaned = part.replace(&inserted, "").replace(&bare, "");
            if cleaned != *part {
                *part = cleaned;
                changed = true;
            }
        }
    }
    changed
}

/// [`DnsStore`] backed by the Kubernetes API
pub struct KubeDnsStore {
    client: Client,
    namespace: String,
    service: String,
    config_map: String,
}

impl KubeDnsStore {
    pub fn new(client: Client, config: &OperatorConfig) -> Self {
        Self {
            client,
            namespace: config.dns_namespace.clone(),
            service: config.dns_service.clone(),
            config_map: config.corefile_config_map.clone(),
        }
    }
}

#[async_trait]
impl DnsStore for KubeDnsStore {
    async fn dns_service_ip(&self) -> Result<String> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        services
            .get_opt(&self.service)
            .await?
            .and_then(|s| s.spec)
            .and_then(|s| s.cluster_ip)
            .filter(|ip| !ip.is_empty() && ip != "None")
            .ok_or_else(|| Error::not_found("DNS service ClusterIP", &self.service))
    }

    async fn active_forwarder(&self, vpc: &str) -> Result<Forwarder> {
        let forwarders: Api<Forwarder> = Api::all(self.client.clone());
        forwarders
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .find(|f| f.spec.vpc == vpc && f.is_active())
            .ok_or_else(|| Error::not_found("active vpc-dns for VPC", vpc))
    }

    async fn subnet(&self, name: &str) -> Result<Subnet> {
        let subnets: Api<Subnet> = Api::all(self.client.clone());
        subnets
            .get_opt(name)
            .await?
            .ok_or_else(|| Error::not_found("Subnet", name))
    }

    async fn gateway_subnet(&self, gateway: &str) -> Result<String> {
        let gateways: Api<VpcNatGateway> = Api::all(self.client.clone());
        gateways
            .get_opt(gateway)
            .await?
            .map(|g| g.spec.subnet)
            .ok_or_else(|| Error::not_found("VpcNatGateway", gateway))
    }

    async fn corefile(&self) -> Result<ConfigMap> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        config_maps
            .get_opt(&self.config_map)
            .await?
            .ok_or_else(|| Error::not_found("ConfigMap", &self.config_map))
    }

    async fn replace_corefile(&self, config_map: &ConfigMap) -> Result<()> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        config_maps
            .replace(&self.config_map, &PostParams::default(), config_map)
            .await?;
        Ok(())
    }

    async fn forwarder_deployment(&self, forwarder: &str) -> Result<Deployment> {
        let name = format!("{}{}", FORWARDER_DEPLOYMENT_PREFIX, forwarder);
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        deployments
            .get_opt(&name)
            .await?
            .ok_or_else(|| Error::not_found("Deployment", name))
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        deployments
            .replace(&deployment.name_any(), &PostParams::default(), deployment)
            .await?;
        Ok(())
    }
}

/// [`DnsProbe`] that runs `dig` from a short-lived pod
///
/// The pod name is generated by the API server so concurrent probes never
/// collide. The pod is deleted after its log has been read, whatever the log
/// says.
pub struct PodDnsProbe {
    client: Client,
    image: String,
    query: String,
    settle: Duration,
}

impl PodDnsProbe {
    pub fn new(client: Client, config: &OperatorConfig) -> Self {
        Self {
            client,
            image: config.probe_image.clone(),
            query: config.probe_query.clone(),
            settle: config.probe_settle,
        }
    }
}

/// Pod that resolves `query` once and exits
pub(crate) fn probe_pod(image: &str, query: &str) -> Pod {
    let labels = BTreeMap::from([
        (
            "app.kubernetes.io/managed-by".to_string(),
            "multi-vpc-operator".to_string(),
        ),
        ("app.kubernetes.io/component".to_string(), "dns-probe".to_string()),
    ]);

    Pod {
        metadata: ObjectMeta {
            generate_name: Some("dns-probe-".to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "probe".to_string(),
                image: Some(image.to_string()),
                command: Some(vec![
                    "/bin/bash".to_string(),
                    "-c".to_string(),
                    format!("dig {}", query),
                ]),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl DnsProbe for PodDnsProbe {
    async fn probe(&self, namespace: &str, expected: &str) -> Result<bool> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = pods
            .create(&PostParams::default(), &probe_pod(&self.image, &self.query))
            .await?;
        let name = pod.name_any();
        debug!("Created DNS probe pod {}/{}", namespace, name);

        tokio::time::sleep(self.settle).await;
        let logs = pods.logs(&name, &LogParams::default()).await;

        if let Err(e) = pods.delete(&name, &DeleteParams::background()).await {
            if !is_kube_not_found(&e) {
                warn!("Failed to delete DNS probe pod {}/{}: {}", namespace, name, e);
                return Err(e.into());
            }
        }

        Ok(logs?.contains(expected))
    }
}
