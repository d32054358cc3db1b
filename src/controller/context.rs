//! Shared state handed to every controller
//!
//! Each capability (gateway lookup, remote exec, DNS plumbing) is built once
//! here and borrowed by the reconcilers that need it.

use std::fmt::Debug;
use std::sync::Arc;

use kube::api::{Api, ListParams};
use kube::Client;
use serde::de::DeserializeOwned;
use tracing::{error, info};

use super::connection::{ConnectionOps, ConnectionReconciler, ConnectionStatusWriter};
use super::connection_store::{ConnectionStore, KubeConnectionStore};
use super::dns_bridge::{DnsBridge, KubeDnsStore, PodDnsProbe};
use super::executor::{PodExecutor, RemoteExecutor};
use super::locator::{GatewayLocator, KubeGatewayLocator};
use super::tunnel::{TunnelOps, TunnelStatusWriter};
use super::vpc_dns::{DnsStatusWriter, VpcDnsOps};
use crate::config::OperatorConfig;
use crate::error::{Error, Result};

/// Shared state for the controllers
pub struct ControllerState {
    pub client: Client,
    pub config: OperatorConfig,
    pub locator: Arc<dyn GatewayLocator>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub connections: Arc<dyn ConnectionStore>,
    pub dns: DnsBridge,
}

impl ControllerState {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        let locator = Arc::new(KubeGatewayLocator::new(
            client.clone(),
            config.gateway_namespace.clone(),
        ));
        let executor = Arc::new(PodExecutor::new(client.clone(), config.exec_timeout));
        let connections = Arc::new(KubeConnectionStore::new(client.clone()));
        let dns = DnsBridge::new(
            Arc::new(KubeDnsStore::new(client.clone(), &config)),
            Arc::new(PodDnsProbe::new(client.clone(), &config)),
            config.cross_network_domain.clone(),
        );

        Self {
            client,
            config,
            locator,
            executor,
            connections,
            dns,
        }
    }

    pub fn tunnel_ops<'a>(&'a self, status: &'a dyn TunnelStatusWriter) -> TunnelOps<'a> {
        TunnelOps {
            locator: self.locator.as_ref(),
            executor: self.executor.as_ref(),
            status,
            container: &self.config.gateway_container,
        }
    }

    pub fn connection_ops(&self) -> ConnectionOps<'_> {
        ConnectionOps {
            locator: self.locator.as_ref(),
            executor: self.executor.as_ref(),
            scripts: &self.config.scripts,
            container: &self.config.gateway_container,
        }
    }

    pub fn connection_reconciler<'a>(
        &'a self,
        status: &'a dyn ConnectionStatusWriter,
    ) -> ConnectionReconciler<'a> {
        ConnectionReconciler {
            ops: self.connection_ops(),
            dns: &self.dns,
            connections: self.connections.as_ref(),
            status,
            dns_pending_recheck: self.config.dns_pending_recheck,
        }
    }

    pub fn vpc_dns_ops<'a>(&'a self, status: &'a dyn DnsStatusWriter) -> VpcDnsOps<'a> {
        VpcDnsOps {
            bridge: &self.dns,
            status,
            config: &self.config,
        }
    }
}

/// Fail fast when a CRD the controller watches is not installed
pub async fn ensure_crd_installed<K>(api: &Api<K>, kind: &str) -> Result<()>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.list(&ListParams::default().limit(1)).await {
        Ok(_) => {
            info!("{} CRD is available", kind);
            Ok(())
        }
        Err(e) => {
            error!("{} CRD not found. Please install the CRD first: {:?}", kind, e);
            Err(Error::ConfigError(format!("{} CRD not installed", kind)))
        }
    }
}
