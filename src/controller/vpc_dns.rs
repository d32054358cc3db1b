//! Reconciler for VpcDns resources
//!
//! Each reconcile may create a probe pod, so probing is rate limited: a
//! VpcDns is probed again only when its spec changed or its re-probe
//! interval elapsed. Converged objects use the long interval, objects still
//! waiting for their forwarder to roll out use the short one.

use std::sync::Arc;
use std::time::Duration;
#[cfg(feature = "metrics")]
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::{
        controller::{self, Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config,
    },
    ResourceExt,
};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::context::{ensure_crd_installed, ControllerState};
use super::dns_bridge::{ConnectOutcome, DnsBridge, RouteVia};
use super::finalizers::DNS_FINALIZER;
#[cfg(feature = "metrics")]
use super::metrics;
use crate::config::{OperatorConfig, FIELD_MANAGER};
use crate::crd::{DnsState, VpcDns, VpcDnsStatus};
use crate::error::{Error, Result};

pub(crate) const CONTROLLER: &str = "vpcdns";

/// Time left before the next probe, `None` when a probe is due now
pub fn next_probe_in(
    status: Option<&VpcDnsStatus>,
    generation: Option<i64>,
    now: DateTime<Utc>,
    config: &OperatorConfig,
) -> Option<Duration> {
    let status = status?;
    if status.observed_generation != generation {
        return None;
    }

    let last = status
        .last_probe_time
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())?
        .with_timezone(&Utc);

    let interval = recheck_interval(status.state, config);
    let elapsed = now.signed_duration_since(last).to_std().unwrap_or_default();
    interval.checked_sub(elapsed).filter(|left| !left.is_zero())
}

fn recheck_interval(state: Option<DnsState>, config: &OperatorConfig) -> Duration {
    match state {
        Some(DnsState::DnsRunning) => config.dns_recheck,
        _ => config.dns_pending_recheck,
    }
}

pub async fn run_dns_controller(state: Arc<ControllerState>) -> Result<()> {
    let api: Api<VpcDns> = Api::all(state.client.clone());

    info!("Starting VpcDns controller");
    ensure_crd_installed(&api, "VpcDns").await?;

    Controller::new(api, Config::default())
        .with_config(controller::Config::default().concurrency(state.config.concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => warn!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

async fn reconcile(obj: Arc<VpcDns>, ctx: Arc<ControllerState>) -> Result<Action> {
    #[cfg(feature = "metrics")]
    let started = Instant::now();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<VpcDns> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&api, DNS_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(dns) => apply_vpc_dns(&ctx, &api, &dns).await,
            FinalizerEvent::Cleanup(dns) => cleanup_vpc_dns(&ctx, &api, &dns).await,
        }
    })
    .await
    .map_err(Error::from);

    #[cfg(feature = "metrics")]
    metrics::observe_reconcile_duration_seconds(CONTROLLER, started.elapsed().as_secs_f64());

    result
}

/// Persists the probe outcome of a VpcDns
#[async_trait]
pub trait DnsStatusWriter: Send + Sync {
    async fn record(&self, name: &str, status: &VpcDnsStatus) -> Result<()>;
}

pub struct KubeDnsStatus {
    api: Api<VpcDns>,
}

impl KubeDnsStatus {
    pub fn new(api: Api<VpcDns>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl DnsStatusWriter for KubeDnsStatus {
    async fn record(&self, name: &str, status: &VpcDnsStatus) -> Result<()> {
        let patch = json!({ "status": status });
        self.api
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

pub struct VpcDnsOps<'a> {
    pub bridge: &'a DnsBridge,
    pub status: &'a dyn DnsStatusWriter,
    pub config: &'a OperatorConfig,
}

impl VpcDnsOps<'_> {
    /// Probe when due, wire up forwarding if the VPC does not resolve yet
    pub async fn apply(&self, dns: &VpcDns, now: DateTime<Utc>) -> Result<Action> {
        let generation = dns.metadata.generation;
        if let Some(wait) = next_probe_in(dns.status.as_ref(), generation, now, self.config) {
            debug!("Next DNS probe in {:?}", wait);
            return Ok(Action::requeue(wait));
        }

        let target = self.bridge.resolve(&dns.spec.vpc, RouteVia::Forwarder).await?;
        let state = match self.bridge.connect(&target).await? {
            ConnectOutcome::AlreadyConnected => DnsState::DnsRunning,
            ConnectOutcome::Applied => {
                info!("DNS forwarding for {} applied, waiting for the forwarder", dns.spec.vpc);
                DnsState::DnsStopped
            }
        };

        let status = VpcDnsStatus {
            initialized: true,
            state: Some(state),
            observed_generation: generation,
            last_probe_time: Some(now.to_rfc3339()),
        };
        self.status.record(&dns.name_any(), &status).await?;

        Ok(Action::requeue(recheck_interval(Some(state), self.config)))
    }

    /// Remove the route and verify it is gone
    ///
    /// Only a VPC without an active forwarder counts as already disconnected.
    pub async fn cleanup(&self, dns: &VpcDns) -> Result<Action> {
        let Some(target) = self
            .bridge
            .resolve_existing(&dns.spec.vpc, RouteVia::Forwarder)
            .await?
        else {
            info!("VPC {} has no active forwarder, nothing to disconnect", dns.spec.vpc);
            return Ok(Action::await_change());
        };

        self.bridge.disconnect(&target).await?;
        info!("DNS forwarding for {} removed", dns.spec.vpc);
        Ok(Action::await_change())
    }
}

#[instrument(skip(ctx, api, dns), fields(name = %dns.name_any(), namespace = dns.namespace(), vpc = %dns.spec.vpc))]
async fn apply_vpc_dns(ctx: &ControllerState, api: &Api<VpcDns>, dns: &VpcDns) -> Result<Action> {
    let status = KubeDnsStatus::new(api.clone());
    ctx.vpc_dns_ops(&status).apply(dns, Utc::now()).await
}

#[instrument(skip(ctx, api, dns), fields(name = %dns.name_any(), namespace = dns.namespace(), vpc = %dns.spec.vpc))]
async fn cleanup_vpc_dns(ctx: &ControllerState, api: &Api<VpcDns>, dns: &VpcDns) -> Result<Action> {
    let status = KubeDnsStatus::new(api.clone());
    ctx.vpc_dns_ops(&status).cleanup(dns).await
}

fn error_policy(dns: Arc<VpcDns>, error: &Error, ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for VpcDns {}: {}", dns.name_any(), error);

    #[cfg(feature = "metrics")]
    metrics::inc_reconcile_error(CONTROLLER, error.kind());

    Action::requeue(error.requeue_after(&ctx.config))
}
