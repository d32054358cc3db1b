//! Reconciler for VpcNatTunnel resources
//!
//! The status of a tunnel records what its gateway is configured with. A
//! reconcile compares it with the spec and issues only the commands needed
//! to close the gap:
//!
//! - not initialized: create on the spec's gateway
//! - same gateway, different parameters: delete then create on that gateway
//! - different gateway: delete on the previous gateway, create on the new one
//! - equal: nothing
//!
//! Status is written after each remote step that succeeded, never before.

use std::sync::Arc;
#[cfg(feature = "metrics")]
use std::time::Instant;

use async_trait::async_trait;
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
use super::executor::RemoteExecutor;
use super::finalizers::TUNNEL_FINALIZER;
use super::locator::{GatewayLocator, PodRef};
use super::tunnel_strategy::strategy_for;
#[cfg(feature = "metrics")]
use super::metrics;
use crate::config::FIELD_MANAGER;
use crate::crd::{TunnelKind, VpcNatTunnel, VpcNatTunnelSpec};
use crate::error::{Error, Result};

pub(crate) const CONTROLLER: &str = "vpcnattunnel";

/// Work needed to bring a tunnel's gateway in line with its spec
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TunnelPlan {
    Noop,
    Create,
    /// Same gateway, new parameters
    Replace { previous: VpcNatTunnelSpec },
    /// Tunnel moves to another gateway
    Rehome { previous: VpcNatTunnelSpec },
}

pub fn plan(tunnel: &VpcNatTunnel) -> TunnelPlan {
    let previous = match (tunnel.is_initialized(), tunnel.last_applied()) {
        (true, Some(previous)) => previous,
        _ => return TunnelPlan::Create,
    };

    if *previous == tunnel.spec {
        TunnelPlan::Noop
    } else if previous.nat_gw_dp != tunnel.spec.nat_gw_dp {
        TunnelPlan::Rehome {
            previous: previous.clone(),
        }
    } else {
        TunnelPlan::Replace {
            previous: previous.clone(),
        }
    }
}

/// Persists what a tunnel's gateway is configured with
#[async_trait]
pub trait TunnelStatusWriter: Send + Sync {
    /// `None` once the tunnel has been removed from its gateway
    async fn record(&self, name: &str, applied: Option<VpcNatTunnelSpec>) -> Result<()>;
}

/// Status writer backed by the `status` subresource
pub struct KubeTunnelStatus {
    api: Api<VpcNatTunnel>,
}

impl KubeTunnelStatus {
    pub fn new(api: Api<VpcNatTunnel>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl TunnelStatusWriter for KubeTunnelStatus {
    async fn record(&self, name: &str, applied: Option<VpcNatTunnelSpec>) -> Result<()> {
        // lastApplied: null drops the field under merge-patch semantics
        let patch = json!({
            "status": {
                "initialized": applied.is_some(),
                "lastApplied": applied,
            }
        });
        self.api
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Answer of `ip` when the tunnel device is already gone
pub fn is_missing_device(error: &Error) -> bool {
    matches!(error, Error::RemoteExecutionFailed { message, .. }
        if message.contains("No such device") || message.contains("Cannot find device"))
}

/// Answer of `ip` when a device of that name is already configured
pub fn is_existing_device(error: &Error) -> bool {
    matches!(error, Error::RemoteExecutionFailed { message, .. } if message.contains("File exists"))
}

/// What a deleted tunnel may have left on a gateway
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Teardown<'a> {
    /// Recorded in status as configured on its gateway
    Applied(&'a VpcNatTunnelSpec),
    /// Never recorded, though a failed create may have left part of it behind
    Unconfirmed(&'a VpcNatTunnelSpec),
}

/// Remote side of the tunnel lifecycle
pub struct TunnelOps<'a> {
    pub locator: &'a dyn GatewayLocator,
    pub executor: &'a dyn RemoteExecutor,
    pub status: &'a dyn TunnelStatusWriter,
    pub container: &'a str,
}

impl TunnelOps<'_> {
    /// Carry out `plan` for the tunnel `name`
    ///
    /// Both gateway pods are located before anything is deleted. When a
    /// delete succeeded but the following create failed, the tunnel is
    /// recorded as uninitialized so the next attempt only creates.
    pub async fn converge(&self, name: &str, spec: &VpcNatTunnelSpec, plan: &TunnelPlan) -> Result<()> {
        let previous = match plan {
            TunnelPlan::Noop => return Ok(()),
            TunnelPlan::Create => None,
            TunnelPlan::Replace { previous } | TunnelPlan::Rehome { previous } => Some(previous),
        };

        let target = self.locator.locate(&spec.nat_gw_dp).await?;

        if let Some(previous) = previous {
            let old = if previous.nat_gw_dp == spec.nat_gw_dp {
                target.clone()
            } else {
                self.locator.locate(&previous.nat_gw_dp).await?
            };
            self.delete_on(&old, name, previous.kind).await?;
            info!("Removed tunnel {} from gateway {}", name, previous.nat_gw_dp);
            self.status.record(name, None).await?;
        }

        self.create_on(&target, name, spec).await?;
        info!("Configured {} tunnel {} on gateway {}", spec.kind, name, spec.nat_gw_dp);
        self.status.record(name, Some(spec.clone())).await
    }

    /// Remove the tunnel before its finalizer is released
    ///
    /// An applied tunnel whose gateway cannot be located keeps the finalizer.
    /// An unconfirmed one is deleted from the spec's gateway when that
    /// gateway has a pod; without a pod there is no network namespace the
    /// tunnel could live in.
    pub async fn teardown(&self, name: &str, teardown: Teardown<'_>) -> Result<()> {
        let spec = match teardown {
            Teardown::Applied(applied) => {
                let pod = self.locator.locate(&applied.nat_gw_dp).await?;
                self.delete_on(&pod, name, applied.kind).await?;
                info!("Removed tunnel {} from gateway {}", name, applied.nat_gw_dp);
                return Ok(());
            }
            Teardown::Unconfirmed(spec) => spec,
        };

        match self.locator.locate(&spec.nat_gw_dp).await {
            Ok(pod) => {
                self.delete_on(&pod, name, spec.kind).await?;
                info!("Removed unconfirmed tunnel {} from gateway {}", name, spec.nat_gw_dp);
                Ok(())
            }
            Err(Error::NotFound { .. }) => {
                debug!("Gateway {} has no pod, tunnel {} cannot exist", spec.nat_gw_dp, name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the device, treating an already missing one as deleted
    async fn delete_on(&self, pod: &PodRef, name: &str, kind: TunnelKind) -> Result<()> {
        let delete = strategy_for(kind).delete_command(name);
        match self.executor.exec(pod, self.container, &delete).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing_device(&e) => {
                debug!("Tunnel {} is already absent from {}", name, pod);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Create the device
    ///
    /// A device left behind by an earlier partial create or an unrecorded
    /// success is deleted and created again, once.
    async fn create_on(&self, pod: &PodRef, name: &str, spec: &VpcNatTunnelSpec) -> Result<()> {
        let create = strategy_for(spec.kind).create_command(name, spec);
        match self.executor.exec(pod, self.container, &create).await {
            Ok(_) => Ok(()),
            Err(e) if is_existing_device(&e) => {
                warn!("Tunnel {} already present on {}, recreating it", name, pod);
                self.delete_on(pod, name, spec.kind).await?;
                self.executor.exec(pod, self.container, &create).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Main entry point of the VpcNatTunnel controller
pub async fn run_tunnel_controller(state: Arc<ControllerState>) -> Result<()> {
    let tunnels: Api<VpcNatTunnel> = Api::all(state.client.clone());

    info!("Starting VpcNatTunnel controller");
    ensure_crd_installed(&tunnels, "VpcNatTunnel").await?;

    Controller::new(tunnels, Config::default())
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

async fn reconcile(obj: Arc<VpcNatTunnel>, ctx: Arc<ControllerState>) -> Result<Action> {
    #[cfg(feature = "metrics")]
    let started = Instant::now();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<VpcNatTunnel> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&api, TUNNEL_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(tunnel) => apply_tunnel(&ctx, &api, &tunnel).await,
            FinalizerEvent::Cleanup(tunnel) => cleanup_tunnel(&ctx, &api, &tunnel).await,
        }
    })
    .await
    .map_err(Error::from);

    #[cfg(feature = "metrics")]
    metrics::observe_reconcile_duration_seconds(CONTROLLER, started.elapsed().as_secs_f64());

    result
}

#[instrument(skip(ctx, api, tunnel), fields(name = %tunnel.name_any(), namespace = tunnel.namespace()))]
async fn apply_tunnel(
    ctx: &ControllerState,
    api: &Api<VpcNatTunnel>,
    tunnel: &VpcNatTunnel,
) -> Result<Action> {
    let plan = plan(tunnel);
    if plan == TunnelPlan::Noop {
        debug!("Tunnel already matches its gateway");
        return Ok(Action::await_change());
    }

    info!("Converging tunnel {}: {:?}", tunnel.name_any(), plan);
    let status = KubeTunnelStatus::new(api.clone());
    ctx.tunnel_ops(&status)
        .converge(&tunnel.name_any(), &tunnel.spec, &plan)
        .await?;

    Ok(Action::await_change())
}

#[instrument(skip(ctx, api, tunnel), fields(name = %tunnel.name_any(), namespace = tunnel.namespace()))]
async fn cleanup_tunnel(
    ctx: &ControllerState,
    api: &Api<VpcNatTunnel>,
    tunnel: &VpcNatTunnel,
) -> Result<Action> {
    info!("Cleaning up tunnel {}", tunnel.name_any());

    let teardown = match tunnel.last_applied() {
        Some(applied) if tunnel.is_initialized() => Teardown::Applied(applied),
        _ => Teardown::Unconfirmed(&tunnel.spec),
    };
    let status = KubeTunnelStatus::new(api.clone());
    ctx.tunnel_ops(&status)
        .teardown(&tunnel.name_any(), teardown)
        .await?;

    Ok(Action::await_change())
}

fn error_policy(tunnel: Arc<VpcNatTunnel>, error: &Error, ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for tunnel {}: {}", tunnel.name_any(), error);

    #[cfg(feature = "metrics")]
    metrics::inc_reconcile_error(CONTROLLER, error.kind());

    Action::requeue(error.requeue_after(&ctx.config))
}
