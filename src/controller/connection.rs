//! Reconciler for VpcConnection resources
//!
//! The desired operation is consumed once: after it has been carried out,
//! `status.observedGeneration` is set to the object's generation and later
//! reconciles of that generation do nothing. Writing a new operation bumps
//! the generation and makes the object actionable again.
//!
//! | operation             | action                                  | state                  |
//! |-----------------------|-----------------------------------------|------------------------|
//! | `DnsConnectionCreate` | DNS connect through the NAT gateway     | `DNSConnectionRunning` |
//! | `VpcConnectionCreate` | `create.sh` in the gateway pod          | `VpcConnectionRunning` |
//! | `Recovery`            | `create.sh` in the gateway pod          | `VpcConnectionRunning` |
//! | `Stop`                | `delete.sh` if the gateway pod is there | `Stopped`              |

use std::sync::Arc;
use std::time::Duration;
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

use super::connection_store::{has_gateway_label, ConnectionStore};
use super::context::{ensure_crd_installed, ControllerState};
use super::dns_bridge::{ConnectOutcome, DnsBridge, RouteVia};
use super::executor::RemoteExecutor;
use super::finalizers::CONNECTION_FINALIZER;
use super::locator::GatewayLocator;
#[cfg(feature = "metrics")]
use super::metrics;
use crate::config::{ConnectionScripts, FIELD_MANAGER};
use crate::crd::{ConnectionOperation, ConnectionState, VpcConnection};
use crate::error::{Error, Result};

pub(crate) const CONTROLLER: &str = "vpcconnection";

/// Script runs for the VPC leg of a connection
pub struct ConnectionOps<'a> {
    pub locator: &'a dyn GatewayLocator,
    pub executor: &'a dyn RemoteExecutor,
    pub scripts: &'a ConnectionScripts,
    pub container: &'a str,
}

impl ConnectionOps<'_> {
    /// Run `create.sh` in the gateway pod
    pub async fn start(&self, gateway: &str) -> Result<ConnectionState> {
        let pod = self.locator.locate(gateway).await?;
        self.executor
            .exec(&pod, self.container, &self.scripts.create)
            .await?;
        info!("Connection through gateway {} is running", gateway);
        Ok(ConnectionState::VpcRunning)
    }

    /// Run `delete.sh` in the gateway pod
    ///
    /// A gateway without pods has nothing left to tear down. Any other
    /// locator error is returned so the stop is retried.
    pub async fn stop(&self, gateway: &str) -> Result<ConnectionState> {
        match self.locator.locate(gateway).await {
            Ok(pod) => {
                if self.scripts.delete.trim().is_empty() {
                    debug!("No delete script configured");
                } else {
                    self.executor
                        .exec(&pod, self.container, &self.scripts.delete)
                        .await?;
                }
                info!("Connection through gateway {} stopped", gateway);
            }
            Err(Error::NotFound { .. }) => {
                info!("Gateway {} has no pod, connection already down", gateway);
            }
            Err(e) => return Err(e),
        }
        Ok(ConnectionState::Stopped)
    }
}

pub async fn run_connection_controller(state: Arc<ControllerState>) -> Result<()> {
    let api: Api<VpcConnection> = Api::all(state.client.clone());

    info!("Starting VpcConnection controller");
    ensure_crd_installed(&api, "VpcConnection").await?;

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

async fn reconcile(obj: Arc<VpcConnection>, ctx: Arc<ControllerState>) -> Result<Action> {
    #[cfg(feature = "metrics")]
    let started = Instant::now();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<VpcConnection> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&api, CONNECTION_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(vc) => apply_connection(&ctx, &api, &vc).await,
            FinalizerEvent::Cleanup(vc) => cleanup_connection(&ctx, &api, &vc).await,
        }
    })
    .await
    .map_err(Error::from);

    #[cfg(feature = "metrics")]
    metrics::observe_reconcile_duration_seconds(CONTROLLER, started.elapsed().as_secs_f64());

    result
}

/// Persists the outcome of a connection operation
#[async_trait]
pub trait ConnectionStatusWriter: Send + Sync {
    async fn record(
        &self,
        name: &str,
        state: ConnectionState,
        observed_generation: Option<i64>,
        message: &str,
    ) -> Result<()>;
}

pub struct KubeConnectionStatus {
    api: Api<VpcConnection>,
}

impl KubeConnectionStatus {
    pub fn new(api: Api<VpcConnection>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ConnectionStatusWriter for KubeConnectionStatus {
    async fn record(
        &self,
        name: &str,
        state: ConnectionState,
        observed_generation: Option<i64>,
        message: &str,
    ) -> Result<()> {
        let patch = json!({
            "status": {
                "state": state,
                "observedGeneration": observed_generation,
                "message": message,
            }
        });
        self.api
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Everything a VpcConnection reconcile touches
pub struct ConnectionReconciler<'a> {
    pub ops: ConnectionOps<'a>,
    pub dns: &'a DnsBridge,
    pub connections: &'a dyn ConnectionStore,
    pub status: &'a dyn ConnectionStatusWriter,
    pub dns_pending_recheck: Duration,
}

impl ConnectionReconciler<'_> {
    pub async fn apply(&self, vc: &VpcConnection) -> Result<Action> {
        if !has_gateway_label(vc) {
            debug!("Labelling {} for gateway {}", vc.name_any(), vc.spec.gateway);
            self.connections.label_gateway(vc).await?;
        }

        let Some(operation) = vc.spec.operation else {
            debug!("No operation requested");
            return Ok(Action::await_change());
        };
        if vc.operation_consumed() {
            debug!("Operation {} already carried out", operation);
            return Ok(Action::await_change());
        }

        info!("Carrying out {} on {}", operation, vc.name_any());
        let state = match operation {
            ConnectionOperation::DnsConnect => return self.dns_connect(vc).await,
            ConnectionOperation::VpcConnect | ConnectionOperation::Recover => {
                self.ops.start(&vc.spec.gateway).await?
            }
            ConnectionOperation::Stop => self.ops.stop(&vc.spec.gateway).await?,
        };

        self.status
            .record(
                &vc.name_any(),
                state,
                vc.metadata.generation,
                &format!("{} done", operation),
            )
            .await?;
        Ok(Action::await_change())
    }

    /// DNS leg of a connection
    ///
    /// Once the probe reports the VPC resolves cross-network names, the
    /// operation advances to `VpcConnectionCreate`. That write is conditional
    /// on the resourceVersion read, so a concurrent change aborts it with a
    /// conflict. The status keeps the previous observedGeneration so the new
    /// operation is not mistaken for a consumed one.
    async fn dns_connect(&self, vc: &VpcConnection) -> Result<Action> {
        let target = self
            .dns
            .resolve(&vc.spec.vpc, RouteVia::NatGateway(&vc.spec.gateway))
            .await?;

        match self.dns.connect(&target).await? {
            ConnectOutcome::AlreadyConnected => {
                self.connections
                    .set_operation(vc, ConnectionOperation::VpcConnect)
                    .await?;
                let observed = vc.status.as_ref().and_then(|s| s.observed_generation);
                self.status
                    .record(
                        &vc.name_any(),
                        ConnectionState::DnsRunning,
                        observed,
                        "DNS forwarding is up",
                    )
                    .await?;
                info!("DNS leg of {} is up, continuing with the VPC leg", vc.name_any());
                Ok(Action::await_change())
            }
            ConnectOutcome::Applied => {
                debug!("Waiting for the forwarder of {} to pick up the route", vc.spec.vpc);
                Ok(Action::requeue(self.dns_pending_recheck))
            }
        }
    }

    pub async fn cleanup(&self, vc: &VpcConnection) -> Result<Action> {
        if vc.state() == Some(ConnectionState::VpcRunning) {
            info!("Tearing down running connection {}", vc.name_any());
            self.ops.stop(&vc.spec.gateway).await?;
        }
        Ok(Action::await_change())
    }
}

#[instrument(skip(ctx, api, vc), fields(name = %vc.name_any(), namespace = vc.namespace(), gateway = %vc.spec.gateway))]
async fn apply_connection(
    ctx: &ControllerState,
    api: &Api<VpcConnection>,
    vc: &VpcConnection,
) -> Result<Action> {
    let status = KubeConnectionStatus::new(api.clone());
    ctx.connection_reconciler(&status).apply(vc).await
}

#[instrument(skip(ctx, api, vc), fields(name = %vc.name_any(), namespace = vc.namespace()))]
async fn cleanup_connection(
    ctx: &ControllerState,
    api: &Api<VpcConnection>,
    vc: &VpcConnection,
) -> Result<Action> {
    let status = KubeConnectionStatus::new(api.clone());
    ctx.connection_reconciler(&status).cleanup(vc).await
}

fn error_policy(vc: Arc<VpcConnection>, error: &Error, ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for VpcConnection {}: {}", vc.name_any(), error);

    #[cfg(feature = "metrics")]
    metrics::inc_reconcile_error(CONTROLLER, error.kind());

    Action::requeue(error.requeue_after(&ctx.config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    use crate::controller::connection_store::MockConnectionStore;
    use crate::controller::dns_bridge::MockDnsProbe;
    use crate::controller::executor::MockRemoteExecutor;
    use crate::controller::locator::{MockGatewayLocator, PodRef};
    use crate::controller::test_fixtures::FakeStore;
    use crate::crd::{VpcConnectionSpec, VpcConnectionStatus};

    type StatusWrite = (String, ConnectionState, Option<i64>, String);

    #[derive(Default)]
    struct RecordedStatus {
        writes: Mutex<Vec<StatusWrite>>,
    }

    #[async_trait]
    impl ConnectionStatusWriter for RecordedStatus {
        async fn record(
            &self,
            name: &str,
            state: ConnectionState,
            observed_generation: Option<i64>,
            message: &str,
        ) -> Result<()> {
            self.writes.lock().unwrap().push((
                name.to_string(),
                state,
                observed_generation,
                message.to_string(),
            ));
            Ok(())
        }
    }

    /// `vc1` on gateway `gwB`, labelled, at generation 3
    fn connection(operation: Option<ConnectionOperation>, observed: Option<i64>) -> VpcConnection {
        let mut vc = VpcConnection::new(
            "vc1",
            VpcConnectionSpec {
                vpc: "vpc1".to_string(),
                gateway: "gwB".to_string(),
                subnet_cidr: Some("10.1.0.0/16".to_string()),
                subnet_ip: None,
                operation,
            },
        );
        vc.metadata.namespace = Some("default".to_string());
        vc.metadata.generation = Some(3);
        vc.labels_mut()
            .insert("gateway".to_string(), "gwB".to_string());
        vc.status = Some(VpcConnectionStatus {
            state: None,
            observed_generation: observed,
            message: None,
        });
        vc
    }

    struct Harness {
        locator: MockGatewayLocator,
        executor: MockRemoteExecutor,
        scripts: ConnectionScripts,
        dns: DnsBridge,
        store: Arc<FakeStore>,
        connections: MockConnectionStore,
        status: RecordedStatus,
    }

    impl Harness {
        fn new(executor: MockRemoteExecutor, probe: MockDnsProbe) -> Self {
            let store = FakeStore::new();
            Self {
                locator: located(),
                executor,
                scripts: scripts(),
                dns: DnsBridge::new(store.clone(), Arc::new(probe), "clusterset.local"),
                store,
                connections: MockConnectionStore::new(),
                status: RecordedStatus::default(),
            }
        }

        fn reconciler(&self) -> ConnectionReconciler<'_> {
            ConnectionReconciler {
                ops: ConnectionOps {
                    locator: &self.locator,
                    executor: &self.executor,
                    scripts: &self.scripts,
                    container: "vpc-nat-gw",
                },
                dns: &self.dns,
                connections: &self.connections,
                status: &self.status,
                dns_pending_recheck: Duration::from_secs(30),
            }
        }

        fn writes(&self) -> Vec<StatusWrite> {
            self.status.writes.lock().unwrap().clone()
        }
    }

    fn no_probe() -> MockDnsProbe {
        let mut probe = MockDnsProbe::new();
        probe.expect_probe().never();
        probe
    }

    fn script_executor(expected: &'static str) -> MockRemoteExecutor {
        let mut executor = MockRemoteExecutor::new();
        executor
            .expect_exec()
            .withf(move |_, _, cmd| cmd == expected)
            .times(1)
            .returning(|_, _, _| Ok(String::new()));
        executor
    }

    fn idle_executor() -> MockRemoteExecutor {
        let mut executor = MockRemoteExecutor::new();
        executor.expect_exec().never();
        executor
    }

    fn scripts() -> ConnectionScripts {
        ConnectionScripts {
            create: "ip route add 10.1.0.0/16 via 10.0.1.1".to_string(),
            delete: "ip route del 10.1.0.0/16".to_string(),
        }
    }

    fn located() -> MockGatewayLocator {
        let mut locator = MockGatewayLocator::new();
        locator
            .expect_locate()
            .withf(|gw| gw == "gwB")
            .returning(|_| Ok(PodRef::new("vpc-nat-gw-gwB-0", "kube-system")));
        locator
    }

    #[tokio::test]
    async fn test_start_runs_create_script() {
        let locator = located();
        let mut executor = MockRemoteExecutor::new();
        executor
            .expect_exec()
            .withf(|pod, container, cmd| {
                pod.name == "vpc-nat-gw-gwB-0"
                    && container == "vpc-nat-gw"
                    && cmd == "ip route add 10.1.0.0/16 via 10.0.1.1"
            })
            .times(1)
            .returning(|_, _, _| Ok(String::new()));

        let scripts = scripts();
        let ops = ConnectionOps {
            locator: &locator,
            executor: &executor,
            scripts: &scripts,
            container: "vpc-nat-gw",
        };
        assert_eq!(ops.start("gwB").await.unwrap(), ConnectionState::VpcRunning);
    }

    #[tokio::test]
    async fn test_start_propagates_script_failure() {
        let locator = located();
        let mut executor = MockRemoteExecutor::new();
        executor.expect_exec().returning(|pod, _, _| {
            Err(Error::RemoteExecutionFailed {
                pod: pod.to_string(),
                message: "RTNETLINK answers: File exists".to_string(),
            })
        });

        let scripts = scripts();
        let ops = ConnectionOps {
            locator: &locator,
            executor: &executor,
            scripts: &scripts,
            container: "vpc-nat-gw",
        };
        assert!(matches!(
            ops.start("gwB").await,
            Err(Error::RemoteExecutionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_runs_delete_script() {
        let locator = located();
        let mut executor = MockRemoteExecutor::new();
        executor
            .expect_exec()
            .withf(|_, _, cmd| cmd == "ip route del 10.1.0.0/16")
            .times(1)
            .returning(|_, _, _| Ok(String::new()));

        let scripts = scripts();
        let ops = ConnectionOps {
            locator: &locator,
            executor: &executor,
            scripts: &scripts,
            container: "vpc-nat-gw",
        };
        assert_eq!(ops.stop("gwB").await.unwrap(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_without_gateway_pod() {
        let mut locator = MockGatewayLocator::new();
        locator
            .expect_locate()
            .returning(|gw| Err(Error::not_found("gateway pod", gw)));
        let mut executor = MockRemoteExecutor::new();
        executor.expect_exec().never();

        let scripts = scripts();
        let ops = ConnectionOps {
            locator: &locator,
            executor: &executor,
            scripts: &scripts,
            container: "vpc-nat-gw",
        };
        assert_eq!(ops.stop("gwB").await.unwrap(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_retries_while_pod_not_ready() {
        let mut locator = MockGatewayLocator::new();
        locator.expect_locate().returning(|_| {
            Err(Error::NotReady {
                pod: "vpc-nat-gw-gwB-0".to_string(),
                phase: "Pending".to_string(),
            })
        });
        let mut executor = MockRemoteExecutor::new();
        executor.expect_exec().never();

        let scripts = scripts();
        let ops = ConnectionOps {
            locator: &locator,
            executor: &executor,
            scripts: &scripts,
            container: "vpc-nat-gw",
        };
        assert!(ops.stop("gwB").await.unwrap_err().is_pod_race());
    }

    #[tokio::test]
    async fn test_recovery_starts_connection() {
        let harness = Harness::new(
            script_executor("ip route add 10.1.0.0/16 via 10.0.1.1"),
            no_probe(),
        );

        let vc = connection(Some(ConnectionOperation::Recover), Some(2));
        let action = harness.reconciler().apply(&vc).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(
            harness.writes(),
            vec![(
                "vc1".to_string(),
                ConnectionState::VpcRunning,
                Some(3),
                "Recovery done".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_vpc_connect_starts_connection() {
        let harness = Harness::new(
            script_executor("ip route add 10.1.0.0/16 via 10.0.1.1"),
            no_probe(),
        );

        let vc = connection(Some(ConnectionOperation::VpcConnect), None);
        harness.reconciler().apply(&vc).await.unwrap();

        assert_eq!(harness.writes()[0].1, ConnectionState::VpcRunning);
        assert_eq!(harness.writes()[0].2, Some(3));
    }

    #[tokio::test]
    async fn test_stop_records_stopped() {
        let harness = Harness::new(
            script_executor("ip route del 10.1.0.0/16"),
            no_probe(),
        );

        let vc = connection(Some(ConnectionOperation::Stop), Some(2));
        harness.reconciler().apply(&vc).await.unwrap();

        assert_eq!(
            harness.writes(),
            vec![(
                "vc1".to_string(),
                ConnectionState::Stopped,
                Some(3),
                "Stop done".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_consumed_operation_is_noop() {
        let harness = Harness::new(idle_executor(), no_probe());

        let vc = connection(Some(ConnectionOperation::Recover), Some(3));
        let action = harness.reconciler().apply(&vc).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert!(harness.writes().is_empty());
    }

    #[tokio::test]
    async fn test_without_operation_is_noop() {
        let harness = Harness::new(idle_executor(), no_probe());

        harness.reconciler().apply(&connection(None, None)).await.unwrap();
        assert!(harness.writes().is_empty());
    }

    #[tokio::test]
    async fn test_dns_connected_advances_to_vpc_connect() {
        let mut probe = MockDnsProbe::new();
        probe.expect_probe().times(1).returning(|_, _| Ok(true));
        let mut harness = Harness::new(idle_executor(), probe);
        harness
            .connections
            .expect_set_operation()
            .withf(|vc, op| vc.name_any() == "vc1" && *op == ConnectionOperation::VpcConnect)
            .times(1)
            .returning(|_, _| Ok(()));

        let vc = connection(Some(ConnectionOperation::DnsConnect), Some(2));
        let action = harness.reconciler().apply(&vc).await.unwrap();

        assert_eq!(action, Action::await_change());
        // The old observedGeneration stays so the advanced operation runs next
        assert_eq!(
            harness.writes(),
            vec![(
                "vc1".to_string(),
                ConnectionState::DnsRunning,
                Some(2),
                "DNS forwarding is up".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_dns_conflict_leaves_status_alone() {
        let mut probe = MockDnsProbe::new();
        probe.expect_probe().returning(|_, _| Ok(true));
        let mut harness = Harness::new(idle_executor(), probe);
        harness
            .connections
            .expect_set_operation()
            .returning(|_, _| {
                Err(Error::UpdateConflict("object has been modified".to_string()))
            });

        let vc = connection(Some(ConnectionOperation::DnsConnect), Some(2));
        let err = harness.reconciler().apply(&vc).await.unwrap_err();

        assert!(matches!(err, Error::UpdateConflict(_)));
        assert!(harness.writes().is_empty());
    }

    #[tokio::test]
    async fn test_dns_not_connected_wires_route_and_requeues() {
        let mut probe = MockDnsProbe::new();
        probe.expect_probe().times(1).returning(|_, _| Ok(false));
        let mut harness = Harness::new(idle_executor(), probe);
        harness.connections.expect_set_operation().never();

        let vc = connection(Some(ConnectionOperation::DnsConnect), Some(2));
        let action = harness.reconciler().apply(&vc).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
        assert!(harness.writes().is_empty());
        assert_eq!(harness.store.deployment_writes.load(Ordering::SeqCst), 1);
        let deployment =
            serde_json::to_string(&*harness.store.deployment.lock().unwrap()).unwrap();
        assert!(deployment.contains("ip -4 route add 10.96.0.10 via 10.0.2.1 dev net1"));
    }

    #[tokio::test]
    async fn test_unlabelled_connection_gets_gateway_label() {
        let mut harness = Harness::new(idle_executor(), no_probe());
        harness
            .connections
            .expect_label_gateway()
            .withf(|vc| vc.spec.gateway == "gwB")
            .times(1)
            .returning(|_| Ok(()));

        let mut vc = connection(Some(ConnectionOperation::Recover), Some(3));
        vc.labels_mut().clear();
        harness.reconciler().apply(&vc).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_stops_running_connection() {
        let harness = Harness::new(
            script_executor("ip route del 10.1.0.0/16"),
            no_probe(),
        );

        let mut vc = connection(Some(ConnectionOperation::Recover), Some(3));
        if let Some(status) = vc.status.as_mut() {
            status.state = Some(ConnectionState::VpcRunning);
        }
        harness.reconciler().cleanup(&vc).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_of_stopped_connection_is_local() {
        let harness = Harness::new(idle_executor(), no_probe());

        let mut vc = connection(Some(ConnectionOperation::Stop), Some(3));
        if let Some(status) = vc.status.as_mut() {
            status.state = Some(ConnectionState::Stopped);
        }
        harness.reconciler().cleanup(&vc).await.unwrap();
    }
}
