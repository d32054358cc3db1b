//! Gateway availability watcher
//!
//! Watches the NAT gateway StatefulSets and turns availability edges into
//! operations on the VpcConnections labelled for the gateway:
//!
//! - available replicas 0 -> 1: `Recovery`
//! - available replicas 1 -> 0: `Stop`
//!
//! Events that do not flip availability are ignored, so each transition
//! stamps each connection once. The connection reconciler then carries the
//! operation out; nothing else is shared between the two.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::runtime::watcher::{self, watcher, Config};
use kube::runtime::WatchStreamExt;
use kube::{Api, ResourceExt};
use tracing::{debug, info, warn};

use super::connection_store::ConnectionStore;
use super::context::ControllerState;
#[cfg(feature = "metrics")]
use super::metrics;
use crate::config::{GATEWAY_LABEL, GATEWAY_WORKLOAD_PREFIX};
use crate::crd::ConnectionOperation;
use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Up,
    Down,
}

impl Transition {
    pub fn operation(self) -> ConnectionOperation {
        match self {
            Transition::Up => ConnectionOperation::Recover,
            Transition::Down => ConnectionOperation::Stop,
        }
    }

    fn direction(self) -> &'static str {
        match self {
            Transition::Up => "up",
            Transition::Down => "down",
        }
    }
}

/// Last available-replica count seen per gateway
#[derive(Debug, Default)]
pub struct AvailabilityTracker {
    last: HashMap<String, i32>,
}

impl AvailabilityTracker {
    /// Record `available` for `gateway` and report whether availability flipped
    ///
    /// The first observation of a gateway only sets the baseline.
    pub fn observe(&mut self, gateway: &str, available: i32) -> Option<Transition> {
        let previous = self.last.insert(gateway.to_string(), available)?;
        match (previous > 0, available > 0) {
            (false, true) => Some(Transition::Up),
            (true, false) => Some(Transition::Down),
            _ => None,
        }
    }

    pub fn forget(&mut self, gateway: &str) {
        self.last.remove(gateway);
    }
}

/// Logical gateway name of a gateway StatefulSet
pub fn gateway_name(workload: &str) -> &str {
    workload
        .strip_prefix(GATEWAY_WORKLOAD_PREFIX)
        .unwrap_or(workload)
}

fn available_replicas(sts: &StatefulSet) -> i32 {
    sts.status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0)
}

/// Write the transition's operation onto every connection of `gateway`
///
/// The connection list is taken first, then each connection is updated on
/// its own. A failed update is logged and skipped. Returns how many
/// connections were stamped.
pub async fn stamp_connections(
    store: &dyn ConnectionStore,
    gateway: &str,
    transition: Transition,
) -> usize {
    let operation = transition.operation();
    let connections = match store.list_for_gateway(gateway).await {
        Ok(connections) => connections,
        Err(e) => {
            warn!("Failed to list connections of gateway {}: {}", gateway, e);
            return 0;
        }
    };

    let mut stamped = 0;
    for connection in &connections {
        let result = store.set_operation(connection, operation).await;

        #[cfg(feature = "metrics")]
        metrics::inc_operation_stamped(&operation.to_string(), result.is_ok());

        match result {
            Ok(()) => {
                debug!("Set {} on connection {}", operation, connection.name_any());
                stamped += 1;
            }
            Err(e) => warn!(
                "Failed to set {} on connection {}: {}",
                operation,
                connection.name_any(),
                e
            ),
        }
    }

    info!(
        "Gateway {} went {}: {} of {} connection(s) set to {}",
        gateway,
        transition.direction(),
        stamped,
        connections.len(),
        operation
    );
    stamped
}

pub struct GatewayWatcher {
    store: Arc<dyn ConnectionStore>,
    tracker: AvailabilityTracker,
}

impl GatewayWatcher {
    pub fn new(store: Arc<dyn ConnectionStore>) -> Self {
        Self {
            store,
            tracker: AvailabilityTracker::default(),
        }
    }

    /// Handle an added or modified gateway StatefulSet
    pub async fn handle_apply(&mut self, sts: &StatefulSet) -> Option<Transition> {
        let workload = sts.name_any();
        let gateway = gateway_name(&workload);
        let transition = self.tracker.observe(gateway, available_replicas(sts))?;

        #[cfg(feature = "metrics")]
        metrics::inc_gateway_transition(gateway, transition.direction());

        stamp_connections(self.store.as_ref(), gateway, transition).await;
        Some(transition)
    }

    pub fn handle_delete(&mut self, sts: &StatefulSet) {
        let workload = sts.name_any();
        self.tracker.forget(gateway_name(&workload));
    }

    /// Watch gateway StatefulSets until the stream ends
    pub async fn run(mut self, api: Api<StatefulSet>) -> Result<()> {
        let selector = format!("{}=true", GATEWAY_LABEL);
        let mut stream = watcher(api, Config::default().labels(&selector))
            .default_backoff()
            .boxed();

        info!("Starting gateway watcher ({})", selector);

        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(sts)) | Ok(watcher::Event::InitApply(sts)) => {
                    self.handle_apply(&sts).await;
                }
                Ok(watcher::Event::Delete(sts)) => self.handle_delete(&sts),
                Ok(watcher::Event::Init) => debug!("Gateway watcher (re)listing"),
                Ok(watcher::Event::InitDone) => debug!("Gateway watcher in sync"),
                Err(e) => warn!("Gateway watch error: {}", e),
            }
        }

        warn!("Gateway watcher stream ended");
        Ok(())
    }
}

pub async fn run_gateway_watcher(state: Arc<ControllerState>) -> Result<()> {
    let api: Api<StatefulSet> = Api::namespaced(
        state.client.clone(),
        &state.config.gateway_namespace,
    );
    GatewayWatcher::new(state.connections.clone()).run(api).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::connection_store::MockConnectionStore;
    use crate::crd::{VpcConnection, VpcConnectionSpec};
    use crate::error::Error;
    use k8s_openapi::api::apps::v1::StatefulSetStatus;
    use kube::api::ObjectMeta;
    use std::sync::Mutex;

    fn gateway_sts(available: i32) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some("vpc-nat-gw-gwB".to_string()),
                namespace: Some("kube-system".to_string()),
                ..Default::default()
            },
            status: Some(StatefulSetStatus {
                available_replicas: Some(available),
                replicas: 1,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn connection(name: &str) -> VpcConnection {
        let mut vc = VpcConnection::new(
            name,
            VpcConnectionSpec {
                vpc: "vpc1".to_string(),
                gateway: "gwB".to_string(),
                subnet_cidr: Some("10.1.0.0/16".to_string()),
                subnet_ip: None,
                operation: Some(ConnectionOperation::VpcConnect),
            },
        );
        vc.metadata.namespace = Some("default".to_string());
        vc
    }

    /// Mock store listing three connections and recording every write
    fn recording_store(writes: Arc<Mutex<Vec<(String, ConnectionOperation)>>>) -> MockConnectionStore {
        let mut store = MockConnectionStore::new();
        store
            .expect_list_for_gateway()
            .withf(|gw| gw == "gwB")
            .returning(|_| Ok(vec![connection("vc1"), connection("vc2"), connection("vc3")]));
        store.expect_set_operation().returning(move |vc, op| {
            writes.lock().unwrap().push((vc.name_any(), op));
            Ok(())
        });
        store
    }

    #[test]
    fn test_first_observation_is_baseline() {
        let mut tracker = AvailabilityTracker::default();
        assert_eq!(tracker.observe("gwB", 0), None);
        assert_eq!(tracker.observe("gwB", 0), None);
        assert_eq!(tracker.observe("gwB", 1), Some(Transition::Up));
        assert_eq!(tracker.observe("gwB", 1), None);
        assert_eq!(tracker.observe("gwB", 0), Some(Transition::Down));
    }

    #[test]
    fn test_gateways_tracked_independently() {
        let mut tracker = AvailabilityTracker::default();
        tracker.observe("gwA", 1);
        tracker.observe("gwB", 0);
        assert_eq!(tracker.observe("gwB", 1), Some(Transition::Up));
        assert_eq!(tracker.observe("gwA", 1), None);

        tracker.forget("gwA");
        assert_eq!(tracker.observe("gwA", 0), None);
    }

    #[test]
    fn test_gateway_name() {
        assert_eq!(gateway_name("vpc-nat-gw-gwB"), "gwB");
        assert_eq!(gateway_name("custom"), "custom");
    }

    #[tokio::test]
    async fn test_gateway_up_recovers_all_connections() {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let mut watcher = GatewayWatcher::new(Arc::new(recording_store(writes.clone())));

        assert_eq!(watcher.handle_apply(&gateway_sts(0)).await, None);
        assert_eq!(watcher.handle_apply(&gateway_sts(1)).await, Some(Transition::Up));

        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().all(|(_, op)| *op == ConnectionOperation::Recover));
        let names: Vec<_> = writes.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["vc1", "vc2", "vc3"]);
    }

    #[tokio::test]
    async fn test_gateway_down_stops_once_per_transition() {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let mut watcher = GatewayWatcher::new(Arc::new(recording_store(writes.clone())));

        watcher.handle_apply(&gateway_sts(1)).await;
        watcher.handle_apply(&gateway_sts(0)).await;
        // Status churn without an availability flip
        watcher.handle_apply(&gateway_sts(0)).await;
        watcher.handle_apply(&gateway_sts(0)).await;

        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().all(|(_, op)| *op == ConnectionOperation::Stop));
    }

    #[tokio::test]
    async fn test_failed_update_does_not_block_the_rest() {
        let mut store = MockConnectionStore::new();
        store
            .expect_list_for_gateway()
            .returning(|_| Ok(vec![connection("vc1"), connection("vc2"), connection("vc3")]));
        store.expect_set_operation().returning(|vc, _| {
            if vc.name_any() == "vc2" {
                Err(Error::UpdateConflict("object has been modified".to_string()))
            } else {
                Ok(())
            }
        });

        let stamped = stamp_connections(&store, "gwB", Transition::Up).await;
        assert_eq!(stamped, 2);
    }

    #[tokio::test]
    async fn test_list_failure_stamps_nothing() {
        let mut store = MockConnectionStore::new();
        store
            .expect_list_for_gateway()
            .returning(|gw| Err(Error::not_found("VpcConnection list", gw)));
        store.expect_set_operation().never();

        assert_eq!(stamp_connections(&store, "gwB", Transition::Down).await, 0);
    }

    #[tokio::test]
    async fn test_deleted_gateway_starts_from_new_baseline() {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let mut watcher = GatewayWatcher::new(Arc::new(recording_store(writes.clone())));

        watcher.handle_apply(&gateway_sts(1)).await;
        watcher.handle_delete(&gateway_sts(1));
        assert_eq!(watcher.handle_apply(&gateway_sts(0)).await, None);
        assert!(writes.lock().unwrap().is_empty());
    }
}
