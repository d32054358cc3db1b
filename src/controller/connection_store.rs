//! Read and write access to VpcConnections for the watcher and reconciler

use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde_json::json;

use crate::config::CONNECTION_GATEWAY_LABEL;
use crate::crd::{ConnectionOperation, VpcConnection};
use crate::error::Result;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Every VpcConnection labelled for `gateway`, across namespaces
    async fn list_for_gateway(&self, gateway: &str) -> Result<Vec<VpcConnection>>;

    /// Write the desired operation, failing with `UpdateConflict` when the
    /// object changed since `connection` was read
    async fn set_operation(
        &self,
        connection: &VpcConnection,
        operation: ConnectionOperation,
    ) -> Result<()>;

    /// Label the connection with its `spec.gateway` so the watcher finds it
    async fn label_gateway(&self, connection: &VpcConnection) -> Result<()>;
}

pub struct KubeConnectionStore {
    client: Client,
}

impl KubeConnectionStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConnectionStore for KubeConnectionStore {
    async fn list_for_gateway(&self, gateway: &str) -> Result<Vec<VpcConnection>> {
        let api: Api<VpcConnection> = Api::all(self.client.clone());
        let selector = format!("{}={}", CONNECTION_GATEWAY_LABEL, gateway);
        let list = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(list.items)
    }

    async fn set_operation(
        &self,
        connection: &VpcConnection,
        operation: ConnectionOperation,
    ) -> Result<()> {
        let namespace = connection.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<VpcConnection> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &connection.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&operation_patch(connection, operation)),
        )
        .await?;
        Ok(())
    }

    async fn label_gateway(&self, connection: &VpcConnection) -> Result<()> {
        let namespace = connection.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<VpcConnection> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &connection.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&gateway_label_patch(connection)),
        )
        .await?;
        Ok(())
    }
}

/// True when the connection carries the label of its current gateway
pub fn has_gateway_label(connection: &VpcConnection) -> bool {
    connection.labels().get(CONNECTION_GATEWAY_LABEL) == Some(&connection.spec.gateway)
}

pub(crate) fn gateway_label_patch(connection: &VpcConnection) -> serde_json::Value {
    json!({
        "metadata": { "labels": { CONNECTION_GATEWAY_LABEL: connection.spec.gateway } },
    })
}

/// Merge patch carrying the resourceVersion the write is based on
pub(crate) fn operation_patch(
    connection: &VpcConnection,
    operation: ConnectionOperation,
) -> serde_json::Value {
    json!({
        "metadata": { "resourceVersion": connection.resource_version() },
        "spec": { "operation": operation },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::VpcConnectionSpec;

    fn connection() -> VpcConnection {
        VpcConnection::new(
            "vc1",
            VpcConnectionSpec {
                vpc: "vpc1".to_string(),
                gateway: "gwB".to_string(),
                subnet_cidr: None,
                subnet_ip: None,
                operation: None,
            },
        )
    }

    #[test]
    fn test_gateway_label() {
        let mut connection = connection();
        assert!(!has_gateway_label(&connection));
        assert_eq!(gateway_label_patch(&connection)["metadata"]["labels"]["gateway"], "gwB");

        connection
            .labels_mut()
            .insert("gateway".to_string(), "gwA".to_string());
        assert!(!has_gateway_label(&connection));

        connection
            .labels_mut()
            .insert("gateway".to_string(), "gwB".to_string());
        assert!(has_gateway_label(&connection));
    }

    #[test]
    fn test_operation_patch_is_conditional() {
        let mut connection = connection();
        connection.metadata.resource_version = Some("4711".to_string());

        let patch = operation_patch(&connection, ConnectionOperation::Recover);
        assert_eq!(patch["metadata"]["resourceVersion"], "4711");
        assert_eq!(patch["spec"]["operation"], "Recovery");
    }
}
