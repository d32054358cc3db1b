//! Remote command execution inside gateway pods
//!
//! Opens one exec stream per call, writes nothing to stdin and captures both
//! output streams. Anything written to stderr counts as a failure, so the
//! commands handed to the executor must be silent on success.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};

use super::locator::PodRef;
use crate::error::{Error, Result};

/// Runs shell text inside a container of a located pod
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` through `sh -c` and return its stdout
    async fn exec(&self, pod: &PodRef, container: &str, command: &str) -> Result<String>;
}

/// [`RemoteExecutor`] backed by the Kubernetes pod exec subresource
pub struct PodExecutor {
    client: Client,
    timeout: Duration,
}

impl PodExecutor {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn run(&self, pod: &PodRef, container: &str, command: &str) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = pods
            .exec(&pod.name, vec!["sh", "-c", command], &params)
            .await
            .map_err(|e| Error::RemoteExecutionFailed {
                pod: pod.to_string(),
                message: e.to_string(),
            })?;

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let (stdout, stderr) = tokio::join!(read_stream(stdout), read_stream(stderr));

        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        attached.join().await.map_err(|e| Error::RemoteExecutionFailed {
            pod: pod.to_string(),
            message: e.to_string(),
        })?;

        check_output(pod, stdout, stderr, status.as_ref())
    }
}

#[async_trait]
impl RemoteExecutor for PodExecutor {
    #[instrument(skip(self, command), fields(pod = %pod))]
    async fn exec(&self, pod: &PodRef, container: &str, command: &str) -> Result<String> {
        debug!("Executing in {}/{}: {}", pod, container, command);
        let result = match tokio::time::timeout(self.timeout, self.run(pod, container, command)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::RemoteExecutionFailed {
                pod: pod.to_string(),
                message: format!("command did not finish within {:?}", self.timeout),
            }),
        };

        #[cfg(feature = "metrics")]
        super::metrics::inc_remote_command(result.is_ok());

        result
    }
}

async fn read_stream<R>(stream: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        // A broken stream surfaces through the exec status
        let _ = stream.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Decide the outcome of an exec from its captured streams and final status
pub(crate) fn check_output(
    pod: &PodRef,
    stdout: String,
    stderr: String,
    status: Option<&Status>,
) -> Result<String> {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return Err(Error::RemoteExecutionFailed {
            pod: pod.to_string(),
            message: stderr.to_string(),
        });
    }

    if let Some(status) = status {
        if status.status.as_deref() == Some("Failure") {
            let message = status
                .message
                .clone()
                .unwrap_or_else(|| "command exited with failure".to_string());
            return Err(Error::RemoteExecutionFailed {
                pod: pod.to_string(),
                message,
            });
        }
    }

    Ok(stdout.trim().to_string())
}
