use std::time::Duration;

use async_trait::async_trait;
use kube::{
    Api, Client,
    api::{DeleteParams, PostParams},
    runtime::wait::{self, await_condition, conditions},
};
use thiserror::Error;
use tracing::{Level, instrument};

#[cfg(test)]
use mockall::automock;

use crate::api::VirtualServer;

const MANAGER_NAME: &str = "vs-provisioner";

/// How long a delete may take before the old server is considered stuck.
const DELETE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("API error {code} ({reason}): {message}")]
    Api {
        code: u16,
        reason: String,
        message: String,
    },
    #[error("Kube error: {0}")]
    Kube(#[source] kube::Error),
    #[error("Failed waiting for deletion: {0}")]
    Wait(#[from] wait::Error),
    #[error("Deletion did not finish within {0:?}")]
    DeleteTimeout(Duration),
    #[error("Missing field in object metadata")]
    MissingField,
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { code: 404, .. })
    }
}

impl From<kube::Error> for ClientError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => Self::Api {
                code: response.code,
                reason: response.reason,
                message: response.message,
            },
            other => Self::Kube(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// The cluster operations provisioning relies on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VirtualServerClient: Send + Sync {
    /// Remove the server and return once it is gone. A missing server is `NotFound`, not an error.
    async fn delete(&self, namespace: &str, name: &str) -> Result<DeleteOutcome, ClientError>;

    /// Submit a complete document, returning the object as stored by the cluster.
    async fn create(&self, server: &VirtualServer) -> Result<VirtualServer, ClientError>;

    /// Current lifecycle state, see [`VirtualServer::current_state`].
    async fn state(&self, namespace: &str, name: &str) -> Result<String, ClientError>;
}

pub struct KubeVirtualServerClient {
    client: Client,
}

impl KubeVirtualServerClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<VirtualServer> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl VirtualServerClient for KubeVirtualServerClient {
    #[instrument(level = Level::DEBUG, skip(self))]
    async fn delete(&self, namespace: &str, name: &str) -> Result<DeleteOutcome, ClientError> {
        let servers = self.api(namespace);

        let pending = match servers.delete(name, &DeleteParams::foreground()).await {
            Ok(response) => response.left(),
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(DeleteOutcome::NotFound),
            Err(e) => return Err(e.into()),
        };

        // The object lingers until its dependents are gone; a create before
        // then would conflict with it.
        if let Some(uid) = pending.and_then(|server| server.metadata.uid) {
            tracing::info!("Waiting for VirtualServer {}/{} to be removed", namespace, name);
            tokio::time::timeout(
                DELETE_TIMEOUT,
                await_condition(servers, name, conditions::is_deleted(&uid)),
            )
            .await
            .map_err(|_| ClientError::DeleteTimeout(DELETE_TIMEOUT))??;
        }

        Ok(DeleteOutcome::Deleted)
    }

    #[instrument(level = Level::DEBUG, skip_all)]
    async fn create(&self, server: &VirtualServer) -> Result<VirtualServer, ClientError> {
        let namespace = server
            .metadata
            .namespace
            .as_deref()
            .ok_or(ClientError::MissingField)?;

        let pp = PostParams {
            field_manager: Some(MANAGER_NAME.to_string()),
            ..Default::default()
        };

        Ok(self.api(namespace).create(&pp, server).await?)
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn state(&self, namespace: &str, name: &str) -> Result<String, ClientError> {
        let server = self.api(namespace).get(name).await?;
        Ok(server.current_state())
    }
}
