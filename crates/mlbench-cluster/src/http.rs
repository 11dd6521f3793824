//! HTTP client for an external cluster manager service.
//!
//! Endpoints:
//! - `POST   {base}/groups`        create (201/200, 409 if it already exists)
//! - `GET    {base}/groups/{name}` status
//! - `DELETE {base}/groups/{name}` delete (404 counts as deleted)

use std::time::Duration;

use async_trait::async_trait;
use mlbench_core::{Error, Result};
use reqwest::StatusCode;
use tracing::debug;

use crate::cluster::ClusterManager;
use crate::types::{GroupStatus, WorkerGroupSpec};

pub struct HttpCluster {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCluster {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn group_url(&self, group: &str) -> String {
        format!("{}/groups/{}", self.base_url, group)
    }
}

/// Transport failures mean the manager could not be reached.
fn transport_error(e: reqwest::Error) -> Error {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        Error::ProvisioningUnavailable(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

async fn unexpected(resp: reqwest::Response, what: &str) -> Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::BAD_GATEWAY {
        Error::ProvisioningUnavailable(format!("{what}: {status} {body}"))
    } else {
        Error::ClusterManager(format!("{what}: {status} {body}"))
    }
}

#[async_trait]
impl ClusterManager for HttpCluster {
    async fn create_worker_group(&self, spec: &WorkerGroupSpec) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/groups", self.base_url))
            .json(spec)
            .send()
            .await
            .map_err(transport_error)?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => {
                debug!("Worker group {} already exists", spec.name);
                Ok(())
            }
            _ => Err(unexpected(resp, "create worker group").await),
        }
    }

    async fn worker_group_status(&self, group: &str) -> Result<GroupStatus> {
        let resp = self
            .client
            .get(self.group_url(group))
            .send()
            .await
            .map_err(transport_error)?;

        match resp.status() {
            s if s.is_success() => resp
                .json::<GroupStatus>()
                .await
                .map_err(|e| Error::ClusterManager(format!("invalid status body: {e}"))),
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!("worker group {group}"))),
            _ => Err(unexpected(resp, "worker group status").await),
        }
    }

    async fn delete_worker_group(&self, group: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.group_url(group))
            .send()
            .await
            .map_err(transport_error)?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(unexpected(resp, "delete worker group").await),
        }
    }
}
