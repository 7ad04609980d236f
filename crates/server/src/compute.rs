//! Workspace compute teardown.
//!
//! When a client disconnects the gateway asks the orchestrator to stop the
//! workspace's backing compute. The call is best-effort: failures are logged
//! by the caller and never retried.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("stop request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("orchestrator answered {0}")]
    Status(reqwest::StatusCode),
}

#[async_trait]
pub trait ComputeLifecycle: Send + Sync {
    async fn stop_workspace(&self, owner: &str, workspace: &str) -> Result<(), ComputeError>;
}

/// `POST {base_url}/{owner}/{workspace}/stop`
pub struct HttpCompute {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCompute {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ComputeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn stop_url(&self, owner: &str, workspace: &str) -> String {
        format!("{}/{}/{}/stop", self.base_url, owner, workspace)
    }
}

#[async_trait]
impl ComputeLifecycle for HttpCompute {
    async fn stop_workspace(&self, owner: &str, workspace: &str) -> Result<(), ComputeError> {
        let response = self
            .client
            .post(self.stop_url(owner, workspace))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ComputeError::Status(response.status()))
        }
    }
}

/// Used when no orchestrator is configured.
pub struct NoopCompute;

#[async_trait]
impl ComputeLifecycle for NoopCompute {
    async fn stop_workspace(&self, _owner: &str, _workspace: &str) -> Result<(), ComputeError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_stop_url() {
        let compute = HttpCompute::new("http://orchestrator:3002").unwrap();
        assert_eq!(
            compute.stop_url("alice", "proj1"),
            "http://orchestrator:3002/alice/proj1/stop"
        );
    }

    #[tokio::test]
    async fn unreachable_orchestrator_is_an_error() {
        let compute = HttpCompute::new("http://127.0.0.1:9").unwrap();
        assert!(compute.stop_workspace("alice", "proj1").await.is_err());
    }
}
