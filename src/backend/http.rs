//! HTTP worker backend client.

use std::time::Duration;

use async_trait::async_trait;

use super::{BackendError, StageRequest, WorkerBackend, WorkerResponse};

/// Talks to a worker backend over HTTP: one POST per stage execution.
pub struct HttpWorkerBackend {
    client: reqwest::Client,
    url: String,
}

impl HttpWorkerBackend {
    pub fn new(url: String, timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Request(e.to_string()))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl WorkerBackend for HttpWorkerBackend {
    async fn execute_stage(&self, request: &StageRequest) -> Result<WorkerResponse, BackendError> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    BackendError::Silence
                } else {
                    BackendError::Request(e.to_string())
                }
            })?;

        let response = response
            .error_for_status()
            .map_err(|e| BackendError::Request(e.to_string()))?;

        response
            .json::<WorkerResponse>()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))
    }
}
