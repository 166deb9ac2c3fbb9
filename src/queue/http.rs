//! Networked queue backend

use super::{DispatchRequest, QueueError, TaskQueueDispatcher};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Dispatcher for a remote queue service speaking JSON over HTTP
///
/// `POST {base}/sites/{site}/tasks` enqueues, `POST {base}/sites/{site}/tasks/{lock}/finish`
/// releases. The service answers 409 for a lock id it already holds.
#[derive(Debug, Clone)]
pub struct HttpQueue {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct FinishRequest<'a> {
    agent_id: &'a str,
}

impl HttpQueue {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, QueueError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QueueError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into(),
            timeout,
            client,
        })
    }

    fn tasks_url(&self, site_id: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{}/sites/{}/tasks", base, site_id)
    }

    fn finish_url(&self, site_id: &str, lock_id: &str) -> String {
        format!("{}/{}/finish", self.tasks_url(site_id), lock_id)
    }

    /// Map a non-success status to a queue error
    fn map_http_error(&self, status: reqwest::StatusCode, body: &str, lock_id: &str) -> QueueError {
        match status.as_u16() {
            409 => QueueError::conflict(lock_id),
            404 => QueueError::UnknownLock {
                lock_id: lock_id.to_string(),
            },
            408 | 504 => QueueError::Timeout {
                elapsed: self.timeout,
            },
            400..=499 => QueueError::rejected(format!("HTTP {}: {}", status, body)),
            _ => QueueError::unavailable(format!("HTTP {}: {}", status, body)),
        }
    }

    fn map_send_error(&self, err: reqwest::Error) -> QueueError {
        if err.is_timeout() {
            QueueError::Timeout {
                elapsed: self.timeout,
            }
        } else {
            QueueError::unavailable(err.to_string())
        }
    }

    async fn post<B: Serialize + Sync>(
        &self,
        url: String,
        body: &B,
        lock_id: &str,
    ) -> Result<(), QueueError> {
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(self.map_http_error(status, &body, lock_id))
    }
}

#[async_trait]
impl TaskQueueDispatcher for HttpQueue {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<(), QueueError> {
        debug!(lock_id = %request.lock_id, site = %request.site_id, "posting task");
        self.post(self.tasks_url(&request.site_id), request, &request.lock_id)
            .await
    }

    async fn task_finished(
        &self,
        site_id: &str,
        lock_id: &str,
        agent_id: &str,
    ) -> Result<(), QueueError> {
        self.post(
            self.finish_url(site_id, lock_id),
            &FinishRequest { agent_id },
            lock_id,
        )
        .await
    }

    fn name(&self) -> &str {
        "http"
    }
}
