//! In-process agent that pulls tasks from the memory queue and runs them

pub mod operators;
pub mod process;

pub use operators::{OperatorError, execute};
pub use process::{ProcessError, ProcessOutput, run_shell};

use crate::cli::CancellationToken;
use crate::executor::{TaskCompletion, TaskOutcome};
use crate::queue::{DispatchRequest, InProcessQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default wait for a task before re-checking for shutdown
const DEFAULT_POLL_WAIT: Duration = Duration::from_millis(500);

/// Worker bound to one site of an [`InProcessQueue`]
pub struct LocalAgent {
    id: String,
    site_id: String,
    queue: Arc<InProcessQueue>,
    completions: mpsc::Sender<TaskCompletion>,
    poll_wait: Duration,
}

impl LocalAgent {
    pub fn new(
        id: impl Into<String>,
        site_id: impl Into<String>,
        queue: Arc<InProcessQueue>,
        completions: mpsc::Sender<TaskCompletion>,
    ) -> Self {
        Self {
            id: id.into(),
            site_id: site_id.into(),
            queue,
            completions,
            poll_wait: DEFAULT_POLL_WAIT,
        }
    }

    pub fn with_poll_wait(mut self, wait: Duration) -> Self {
        self.poll_wait = wait;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and run at most one task; returns whether one was run
    ///
    /// Returns `false` as well when the completion channel is closed.
    pub async fn run_once(&self) -> bool {
        let Some(request) = self
            .queue
            .poll_wait(&self.site_id, &self.id, self.poll_wait)
            .await
        else {
            return false;
        };
        let completion = self.execute(&request).await;
        if self.completions.send(completion).await.is_err() {
            warn!(agent = %self.id, lock_id = %request.lock_id, "completion channel closed");
            return false;
        }
        true
    }

    async fn execute(&self, request: &DispatchRequest) -> TaskCompletion {
        debug!(
            agent = %self.id,
            task = %request.task_name,
            operator = %request.operator,
            attempt = request.attempt,
            "executing task"
        );
        let outcome = match execute(&request.operator, &request.config).await {
            Ok(output) => TaskOutcome::success(output),
            Err(e) => {
                debug!(agent = %self.id, task = %request.task_name, error = %e, "task failed");
                TaskOutcome::failure(e.to_string())
            }
        };
        TaskCompletion {
            lock_id: request.lock_id.clone(),
            agent_id: self.id.clone(),
            outcome,
        }
    }

    /// Work until `token` fires or the executor stops listening
    pub async fn run(self, mut token: CancellationToken) {
        info!(agent = %self.id, site = %self.site_id, "agent started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                ran = self.run_once() => {
                    if !ran && self.completions.is_closed() {
                        break;
                    }
                }
            }
        }
        info!(agent = %self.id, "agent stopped");
    }
}
