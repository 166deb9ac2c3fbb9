//! Schedule trigger loop

use super::schedule::ScheduleEntry;
use crate::cli::CancellationToken;
use crate::compiler::Compiler;
use crate::config::TriggerConfig;
use crate::executor::{ExecutorError, WorkflowExecutor};
use crate::session::{AttemptOptions, SessionId};
use crate::store::{ProjectStore, ScheduleStore, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerReport {
    /// (schedule id, session started for the slot)
    pub fired: Vec<(String, SessionId)>,
    /// Slots whose session already existed
    pub skipped: usize,
    /// Slots left in place for the next tick
    pub failed: usize,
}

enum SlotResult {
    Fired(SessionId),
    AlreadyStarted,
}

/// Starts a session for every due schedule slot
///
/// A slot is only consumed once its session exists, either because this
/// tick started it or because an earlier start already did.
pub struct ScheduleTrigger {
    executor: Arc<WorkflowExecutor>,
    schedules: Arc<dyn ScheduleStore>,
    projects: Arc<dyn ProjectStore>,
    compiler: Compiler,
    config: TriggerConfig,
}

impl ScheduleTrigger {
    pub fn new(
        executor: Arc<WorkflowExecutor>,
        schedules: Arc<dyn ScheduleStore>,
        projects: Arc<dyn ProjectStore>,
        compiler: Compiler,
        config: TriggerConfig,
    ) -> Self {
        Self {
            executor,
            schedules,
            projects,
            compiler,
            config,
        }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TriggerReport, StoreError> {
        let mut report = TriggerReport::default();
        for mut entry in self.schedules.next_due_entries(now)? {
            // Catch up one slot at a time; stop at the first slot that fails
            while entry.is_due(now) {
                let slot = entry.next_run_time;
                match self.fire(&entry).await {
                    Ok(SlotResult::Fired(session_id)) => {
                        info!(schedule = %entry.id, workflow = %entry.workflow, slot = %slot, session = %session_id, "schedule fired");
                        entry.last_session = Some(session_id.clone());
                        entry.last_session_time = Some(slot);
                        report.fired.push((entry.id.clone(), session_id));
                    }
                    Ok(SlotResult::AlreadyStarted) => {
                        debug!(schedule = %entry.id, slot = %slot, "slot already has a session");
                        report.skipped += 1;
                    }
                    Err(e) => {
                        warn!(schedule = %entry.id, workflow = %entry.workflow, slot = %slot, error = %e, "schedule start failed");
                        report.failed += 1;
                        break;
                    }
                }
                entry.advance();
                self.schedules.update_entry(&entry)?;
            }
        }
        Ok(report)
    }

    async fn fire(&self, entry: &ScheduleEntry) -> anyhow::Result<SlotResult> {
        let definition = self.projects.load(&entry.project, &entry.workflow)?;
        let graph = Arc::new(self.compiler.compile(&definition)?);
        match self
            .executor
            .start_session(
                &entry.project,
                graph,
                entry.next_run_time,
                AttemptOptions::fresh(),
            )
            .await
        {
            Ok(session) => Ok(SlotResult::Fired(session.id)),
            Err(ExecutorError::SessionConflict { .. }) => Ok(SlotResult::AlreadyStarted),
            Err(e) => Err(e.into()),
        }
    }

    /// Tick on the configured interval until `token` fires
    pub async fn run(self, mut token: CancellationToken) {
        if !self.config.enabled {
            info!("schedule trigger disabled");
            return;
        }
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        warn!(error = %e, "schedule tick failed");
                    }
                }
            }
        }
        debug!("schedule trigger stopped");
    }
}
