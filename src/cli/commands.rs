//! CLI command implementations

use super::output::OutputHandler;
use super::signals::{CancellationToken, setup_signal_handlers, with_cancellation};
use crate::agent::LocalAgent;
use crate::compiler::{CompiledTaskGraph, Compiler};
use crate::config::{ConfigMap, EngineConfig, QueueBackend, load_workflow};
use crate::executor::{SessionEvent, WorkflowExecutor};
use crate::queue::{InProcessQueue, TaskQueueDispatcher, TimeoutDispatcher};
use crate::session::{AttemptMode, AttemptOptions, Session, SessionId, SessionStatus};
use crate::store::create_store;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, warn};

const COMPLETION_BUFFER: usize = 64;

/// Arguments of `flowd run`
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub file: PathBuf,
    pub project: String,
    /// `key=value` overrides for declared variables
    pub params: Vec<String>,
    pub session_time: Option<DateTime<Utc>>,
    pub mode: AttemptMode,
    /// Local agents per site
    pub agents: usize,
}

fn compile_file(path: &Path, config: &EngineConfig) -> Result<CompiledTaskGraph, String> {
    let def = load_workflow(path)
        .map_err(|e| format!("Failed to load workflow '{}': {:#}", path.display(), e))?;
    Compiler::from_config(config)
        .compile(&def)
        .map_err(|e| format!("Workflow '{}' is invalid: {}", def.name, e))
}

/// Compile a workflow file and print its task tree
pub fn check_workflow(path: &Path, config: &EngineConfig) -> Result<i32, String> {
    let graph = compile_file(path, config)?;
    println!(
        "Workflow '{}' (revision {}) compiles to {} tasks:",
        graph.workflow,
        graph.revision,
        graph.len()
    );
    print!("{}", graph.render_tree());
    Ok(0)
}

/// Parse `key=value` pairs into session parameters
pub fn parse_params(params: &[String]) -> Result<ConfigMap, String> {
    let mut map = ConfigMap::new();
    for param in params {
        let (key, value) = param
            .split_once('=')
            .ok_or_else(|| format!("Invalid parameter '{}': expected key=value", param))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("Invalid parameter '{}': empty key", param));
        }
        map.insert(key, value);
    }
    Ok(map)
}

/// Run one session to completion with in-process agents
///
/// Exit code is 0 only when the session succeeds.
pub async fn run_workflow(
    args: RunArgs,
    config: &EngineConfig,
    handler: &dyn OutputHandler,
) -> Result<i32, String> {
    if config.queue.backend != QueueBackend::Memory {
        return Err("`flowd run` executes tasks locally and needs queue.backend = \"memory\"".into());
    }

    let graph = Arc::new(compile_file(&args.file, config)?);
    let params = parse_params(&args.params)?;
    let stores = create_store(&config.store).map_err(|e| format!("Failed to open store: {}", e))?;

    let queue = Arc::new(InProcessQueue::new());
    let dispatcher: Arc<dyn TaskQueueDispatcher> = Arc::new(TimeoutDispatcher::from_arc(
        Arc::clone(&queue),
        config.executor.dispatch_timeout(),
    ));
    let executor = Arc::new(WorkflowExecutor::new(
        stores.sessions,
        dispatcher,
        config.executor.clone(),
    ));

    let token = CancellationToken::new();
    let (tx, rx) = mpsc::channel(COMPLETION_BUFFER);
    let mut workers = JoinSet::new();
    workers.spawn(Arc::clone(&executor).run(rx, token.clone()));

    let sites: BTreeSet<&str> = graph.nodes.iter().map(|n| n.site.as_str()).collect();
    for site in sites {
        for n in 0..args.agents.max(1) {
            let agent = LocalAgent::new(format!("local-{}-{}", site, n), site, Arc::clone(&queue), tx.clone());
            workers.spawn(agent.run(token.clone()));
        }
    }
    drop(tx);

    let signals = tokio::spawn(setup_signal_handlers(token.clone()));

    let mut events = executor.subscribe();
    let options = AttemptOptions {
        mode: args.mode,
        params,
    };
    let session_time = args.session_time.unwrap_or_else(Utc::now);
    let started = executor
        .start_session(&args.project, Arc::clone(&graph), session_time, options)
        .await;

    let result = match started {
        Ok(session) => {
            let id = session.id.clone();
            if with_cancellation(token.clone(), follow_session(&mut events, &id, handler))
                .await
                .is_none()
            {
                warn!(session = %id, "interrupted, cancelling session");
                if let Err(e) = executor.cancel_session(&id).await {
                    warn!(session = %id, error = %e, "cancel failed");
                }
            }
            executor
                .session(&id)
                .await
                .map_err(|e| e.to_string())
                .and_then(|s| s.ok_or_else(|| format!("Session {} disappeared", id)))
        }
        Err(e) => Err(format!("Failed to start session: {}", e)),
    };

    token.cancel();
    signals.abort();
    while workers.join_next().await.is_some() {}

    let session: Session = result?;
    handler.summary(&session);
    Ok(if session.status == SessionStatus::Success { 0 } else { 1 })
}

/// Forward events for `id` to the handler until the session finishes
async fn follow_session(
    events: &mut broadcast::Receiver<SessionEvent>,
    id: &SessionId,
    handler: &dyn OutputHandler,
) {
    loop {
        match events.recv().await {
            Ok(event) if event.session_id() == id => {
                handler.emit(&event);
                if matches!(event, SessionEvent::SessionFinished { .. }) {
                    return;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(skipped = n, "event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
