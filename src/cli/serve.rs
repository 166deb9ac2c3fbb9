//! `flowd serve`: keep workflow schedules firing until interrupted
//!
//! Workflows live at `{root}/{project}/{workflow}.toml`. Every workflow with
//! a `schedule` gets one schedule entry; entries whose rule is unchanged keep
//! their next slot, so a restart catches up on missed slots instead of
//! skipping them.

use super::signals::CancellationToken;
use crate::agent::LocalAgent;
use crate::compiler::Compiler;
use crate::config::{EngineConfig, QueueBackend};
use crate::executor::WorkflowExecutor;
use crate::queue::{InProcessQueue, TaskQueueDispatcher, TimeoutDispatcher};
use crate::store::{FileProjectStore, ProjectStore, ScheduleStore, create_store};
use crate::trigger::{ScheduleEntry, ScheduleTrigger};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

const COMPLETION_BUFFER: usize = 64;

/// Arguments of `flowd serve`
#[derive(Debug, Clone)]
pub struct ServeArgs {
    /// Directory holding one subdirectory per project
    pub root: PathBuf,
    /// Local agents per site
    pub agents: usize,
}

/// Outcome of matching workflow files against stored schedules
#[derive(Debug, Default, PartialEq)]
pub struct ScheduleSync {
    pub registered: usize,
    pub kept: usize,
    pub removed: usize,
    /// Sites used by scheduled workflows
    pub sites: BTreeSet<String>,
}

/// `(project, workflow)` for every `.toml` file one level below `root`
pub fn scan_workflows(root: &Path) -> Result<Vec<(String, String)>, String> {
    let read = |dir: &Path| {
        std::fs::read_dir(dir).map_err(|e| format!("Failed to read '{}': {}", dir.display(), e))
    };

    let mut found = Vec::new();
    for project in read(root)?.flatten() {
        let project_dir = project.path();
        if !project_dir.is_dir() {
            continue;
        }
        let project_name = project.file_name().to_string_lossy().into_owned();
        for file in read(&project_dir)?.flatten() {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                found.push((project_name.clone(), stem.to_string()));
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Register, keep or drop schedule entries to match the workflow files
///
/// A file that fails to load or compile leaves its existing entry alone.
pub fn sync_schedules(
    projects: &FileProjectStore,
    schedules: &dyn ScheduleStore,
    compiler: &Compiler,
    now: DateTime<Utc>,
) -> Result<ScheduleSync, String> {
    let existing = schedules
        .list()
        .map_err(|e| format!("Failed to list schedules: {}", e))?;
    let mut sync = ScheduleSync::default();
    let mut wanted = HashSet::new();

    for (project, workflow) in scan_workflows(projects.root())? {
        let graph = projects
            .load(&project, &workflow)
            .map_err(|e| e.to_string())
            .and_then(|def| {
                compiler
                    .compile(&def)
                    .map(|graph| (def.schedule, graph))
                    .map_err(|e| e.to_string())
            });
        let (rule, graph) = match graph {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(project = %project, workflow = %workflow, error = %e, "skipping workflow");
                wanted.insert((project, workflow));
                continue;
            }
        };
        let Some(rule) = rule else {
            continue;
        };

        sync.sites
            .extend(graph.nodes.iter().map(|n| n.site.clone()));
        let current = existing
            .iter()
            .find(|e| e.project == project && e.workflow == workflow);
        if current.is_some_and(|e| e.rule == rule) {
            sync.kept += 1;
        } else {
            let entry = ScheduleEntry::new(&project, &workflow, rule, now);
            schedules
                .register(&entry)
                .map_err(|e| format!("Failed to register schedule: {}", e))?;
            info!(project = %project, workflow = %workflow, next = %entry.next_run_time, "schedule registered");
            sync.registered += 1;
        }
        wanted.insert((project, workflow));
    }

    for entry in &existing {
        if wanted.contains(&(entry.project.clone(), entry.workflow.clone())) {
            continue;
        }
        if schedules
            .remove(&entry.project, &entry.workflow)
            .map_err(|e| format!("Failed to remove schedule: {}", e))?
        {
            info!(project = %entry.project, workflow = %entry.workflow, "schedule removed");
            sync.removed += 1;
        }
    }
    Ok(sync)
}

/// Run the executor, local agents and the schedule trigger until `token` fires
pub async fn serve(
    args: ServeArgs,
    config: &EngineConfig,
    token: CancellationToken,
) -> Result<i32, String> {
    if config.queue.backend != QueueBackend::Memory {
        return Err("`flowd serve` executes tasks locally and needs queue.backend = \"memory\"".into());
    }

    let stores = create_store(&config.store).map_err(|e| format!("Failed to open store: {}", e))?;
    let projects = Arc::new(FileProjectStore::new(&args.root));
    let sync = sync_schedules(
        &projects,
        stores.schedules.as_ref(),
        &Compiler::from_config(config),
        Utc::now(),
    )?;
    info!(
        root = %args.root.display(),
        registered = sync.registered,
        kept = sync.kept,
        removed = sync.removed,
        "schedules loaded"
    );

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
    let recovered = executor.recover().map_err(|e| format!("Recovery failed: {}", e))?;

    let mut sites = sync.sites;
    for id in executor.active_sessions() {
        if let Ok(Some(session)) = executor.session(&id).await {
            sites.extend(session.graph.nodes.iter().map(|n| n.site.clone()));
        }
    }
    info!(recovered, sites = sites.len(), "serving");

    let (tx, rx) = mpsc::channel(COMPLETION_BUFFER);
    let mut workers = JoinSet::new();
    workers.spawn(Arc::clone(&executor).run(rx, token.clone()));
    for site in &sites {
        for n in 0..args.agents.max(1) {
            let agent = LocalAgent::new(format!("serve-{}-{}", site, n), site, Arc::clone(&queue), tx.clone());
            workers.spawn(agent.run(token.clone()));
        }
    }
    drop(tx);

    let trigger = ScheduleTrigger::new(
        executor,
        stores.schedules,
        projects,
        Compiler::from_config(config),
        config.trigger.clone(),
    );
    workers.spawn(trigger.run(token.clone()));

    let mut stop = token;
    stop.cancelled().await;
    while workers.join_next().await.is_some() {}
    info!("serve stopped");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutorConfig, StoreBackend, TriggerConfig};
    use crate::queue::NoopDispatcher;
    use crate::store::{MemoryStore, ScheduleStore, SessionStore};
    use crate::trigger::RecurrenceRule;
    use std::fs;
    use std::time::Duration;

    const NIGHTLY: &str = r#"
name = "nightly"
schedule = { interval = { minutes = 10 } }

[[tasks]]
name = "a"
operator = "echo"
"#;

    const ADHOC: &str = "name = \"adhoc\"\n[[tasks]]\nname = \"a\"\noperator = \"echo\"\n";

    fn t(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn project(root: &Path, files: &[(&str, &str)]) {
        let dir = root.join("acme");
        fs::create_dir_all(&dir).unwrap();
        for (name, body) in files {
            fs::write(dir.join(format!("{}.toml", name)), body).unwrap();
        }
    }

    #[test]
    fn test_scan_workflows() {
        let dir = tempfile::tempdir().unwrap();
        project(dir.path(), &[("nightly", NIGHTLY), ("adhoc", ADHOC)]);
        fs::write(dir.path().join("acme").join("notes.txt"), "x").unwrap();
        fs::write(dir.path().join("stray.toml"), "x").unwrap();

        let found = scan_workflows(dir.path()).unwrap();
        assert_eq!(
            found,
            vec![
                ("acme".to_string(), "adhoc".to_string()),
                ("acme".to_string(), "nightly".to_string()),
            ]
        );
        assert!(scan_workflows(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_sync_registers_keeps_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        project(dir.path(), &[("nightly", NIGHTLY), ("adhoc", ADHOC), ("broken", "not toml [")]);
        let projects = FileProjectStore::new(dir.path());
        let store = MemoryStore::new();
        let compiler = Compiler::default();

        let sync = sync_schedules(&projects, &store, &compiler, t("2026-04-01T09:55:00Z")).unwrap();
        assert_eq!((sync.registered, sync.kept, sync.removed), (1, 0, 0));
        assert_eq!(sync.sites, BTreeSet::from(["default".to_string()]));
        let entries = store.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].workflow, "nightly");
        assert_eq!(entries[0].next_run_time, t("2026-04-01T10:00:00Z"));

        // Same rule on restart: the pending slot is kept
        let sync = sync_schedules(&projects, &store, &compiler, t("2026-04-01T11:00:00Z")).unwrap();
        assert_eq!((sync.registered, sync.kept, sync.removed), (0, 1, 0));
        assert_eq!(store.list().unwrap()[0].next_run_time, t("2026-04-01T10:00:00Z"));

        // A changed rule starts over from now
        project(dir.path(), &[("nightly", &NIGHTLY.replace("10", "30"))]);
        let sync = sync_schedules(&projects, &store, &compiler, t("2026-04-01T11:00:00Z")).unwrap();
        assert_eq!((sync.registered, sync.kept), (1, 0));
        let entry = &store.list().unwrap()[0];
        assert_eq!(entry.rule, RecurrenceRule::Interval { minutes: 30 });
        assert_eq!(entry.next_run_time, t("2026-04-01T11:30:00Z"));

        // Dropping the schedule drops the entry
        project(dir.path(), &[("nightly", &NIGHTLY.replace("schedule", "description = \"x\"\n#"))]);
        let sync = sync_schedules(&projects, &store, &compiler, t("2026-04-01T11:00:00Z")).unwrap();
        assert_eq!(sync.removed, 1);
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_sync_keeps_entry_of_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        project(dir.path(), &[("nightly", NIGHTLY)]);
        let projects = FileProjectStore::new(dir.path());
        let store = MemoryStore::new();
        let compiler = Compiler::default();
        sync_schedules(&projects, &store, &compiler, Utc::now()).unwrap();

        project(dir.path(), &[("nightly", "not toml [")]);
        let sync = sync_schedules(&projects, &store, &compiler, Utc::now()).unwrap();
        assert_eq!(sync.removed, 0);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_synced_schedule_fires() {
        let dir = tempfile::tempdir().unwrap();
        project(dir.path(), &[("nightly", NIGHTLY)]);
        let projects = Arc::new(FileProjectStore::new(dir.path()));
        let store = Arc::new(MemoryStore::new());
        sync_schedules(&projects, store.as_ref(), &Compiler::default(), t("2026-04-01T09:55:00Z"))
            .unwrap();

        let executor = Arc::new(WorkflowExecutor::new(
            store.clone(),
            Arc::new(NoopDispatcher::new()),
            ExecutorConfig::default(),
        ));
        let trigger = ScheduleTrigger::new(
            executor.clone(),
            store.clone(),
            projects,
            Compiler::default(),
            TriggerConfig::default(),
        );
        let report = trigger.tick(t("2026-04-01T10:00:05Z")).await.unwrap();
        assert_eq!(report.fired.len(), 1);

        let session = store.load_active().unwrap().pop().unwrap();
        assert_eq!(session.key.project, "acme");
        assert_eq!(session.key.workflow, "nightly");
        assert_eq!(session.key.session_time, t("2026-04-01T10:00:00Z"));
    }

    #[tokio::test]
    async fn test_serve_registers_and_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("projects");
        project(&root, &[("nightly", NIGHTLY)]);
        let mut config = EngineConfig::default();
        config.store.backend = StoreBackend::Sqlite;
        config.store.path = Some(dir.path().join("flowd.db").to_string_lossy().into_owned());

        let token = CancellationToken::new();
        let args = ServeArgs {
            root: root.clone(),
            agents: 1,
        };
        let server = {
            let config = config.clone();
            let token = token.clone();
            tokio::spawn(async move { serve(args, &config, token).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        let code = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, Ok(0));

        let stores = create_store(&config.store).unwrap();
        let entries = stores.schedules.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].project, "acme");
    }

    #[tokio::test]
    async fn test_serve_requires_memory_queue() {
        let mut config = EngineConfig::default();
        config.queue.backend = QueueBackend::Noop;
        let args = ServeArgs {
            root: PathBuf::from("missing"),
            agents: 1,
        };
        let err = serve(args, &config, CancellationToken::new()).await.unwrap_err();
        assert!(err.contains("memory"));
    }
}
