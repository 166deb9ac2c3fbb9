use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use flowd::cli::{
    CancellationToken, OutputMode, RunArgs, ServeArgs, check_workflow, create_handler,
    run_workflow, serve, setup_signal_handlers,
};
use flowd::config::EngineConfig;
use flowd::session::AttemptMode;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "flowd")]
#[command(about = "Workflow orchestration engine - compile task trees and run sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory searched for .flowd/config.toml (defaults to current)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Engine config file, replacing the standard lookup
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Only print the final session status
    #[arg(long, global = true)]
    quiet: bool,

    /// Print events as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum RetryMode {
    /// Re-run only tasks that did not succeed
    Failed,
    /// Re-run every task
    All,
}

impl From<RetryMode> for AttemptMode {
    fn from(mode: RetryMode) -> Self {
        match mode {
            RetryMode::Failed => AttemptMode::RetryFailed,
            RetryMode::All => AttemptMode::RetryAll,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a workflow file and print its task tree
    Check {
        /// Workflow TOML file
        file: PathBuf,
    },

    /// Run one session of a workflow with local agents
    Run {
        /// Workflow TOML file
        file: PathBuf,

        /// Project the session belongs to
        #[arg(long, default_value = "default")]
        project: String,

        /// Variable override, repeatable
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Logical session time (RFC 3339), defaults to now
        #[arg(long)]
        session_time: Option<DateTime<Utc>>,

        /// Start a new attempt of an already finished session time
        #[arg(long, value_enum)]
        retry: Option<RetryMode>,

        /// Local agents per site
        #[arg(long, default_value_t = 1)]
        agents: usize,
    },

    /// Fire workflow schedules from a project tree until interrupted
    Serve {
        /// Directory with one subdirectory of workflow files per project
        root: PathBuf,

        /// Local agents per site
        #[arg(long, default_value_t = 1)]
        agents: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load_file(path)?,
        None => EngineConfig::load(cli.dir.as_deref())?,
    };
    let log_dir = config.logging.resolved_dir();
    let _guard = flowd::logging::init_logging(cli.debug, cli.quiet, log_dir.as_deref())?;

    let result = match cli.command {
        Commands::Check { file } => check_workflow(&file, &config),
        Commands::Run {
            file,
            project,
            params,
            session_time,
            retry,
            agents,
        } => {
            let handler = create_handler(OutputMode::from_flags(cli.json, cli.quiet), cli.debug);
            let args = RunArgs {
                file,
                project,
                params,
                session_time,
                mode: retry.map(AttemptMode::from).unwrap_or_default(),
                agents,
            };
            run_workflow(args, &config, &*handler).await
        }
        Commands::Serve { root, agents } => {
            let token = CancellationToken::new();
            tokio::spawn(setup_signal_handlers(token.clone()));
            serve(ServeArgs { root, agents }, &config, token).await
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
