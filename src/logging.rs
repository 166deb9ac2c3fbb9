use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE_PREFIX: &str = "flowd.log";

fn default_filter(debug: bool, quiet: bool) -> &'static str {
    if debug {
        "flowd=debug"
    } else if quiet {
        "flowd=error"
    } else {
        "flowd=info"
    }
}

/// Initialize logging on stderr, plus a daily rolling file under `log_dir`
///
/// `RUST_LOG` overrides the level chosen from the flags. The returned guard
/// flushes the file writer and must be held until exit.
pub fn init_logging(
    debug: bool,
    quiet: bool,
    log_dir: Option<&Path>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(debug, quiet)));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_line_number(debug)
        .with_file(debug)
        .with_writer(std::io::stderr);

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
        return Ok(None);
    };

    std::fs::create_dir_all(dir)?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
        dir,
        LOG_FILE_PREFIX,
    ));
    let file_layer = fmt::layer()
        .json()
        .with_ansi(false)
        .with_writer(writer)
        .with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(file_layer)
        .try_init()?;
    Ok(Some(guard))
}
