//! Built-in operators run by the local agent

use super::process::{ProcessError, run_shell};
use crate::config::{ConfigError, ConfigMap, ConfigValue};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("command exited with {code}: {stderr}")]
    NonZeroExit { code: String, stderr: String },

    /// Raised on purpose by the `fail` operator
    #[error("{0}")]
    Failed(String),

    #[error("no local handler for operator '{0}'")]
    Unsupported(String),
}

/// Run one operator with its rendered config
pub async fn execute(operator: &str, config: &ConfigMap) -> Result<ConfigMap, OperatorError> {
    match operator {
        "echo" => {
            let message = config.get_opt_str("message")?.unwrap_or_default();
            Ok(ConfigMap::new().with("message", message))
        }
        "sh" => {
            let command = config.get_str("command")?;
            let cwd = config.get_opt_str("cwd")?.map(Path::new);
            let output = run_shell(command, cwd).await?;
            if !output.success() {
                return Err(OperatorError::NonZeroExit {
                    code: output
                        .exit_code
                        .map_or_else(|| "unknown status".into(), |c| c.to_string()),
                    stderr: output.stderr.trim().to_string(),
                });
            }
            Ok(ConfigMap::new()
                .with("stdout", output.stdout.trim_end())
                .with("stderr", output.stderr.trim_end())
                .with("exit_code", ConfigValue::Integer(0)))
        }
        "fail" => {
            let message = config
                .get_opt_str("message")?
                .unwrap_or("task failed by fail operator");
            Err(OperatorError::Failed(message.to_string()))
        }
        "noop" => Ok(ConfigMap::new()),
        other => Err(OperatorError::Unsupported(other.to_string())),
    }
}
