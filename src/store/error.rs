//! Store error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session {key} attempt {attempt} already exists")]
    DuplicateSession { key: String, attempt: u32 },

    #[error("workflow '{workflow}' not found in project '{project}'")]
    WorkflowNotFound { project: String, workflow: String },

    #[error("invalid workflow '{workflow}' in project '{project}': {message}")]
    InvalidWorkflow {
        project: String,
        workflow: String,
        message: String,
    },

    #[error("corrupt record: {message}")]
    Corrupt { message: String },

    #[error("invalid store configuration: {message}")]
    Config { message: String },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }
}
