//! Workflow definitions read from a directory tree

use super::{ProjectStore, StoreError};
use crate::config::{WorkflowDefinition, load_workflow};
use std::path::{Path, PathBuf};

/// Loads `{root}/{project}/{workflow}.toml`
#[derive(Debug, Clone)]
pub struct FileProjectStore {
    root: PathBuf,
}

impl FileProjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workflow_path(&self, project: &str, workflow: &str) -> PathBuf {
        self.root.join(project).join(format!("{}.toml", workflow))
    }
}

impl ProjectStore for FileProjectStore {
    fn load(&self, project: &str, workflow: &str) -> Result<WorkflowDefinition, StoreError> {
        let path = self.workflow_path(project, workflow);
        if !path.is_file() {
            return Err(StoreError::WorkflowNotFound {
                project: project.into(),
                workflow: workflow.into(),
            });
        }
        let definition = load_workflow(&path).map_err(|e| StoreError::InvalidWorkflow {
            project: project.into(),
            workflow: workflow.into(),
            message: format!("{:#}", e),
        })?;
        if definition.name != workflow {
            return Err(StoreError::InvalidWorkflow {
                project: project.into(),
                workflow: workflow.into(),
                message: format!("file declares workflow '{}'", definition.name),
            });
        }
        Ok(definition)
    }
}
