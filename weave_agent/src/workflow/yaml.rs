//! Task-definition documents.
//!
//! A definition is a YAML (or JSON) document listing the tasks of one
//! workflow, optionally with its id:
//!
//! ```yaml
//! workflow_id: nightly_report
//! tasks:
//!   - task_id: fetch
//!     description: "Fetch yesterday's metrics"
//!   - task_id: report
//!     description: "Write the report"
//!     dependencies: [fetch]
//!     metadata: { timeout_seconds: 30 }
//! ```
//!
//! A bare top-level list of tasks is accepted as well.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use weave_core::types::TaskSpec;

/// Errors that can occur while loading a definition.
#[derive(Error, Debug)]
pub enum DefinitionError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Document lists no tasks
    #[error("definition contains no tasks")]
    Empty,
}

/// Parsed definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identifier, generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Task descriptors in submission order
    pub tasks: Vec<TaskSpec>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Document {
    Full(WorkflowDefinition),
    Bare(Vec<TaskSpec>),
}

impl WorkflowDefinition {
    /// Workflow id from the document, or a fresh `wf_<hex>` id.
    pub fn workflow_id_or_generate(&self) -> String {
        self.workflow_id.clone().unwrap_or_else(generate_workflow_id)
    }
}

/// Generates a workflow id of the form `wf_<8 hex chars>`.
pub fn generate_workflow_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("wf_{}", &uuid[..8])
}

/// Loads a definition from a YAML string.
///
/// # Returns
///
/// - `Ok(WorkflowDefinition)` - If the document parsed and lists tasks
/// - `Err(DefinitionError)` - If YAML is invalid or the task list is empty
///
/// # Example
///
/// ```ignore
/// use weave_agent::workflow::yaml::load_definition_from_string;
///
/// let def = load_definition_from_string("- task_id: a\n  description: do it\n")?;
/// assert_eq!(def.tasks.len(), 1);
/// ```
pub fn load_definition_from_string(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let definition = match serde_yaml::from_str::<Document>(yaml) {
        Ok(Document::Full(def)) => def,
        Ok(Document::Bare(tasks)) => WorkflowDefinition {
            workflow_id: None,
            tasks,
        },
        // Re-parse as the full form for a useful error message
        Err(_) => serde_yaml::from_str::<WorkflowDefinition>(yaml)?,
    };

    if definition.tasks.is_empty() {
        return Err(DefinitionError::Empty);
    }
    Ok(definition)
}

/// Loads a definition from a file.
pub async fn load_definition_from_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = tokio::fs::read_to_string(path).await?;
    load_definition_from_string(&content)
}
