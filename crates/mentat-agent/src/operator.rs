use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::goal::Goal;
use crate::state::AgentState;

/// Outcome of an operator execution.
///
/// Operators never mutate the state they were given; a successful execution
/// carries the successor snapshot instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorResult {
    pub success: bool,
    pub new_state: Option<AgentState>,
    pub output: String,
    pub error: Option<String>,
}

impl OperatorResult {
    pub fn succeeded(new_state: AgentState, output: impl Into<String>) -> Self {
        Self {
            success: true,
            new_state: Some(new_state),
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            new_state: None,
            output: String::new(),
            error: Some(error),
        }
    }
}

/// Serializable description of an operator invocation.
///
/// This is the shape chunks persist, and the shape the LLM is asked to emit
/// when suggesting operators; both are re-materialized through
/// [`crate::operators::materialize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OperatorSpec {
    /// One of: read_file, list_directory, write_file, apply_fix, run_code.
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl OperatorSpec {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            path: None,
            content: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Textual operator name, parameters included.
    pub fn display_name(&self) -> String {
        match &self.path {
            Some(path) => format!("{}({})", self.op, path),
            None => format!("{}()", self.op),
        }
    }
}

/// The operator capability the engine selects over.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Serializable invocation description.
    fn spec(&self) -> OperatorSpec;

    /// Unique textual name including parameters, e.g. `read_file(main.py)`.
    fn name(&self) -> String {
        self.spec().display_name()
    }

    fn is_destructive(&self) -> bool;

    /// Cheap, synchronous precondition check against the current state.
    fn is_applicable(&self, state: &AgentState, goal: &Goal) -> bool;

    /// Execute against a snapshot, producing a successor on success.
    async fn execute(&self, state: &AgentState) -> Result<OperatorResult>;
}
