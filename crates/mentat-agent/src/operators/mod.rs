//! Concrete operators.
//!
//! Every operator resolves its paths inside the state's working directory
//! and refuses anything that escapes it. Output is sanitized to a bounded
//! size before it lands in working memory.

use anyhow::{anyhow, Result};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

pub mod filesystem;
pub mod run_code;

pub use filesystem::{ApplyFixOperator, ListDirectoryOperator, ReadFileOperator, WriteFileOperator};
pub use run_code::RunCodeOperator;

use crate::operator::{Operator, OperatorSpec};
use crate::state::AgentState;

/// Cap on operator output carried into state.
pub const MAX_OUTPUT_BYTES: usize = 16 * 1024;

/// Resolve a relative path inside the working directory, rejecting absolute
/// paths and parent traversal.
pub fn resolve_in_workdir(state: &AgentState, path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return Err(anyhow!("absolute paths are not allowed: {path}"));
    }
    for component in candidate.components() {
        if matches!(component, Component::ParentDir) {
            return Err(anyhow!("path escapes the working directory: {path}"));
        }
    }
    Ok(Path::new(&state.working_directory).join(candidate))
}

/// Truncate output to [`MAX_OUTPUT_BYTES`] with a marker.
pub fn sanitize_output(output: &str) -> String {
    if output.len() <= MAX_OUTPUT_BYTES {
        return output.to_string();
    }
    let mut cut = MAX_OUTPUT_BYTES;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... (truncated from {} bytes)", &output[..cut], output.len())
}

/// Materialize an operator from its serializable description.
///
/// Returns `None` for unknown kinds or missing parameters; callers log and
/// skip rather than fail the cycle.
pub fn materialize(spec: &OperatorSpec) -> Option<Arc<dyn Operator>> {
    match spec.op.as_str() {
        "read_file" => spec
            .path
            .as_ref()
            .map(|path| Arc::new(ReadFileOperator::new(path.clone())) as Arc<dyn Operator>),
        "list_directory" => Some(Arc::new(ListDirectoryOperator::new(spec.path.clone()))),
        "write_file" => match (&spec.path, &spec.content) {
            (Some(path), Some(content)) => Some(Arc::new(WriteFileOperator::new(
                path.clone(),
                content.clone(),
            ))),
            _ => None,
        },
        "apply_fix" => match (&spec.path, &spec.content) {
            (Some(path), Some(content)) => Some(Arc::new(ApplyFixOperator::new(
                path.clone(),
                content.clone(),
            ))),
            _ => None,
        },
        "run_code" => spec
            .path
            .as_ref()
            .map(|path| Arc::new(RunCodeOperator::new(path.clone())) as Arc<dyn Operator>),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_escapes() {
        let state = AgentState::new("/work");
        assert!(resolve_in_workdir(&state, "src/main.py").is_ok());
        assert!(resolve_in_workdir(&state, "../secrets").is_err());
        assert!(resolve_in_workdir(&state, "/etc/passwd").is_err());
    }

    #[test]
    fn test_sanitize_output_truncates() {
        let long = "x".repeat(MAX_OUTPUT_BYTES + 100);
        let sanitized = sanitize_output(&long);
        assert!(sanitized.len() < long.len());
        assert!(sanitized.contains("truncated"));
        assert_eq!(sanitize_output("short"), "short");
    }

    #[test]
    fn test_materialize_known_kinds() {
        let read = OperatorSpec::new("read_file").with_path("main.py");
        assert_eq!(materialize(&read).unwrap().name(), "read_file(main.py)");

        let write = OperatorSpec::new("write_file").with_path("a.py");
        assert!(materialize(&write).is_none(), "write without content");

        let unknown = OperatorSpec::new("teleport").with_path("a");
        assert!(materialize(&unknown).is_none());
    }
}
