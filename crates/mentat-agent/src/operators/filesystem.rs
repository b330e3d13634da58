use anyhow::Result;
use async_trait::async_trait;
use tokio::fs;

use super::{resolve_in_workdir, sanitize_output};
use crate::goal::Goal;
use crate::operator::{Operator, OperatorResult, OperatorSpec};
use crate::state::AgentState;

/// Open a file into working memory.
pub struct ReadFileOperator {
    path: String,
}

impl ReadFileOperator {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Operator for ReadFileOperator {
    fn spec(&self) -> OperatorSpec {
        OperatorSpec::new("read_file").with_path(self.path.clone())
    }

    fn is_destructive(&self) -> bool {
        false
    }

    fn is_applicable(&self, state: &AgentState, _goal: &Goal) -> bool {
        resolve_in_workdir(state, &self.path)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    async fn execute(&self, state: &AgentState) -> Result<OperatorResult> {
        let resolved = match resolve_in_workdir(state, &self.path) {
            Ok(resolved) => resolved,
            Err(e) => return Ok(OperatorResult::failed(e.to_string())),
        };
        match fs::read_to_string(&resolved).await {
            Ok(content) => {
                let mut next = state.successor();
                let bytes = content.len();
                next.open_file(&self.path, content);
                next.cursors.insert(self.path.clone(), 1);
                Ok(OperatorResult::succeeded(
                    next,
                    format!("read {} ({} bytes)", self.path, bytes),
                ))
            }
            Err(e) => Ok(OperatorResult::failed(format!(
                "failed to read {}: {e}",
                self.path
            ))),
        }
    }
}

/// List a directory under the working directory.
pub struct ListDirectoryOperator {
    path: Option<String>,
}

impl ListDirectoryOperator {
    pub fn new(path: Option<String>) -> Self {
        Self { path }
    }

    fn target(&self) -> &str {
        self.path.as_deref().unwrap_or(".")
    }
}

#[async_trait]
impl Operator for ListDirectoryOperator {
    fn spec(&self) -> OperatorSpec {
        OperatorSpec::new("list_directory").with_path(self.target())
    }

    fn is_destructive(&self) -> bool {
        false
    }

    fn is_applicable(&self, state: &AgentState, _goal: &Goal) -> bool {
        resolve_in_workdir(state, self.target())
            .map(|p| p.is_dir())
            .unwrap_or(false)
    }

    async fn execute(&self, state: &AgentState) -> Result<OperatorResult> {
        let resolved = match resolve_in_workdir(state, self.target()) {
            Ok(resolved) => resolved,
            Err(e) => return Ok(OperatorResult::failed(e.to_string())),
        };

        let mut reader = match fs::read_dir(&resolved).await {
            Ok(reader) => reader,
            Err(e) => {
                return Ok(OperatorResult::failed(format!(
                    "failed to list {}: {e}",
                    self.target()
                )))
            }
        };

        let mut entries = Vec::new();
        while let Ok(Some(entry)) = reader.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let marker = match entry.file_type().await {
                Ok(kind) if kind.is_dir() => format!("{name}/"),
                _ => name,
            };
            entries.push(marker);
        }
        entries.sort();

        let listing = sanitize_output(&entries.join("\n"));
        let mut next = state.successor();
        next.last_command_output = Some(listing.clone());
        Ok(OperatorResult::succeeded(next, listing))
    }
}

/// Write a file, creating or replacing it.
pub struct WriteFileOperator {
    path: String,
    content: String,
}

impl WriteFileOperator {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

#[async_trait]
impl Operator for WriteFileOperator {
    fn spec(&self) -> OperatorSpec {
        OperatorSpec::new("write_file")
            .with_path(self.path.clone())
            .with_content(self.content.clone())
    }

    fn is_destructive(&self) -> bool {
        true
    }

    fn is_applicable(&self, state: &AgentState, _goal: &Goal) -> bool {
        resolve_in_workdir(state, &self.path).is_ok()
    }

    async fn execute(&self, state: &AgentState) -> Result<OperatorResult> {
        let resolved = match resolve_in_workdir(state, &self.path) {
            Ok(resolved) => resolved,
            Err(e) => return Ok(OperatorResult::failed(e.to_string())),
        };
        if let Some(parent) = resolved.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                return Ok(OperatorResult::failed(format!(
                    "failed to create parent of {}: {e}",
                    self.path
                )));
            }
        }
        match fs::write(&resolved, &self.content).await {
            Ok(()) => {
                let mut next = state.successor();
                next.open_file(&self.path, self.content.clone());
                Ok(OperatorResult::succeeded(
                    next,
                    format!("wrote {} ({} bytes)", self.path, self.content.len()),
                ))
            }
            Err(e) => Ok(OperatorResult::failed(format!(
                "failed to write {}: {e}",
                self.path
            ))),
        }
    }
}

/// Replace a file's content with a repaired version.
///
/// Same mechanics as a write, but the intent (and the chunk it may become)
/// is a repair, so the target must already be known.
pub struct ApplyFixOperator {
    path: String,
    patched: String,
}

impl ApplyFixOperator {
    pub fn new(path: impl Into<String>, patched: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            patched: patched.into(),
        }
    }
}

#[async_trait]
impl Operator for ApplyFixOperator {
    fn spec(&self) -> OperatorSpec {
        OperatorSpec::new("apply_fix")
            .with_path(self.path.clone())
            .with_content(self.patched.clone())
    }

    fn is_destructive(&self) -> bool {
        true
    }

    fn is_applicable(&self, state: &AgentState, _goal: &Goal) -> bool {
        state.is_file_open(&self.path)
            || resolve_in_workdir(state, &self.path)
                .map(|p| p.is_file())
                .unwrap_or(false)
    }

    async fn execute(&self, state: &AgentState) -> Result<OperatorResult> {
        let resolved = match resolve_in_workdir(state, &self.path) {
            Ok(resolved) => resolved,
            Err(e) => return Ok(OperatorResult::failed(e.to_string())),
        };
        match fs::write(&resolved, &self.patched).await {
            Ok(()) => {
                let mut next = state.successor();
                next.open_file(&self.path, self.patched.clone());
                Ok(OperatorResult::succeeded(
                    next,
                    format!("applied fix to {}", self.path),
                ))
            }
            Err(e) => Ok(OperatorResult::failed(format!(
                "failed to apply fix to {}: {e}",
                self.path
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn goal() -> Goal {
        Goal {
            id: 0,
            description: "test".to_string(),
            parent: None,
            subgoals: Vec::new(),
            status: crate::goal::GoalStatus::Active,
            priority: 1.0,
        }
    }

    #[tokio::test]
    async fn test_read_file_opens_into_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "print('hi')\n").unwrap();
        let state = AgentState::new(dir.path().to_string_lossy().to_string());

        let op = ReadFileOperator::new("main.py");
        assert!(op.is_applicable(&state, &goal()));

        let result = op.execute(&state).await.unwrap();
        assert!(result.success);
        let next = result.new_state.unwrap();
        assert!(next.is_file_open("main.py"));
        assert_eq!(next.cursors["main.py"], 1);
    }

    #[tokio::test]
    async fn test_read_missing_file_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let state = AgentState::new(dir.path().to_string_lossy().to_string());

        let op = ReadFileOperator::new("absent.py");
        assert!(!op.is_applicable(&state, &goal()));
        let result = op.execute(&state).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("absent.py"));
    }

    #[tokio::test]
    async fn test_list_directory_sorted_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let state = AgentState::new(dir.path().to_string_lossy().to_string());

        let op = ListDirectoryOperator::new(None);
        let result = op.execute(&state).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, "a.txt\nb.txt\nsub/");
        assert!(result.new_state.unwrap().last_command_output.is_some());
    }

    #[tokio::test]
    async fn test_write_then_apply_fix_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let state = AgentState::new(dir.path().to_string_lossy().to_string());

        let write = WriteFileOperator::new("src/new.py", "x = 1\n");
        let result = write.execute(&state).await.unwrap();
        assert!(result.success);
        let state = result.new_state.unwrap();

        let fix = ApplyFixOperator::new("src/new.py", "x = 2\n");
        assert!(fix.is_applicable(&state, &goal()));
        let result = fix.execute(&state).await.unwrap();
        assert!(result.success);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/new.py")).unwrap(),
            "x = 2\n"
        );
        assert_eq!(result.new_state.unwrap().files["src/new.py"].content, "x = 2\n");
    }

    #[test]
    fn test_destructive_flags() {
        assert!(!ReadFileOperator::new("a").is_destructive());
        assert!(!ListDirectoryOperator::new(None).is_destructive());
        assert!(WriteFileOperator::new("a", "").is_destructive());
        assert!(ApplyFixOperator::new("a", "").is_destructive());
    }
}
