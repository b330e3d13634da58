use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};

use crate::outline::{self, Outline};

/// Upper bound on retained error-log entries; newest last.
pub const ERROR_LOG_CAPACITY: usize = 50;

/// How much of the goal and error text feeds the state signature.
const SIGNATURE_TEXT_PREFIX: usize = 120;
const SIGNATURE_FILE_LIMIT: usize = 5;

/// A file the agent has opened into working memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub content: String,
    pub language: Option<String>,
    pub outline: Option<Outline>,
    pub last_modified: DateTime<Utc>,
}

impl FileRecord {
    pub fn new(path: &str, content: String) -> Self {
        let language = outline::language_for_path(path).map(|l| l.to_string());
        let parsed = language
            .as_deref()
            .and_then(|lang| outline::parse(&content, lang).ok());
        Self {
            content,
            language,
            outline: parsed,
            last_modified: Utc::now(),
        }
    }
}

/// Snapshot of the agent's environment.
///
/// Consumers treat a state as immutable; operators derive a successor via
/// [`AgentState::successor`] and mutate the copy. Ordered maps keep every
/// derived artifact (signatures, hashes, compressor output) deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub working_directory: String,
    pub files: BTreeMap<String, FileRecord>,
    /// path -> 1-indexed cursor line.
    pub cursors: BTreeMap<String, usize>,
    pub error_log: VecDeque<String>,
    pub last_command_output: Option<String>,
    pub repository_status: Option<String>,
}

impl AgentState {
    pub fn new(working_directory: impl Into<String>) -> Self {
        Self {
            working_directory: working_directory.into(),
            files: BTreeMap::new(),
            cursors: BTreeMap::new(),
            error_log: VecDeque::new(),
            last_command_output: None,
            repository_status: None,
        }
    }

    /// Deep copy for an operator to mutate.
    pub fn successor(&self) -> Self {
        self.clone()
    }

    pub fn open_file(&mut self, path: &str, content: String) {
        self.files.insert(path.to_string(), FileRecord::new(path, content));
    }

    pub fn push_error(&mut self, error: impl Into<String>) {
        self.error_log.push_back(error.into());
        while self.error_log.len() > ERROR_LOG_CAPACITY {
            self.error_log.pop_front();
        }
    }

    pub fn latest_error(&self) -> Option<&str> {
        self.error_log.back().map(|s| s.as_str())
    }

    pub fn is_file_open(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Canonical signature of this state with respect to a goal.
    ///
    /// Depends only on the goal text prefix, the working directory, up to
    /// five open-file paths, and a prefix of the newest error. Nothing else
    /// may leak in: chunk identity is derived from this map.
    pub fn signature(&self, goal_description: &str) -> BTreeMap<String, String> {
        let mut signature = BTreeMap::new();
        signature.insert(
            "goal".to_string(),
            prefix(goal_description, SIGNATURE_TEXT_PREFIX),
        );
        signature.insert("working_directory".to_string(), self.working_directory.clone());
        signature.insert(
            "open_files".to_string(),
            self.files
                .keys()
                .take(SIGNATURE_FILE_LIMIT)
                .cloned()
                .collect::<Vec<_>>()
                .join(","),
        );
        signature.insert(
            "last_error".to_string(),
            self.latest_error()
                .map(|e| prefix(e, SIGNATURE_TEXT_PREFIX))
                .unwrap_or_default(),
        );
        signature
    }

    /// Hash of the full snapshot, used in transition records.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.working_directory.as_bytes());
        for (path, record) in &self.files {
            hasher.update(path.as_bytes());
            hasher.update(record.content.as_bytes());
        }
        for (path, line) in &self.cursors {
            hasher.update(path.as_bytes());
            hasher.update(line.to_le_bytes());
        }
        for error in &self.error_log {
            hasher.update(error.as_bytes());
        }
        if let Some(output) = &self.last_command_output {
            hasher.update(output.as_bytes());
        }
        if let Some(status) = &self.repository_status {
            hasher.update(status.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Hash a signature map into a stable identifier.
pub fn signature_hash(signature: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in signature {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

fn prefix(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}
