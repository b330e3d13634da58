use regex::Regex;
use serde::Serialize;

use crate::outline;
use crate::state::AgentState;

/// Window radius around an error line, in lines.
const ERROR_WINDOW_RADIUS: usize = 10;
/// Line budget for whole-file summaries.
const SUMMARY_LINES: usize = 20;

/// How a file excerpt was chosen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ExcerptKind {
    /// A single function extracted by name.
    Function(String),
    /// A window around an error line.
    ErrorWindow(usize),
    /// Head-plus-signatures summary.
    Summary,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileExcerpt {
    pub path: String,
    pub kind: ExcerptKind,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedFile {
    pub path: String,
    pub priority: f64,
}

/// Bounded, goal/error-prioritized view of a state, ready for a prompt.
///
/// The goal and the latest error are stored verbatim and are never subject
/// to the budget.
#[derive(Debug, Clone, Serialize)]
pub struct CompressedView {
    pub goal: String,
    pub latest_error: Option<String>,
    pub ranked_files: Vec<RankedFile>,
    pub excerpts: Vec<FileExcerpt>,
}

impl CompressedView {
    /// Render as prompt text.
    pub fn render(&self) -> String {
        let mut out = format!("Goal: {}\n", self.goal);
        if let Some(error) = &self.latest_error {
            out.push_str(&format!("Latest error: {error}\n"));
        }
        if !self.ranked_files.is_empty() {
            out.push_str("Files (ranked):\n");
            for file in &self.ranked_files {
                out.push_str(&format!("  {} (priority {})\n", file.path, file.priority));
            }
        }
        for excerpt in &self.excerpts {
            let label = match &excerpt.kind {
                ExcerptKind::Function(name) => format!("function {name}"),
                ExcerptKind::ErrorWindow(line) => format!("around line {line}"),
                ExcerptKind::Summary => "summary".to_string(),
            };
            out.push_str(&format!("--- {} [{label}] ---\n{}\n", excerpt.path, excerpt.text));
        }
        out
    }
}

/// Deterministic state-to-prompt compressor.
pub struct ContextCompressor {
    chars_per_token: usize,
}

impl Default for ContextCompressor {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl ContextCompressor {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }

    pub fn compress(
        &self,
        state: &AgentState,
        goal_description: &str,
        budget_tokens: usize,
    ) -> CompressedView {
        let latest_error = state.latest_error().map(|e| e.to_string());
        let error_text = latest_error.as_deref().unwrap_or("");

        let mut ranked: Vec<RankedFile> = state
            .files
            .keys()
            .map(|path| {
                let mut priority = 1.0;
                if goal_description.contains(path.as_str()) {
                    priority += 5.0;
                }
                if error_text.contains(path.as_str()) {
                    priority += 3.0;
                }
                if state.cursors.contains_key(path) {
                    priority += 2.0;
                }
                RankedFile {
                    path: path.clone(),
                    priority,
                }
            })
            .collect();
        // BTreeMap iteration gives path order; the stable sort keeps it as
        // the tie-break so output is deterministic.
        ranked.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut remaining = budget_tokens.saturating_mul(self.chars_per_token);
        let mut excerpts = Vec::new();
        for file in &ranked {
            if remaining == 0 {
                break;
            }
            let record = &state.files[&file.path];
            let (kind, text) = self.excerpt_for(record, &file.path, goal_description, error_text);
            let text = clip(&text, remaining);
            remaining = remaining.saturating_sub(text.len());
            excerpts.push(FileExcerpt {
                path: file.path.clone(),
                kind,
                text,
            });
        }

        CompressedView {
            goal: goal_description.to_string(),
            latest_error,
            ranked_files: ranked,
            excerpts,
        }
    }

    fn excerpt_for(
        &self,
        record: &crate::state::FileRecord,
        path: &str,
        goal: &str,
        error: &str,
    ) -> (ExcerptKind, String) {
        if let Some(parsed) = &record.outline {
            if let Some(name) = named_function(goal, error, parsed) {
                if let Some(body) = outline::find_function(&record.content, parsed, &name) {
                    return (ExcerptKind::Function(name), body);
                }
            }
        }
        if let Some(line) = error_line_for(path, error) {
            return (
                ExcerptKind::ErrorWindow(line),
                outline::window(&record.content, line, ERROR_WINDOW_RADIUS),
            );
        }
        (
            ExcerptKind::Summary,
            outline::summarize(&record.content, SUMMARY_LINES),
        )
    }
}

/// A function name mentioned in the goal or error that the outline knows.
fn named_function(goal: &str, error: &str, parsed: &outline::Outline) -> Option<String> {
    let patterns = [
        r"in (\w+)\b",
        r"function (\w+)",
        r"def (\w+)",
        r"fn (\w+)",
        r"(\w+)\(\)",
    ];
    for pattern in patterns {
        let regex = Regex::new(pattern).expect("static regex");
        for text in [goal, error] {
            for caps in regex.captures_iter(text) {
                let candidate = &caps[1];
                if parsed.functions.iter().any(|f| f.name == candidate) {
                    return Some(candidate.to_string());
                }
            }
        }
    }
    None
}

/// Error line referencing `path`, from traceback or `path:line` forms.
fn error_line_for(path: &str, error: &str) -> Option<usize> {
    if error.is_empty() || !error.contains(path) {
        return None;
    }
    let traceback = Regex::new(r#"File "([^"]+)", line (\d+)"#).expect("static regex");
    for caps in traceback.captures_iter(error) {
        if caps[1].ends_with(path) {
            return caps[2].parse().ok();
        }
    }
    let colon = Regex::new(&format!(r"{}:(\d+)", regex::escape(path))).expect("escaped regex");
    if let Some(caps) = colon.captures(error) {
        return caps[1].parse().ok();
    }
    let line_only = Regex::new(r"line (\d+)").expect("static regex");
    line_only.captures(error).and_then(|c| c[1].parse().ok())
}

fn clip(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n... (truncated) ...", &text[..cut])
}
