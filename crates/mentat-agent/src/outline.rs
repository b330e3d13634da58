//! Lightweight source outlines.
//!
//! The context compressor needs to pull a named function out of a file, cut a
//! window around an error line, or summarize a file it cannot parse. This
//! module does that with compiled regexes over the raw text, which keeps the
//! output deterministic and the dependency surface small. Supported
//! languages: Python, Rust, JavaScript/TypeScript, Java, Go.

use anyhow::{anyhow, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Span of a single function definition inside a file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionSpan {
    pub name: String,
    /// 1-indexed, inclusive.
    pub start_line: usize,
    /// 1-indexed, inclusive.
    pub end_line: usize,
}

/// Parsed outline of a source file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Outline {
    pub language: String,
    pub functions: Vec<FunctionSpan>,
}

/// Infer a language identifier from a file path extension.
pub fn language_for_path(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?;
    match ext {
        "py" => Some("python"),
        "rs" => Some("rust"),
        "js" | "jsx" | "ts" | "tsx" => Some("javascript"),
        "java" => Some("java"),
        "go" => Some("go"),
        _ => None,
    }
}

/// Parse `code` into an outline of function spans.
pub fn parse(code: &str, language: &str) -> Result<Outline> {
    let spans = match language {
        "python" => python_functions(code),
        "rust" => brace_functions(code, &rust_header()),
        "javascript" => brace_functions(code, &javascript_header()),
        "java" => brace_functions(code, &java_header()),
        "go" => brace_functions(code, &go_header()),
        other => return Err(anyhow!("unsupported language: {other}")),
    };
    Ok(Outline {
        language: language.to_string(),
        functions: spans,
    })
}

/// Extract the full text of the named function, if present.
pub fn find_function(code: &str, outline: &Outline, name: &str) -> Option<String> {
    let span = outline.functions.iter().find(|f| f.name == name)?;
    Some(slice_lines(code, span.start_line, span.end_line))
}

/// Find the innermost function span covering a 1-indexed line.
pub fn find_span_at_line(outline: &Outline, line: usize) -> Option<&FunctionSpan> {
    outline
        .functions
        .iter()
        .filter(|f| f.start_line <= line && line <= f.end_line)
        .min_by_key(|f| f.end_line - f.start_line)
}

/// Cut a window of `radius` lines around a 1-indexed line.
pub fn window(code: &str, line: usize, radius: usize) -> String {
    let total = code.lines().count();
    if total == 0 {
        return String::new();
    }
    let line = line.clamp(1, total);
    let start = line.saturating_sub(radius).max(1);
    let end = (line + radius).min(total);
    slice_lines(code, start, end)
}

/// Summarize a file: leading lines plus signature lines, with a truncation
/// marker when anything was dropped.
pub fn summarize(code: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = code.lines().collect();
    if lines.len() <= max_lines {
        return code.to_string();
    }

    let head = max_lines / 2;
    let mut out: Vec<String> = lines[..head].iter().map(|l| l.to_string()).collect();
    out.push("  ... (truncated) ...".to_string());

    let signature = Regex::new(r"^\s*(def |fn |func |function |class |(pub|public|private|protected)\s)")
        .expect("static regex");
    for line in &lines[head..] {
        if out.len() >= max_lines + 1 {
            break;
        }
        if signature.is_match(line) {
            out.push(line.to_string());
        }
    }
    out.join("\n")
}

fn slice_lines(code: &str, start: usize, end: usize) -> String {
    code.lines()
        .skip(start - 1)
        .take(end - start + 1)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Python functions end where indentation returns to the `def` level.
fn python_functions(code: &str) -> Vec<FunctionSpan> {
    let header = Regex::new(r"^(\s*)(?:async\s+)?def\s+(\w+)\s*\(").expect("static regex");
    let lines: Vec<&str> = code.lines().collect();
    let mut spans = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let Some(caps) = header.captures(line) else {
            continue;
        };
        let indent = caps[1].len();
        let name = caps[2].to_string();

        let mut end = lines.len();
        for (j, candidate) in lines.iter().enumerate().skip(idx + 1) {
            if candidate.trim().is_empty() {
                continue;
            }
            let candidate_indent = candidate.len() - candidate.trim_start().len();
            if candidate_indent <= indent {
                end = j;
                break;
            }
        }
        // Trim trailing blank lines out of the span.
        while end > idx + 1 && lines[end - 1].trim().is_empty() {
            end -= 1;
        }
        spans.push(FunctionSpan {
            name,
            start_line: idx + 1,
            end_line: end,
        });
    }
    spans
}

fn rust_header() -> Regex {
    Regex::new(r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:unsafe\s+)?fn\s+(\w+)")
        .expect("static regex")
}

fn javascript_header() -> Regex {
    Regex::new(r"^\s*(?:export\s+)?(?:async\s+)?function\s+(\w+)\s*\(").expect("static regex")
}

fn java_header() -> Regex {
    Regex::new(r"^\s*(?:public|private|protected)[\w\s<>\[\],]*\s(\w+)\s*\([^)]*\)\s*\{")
        .expect("static regex")
}

fn go_header() -> Regex {
    Regex::new(r"^func\s+(?:\([^)]*\)\s*)?(\w+)\s*\(").expect("static regex")
}

/// Brace-delimited languages: match the header, then balance braces.
fn brace_functions(code: &str, header: &Regex) -> Vec<FunctionSpan> {
    let lines: Vec<&str> = code.lines().collect();
    let mut spans = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let Some(caps) = header.captures(line) else {
            continue;
        };
        let name = caps[1].to_string();

        let mut depth = 0i32;
        let mut opened = false;
        let mut end = idx + 1;
        'scan: for (j, candidate) in lines.iter().enumerate().skip(idx) {
            for ch in candidate.chars() {
                match ch {
                    '{' => {
                        depth += 1;
                        opened = true;
                    }
                    '}' => {
                        depth -= 1;
                        if opened && depth == 0 {
                            end = j + 1;
                            break 'scan;
                        }
                    }
                    _ => {}
                }
            }
            end = j + 1;
        }
        spans.push(FunctionSpan {
            name,
            start_line: idx + 1,
            end_line: end,
        });
    }
    spans
}
