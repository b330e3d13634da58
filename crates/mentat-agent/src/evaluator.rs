use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Score awarded when the success sentinel appears in test output.
pub const PERFECT_SCORE: u32 = 100;
/// Sentinel the test harness prints on full success.
pub const SUCCESS_SENTINEL: &str = "All tests passed";
/// Deadline for each sandboxed subprocess.
const SANDBOX_TIMEOUT: Duration = Duration::from_secs(10);

/// Fitness report for one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitnessReport {
    pub score: u32,
    pub syntax_valid: bool,
    pub runtime_valid: bool,
    pub correctness_valid: bool,
    pub error: Option<String>,
    pub output: Option<String>,
}

impl FitnessReport {
    /// Named failure class, fed into the mutation prompt.
    pub fn failure_class(&self) -> &'static str {
        if !self.syntax_valid {
            return "syntax";
        }
        if !self.runtime_valid {
            let error = self.error.as_deref().unwrap_or("");
            if error.contains("TypeError") {
                return "type";
            }
            if error.contains("NameError") {
                return "name";
            }
            if error.contains("IndexError") {
                return "index";
            }
            if error.contains("ValueError") {
                return "value";
            }
            return "runtime";
        }
        if !self.correctness_valid {
            return "correctness";
        }
        "none"
    }
}

/// Scores candidate code. Abstract so the evolutionary solver can be tested
/// against scripted fitness.
#[async_trait]
pub trait FitnessEvaluator: Send + Sync {
    async fn evaluate(&self, code: &str, test_code: Option<&str>) -> Result<FitnessReport>;
}

/// Sandboxed evaluator: syntax check, out-of-process run with a hard
/// deadline, then a correctness run against supplied tests.
///
/// Sandbox failures (timeout, nonzero exit) map to scores, never to errors;
/// the candidate survives to inform the next mutation.
pub struct CodeEvaluator {
    interpreter: String,
}

impl Default for CodeEvaluator {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
        }
    }
}

impl CodeEvaluator {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }

    async fn run(&self, args: &[&str], dir: &Path) -> Result<SandboxOutcome> {
        let mut cmd = Command::new(&self.interpreter);
        cmd.args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        match timeout(SANDBOX_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => Ok(SandboxOutcome {
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                timed_out: false,
            }),
            Ok(Err(e)) => Err(e).context("spawning sandbox interpreter"),
            Err(_) => Ok(SandboxOutcome {
                success: false,
                stdout: String::new(),
                stderr: format!("timed out after {}s", SANDBOX_TIMEOUT.as_secs()),
                timed_out: true,
            }),
        }
    }
}

struct SandboxOutcome {
    success: bool,
    stdout: String,
    stderr: String,
    timed_out: bool,
}

impl SandboxOutcome {
    fn last_error_line(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("unknown error")
            .to_string()
    }
}

/// Runtime scores by error class.
fn runtime_score(error: &str) -> u32 {
    if error.contains("TypeError") {
        25
    } else if error.contains("ValueError") {
        20
    } else if error.contains("IndexError") {
        15
    } else if error.contains("NameError") {
        10
    } else {
        10
    }
}

#[async_trait]
impl FitnessEvaluator for CodeEvaluator {
    async fn evaluate(&self, code: &str, test_code: Option<&str>) -> Result<FitnessReport> {
        let dir = tempfile::tempdir().context("creating sandbox directory")?;
        let candidate = dir.path().join("candidate.py");
        tokio::fs::write(&candidate, code)
            .await
            .context("writing candidate")?;

        // Syntax gate.
        let compiled = self.run(&["-m", "py_compile", "candidate.py"], dir.path()).await?;
        if !compiled.success {
            return Ok(FitnessReport {
                score: 0,
                syntax_valid: false,
                runtime_valid: false,
                correctness_valid: false,
                error: Some(compiled.last_error_line()),
                output: None,
            });
        }

        // Runtime gate.
        let ran = self.run(&["candidate.py"], dir.path()).await?;
        if !ran.success {
            let error = ran.last_error_line();
            return Ok(FitnessReport {
                score: if ran.timed_out { 10 } else { runtime_score(&error) },
                syntax_valid: true,
                runtime_valid: false,
                correctness_valid: false,
                error: Some(error),
                output: Some(ran.stdout),
            });
        }

        // Correctness gate.
        let Some(test_code) = test_code else {
            return Ok(FitnessReport {
                score: 50,
                syntax_valid: true,
                runtime_valid: true,
                correctness_valid: false,
                error: None,
                output: Some(ran.stdout),
            });
        };

        let harness = dir.path().join("harness.py");
        tokio::fs::write(&harness, format!("{code}\n\n{test_code}\n"))
            .await
            .context("writing test harness")?;
        let tested = self.run(&["harness.py"], dir.path()).await?;

        if tested.stdout.contains(SUCCESS_SENTINEL) {
            return Ok(FitnessReport {
                score: PERFECT_SCORE,
                syntax_valid: true,
                runtime_valid: true,
                correctness_valid: true,
                error: None,
                output: Some(tested.stdout),
            });
        }

        Ok(FitnessReport {
            score: if tested.success { 55 } else { 45 },
            syntax_valid: true,
            runtime_valid: true,
            correctness_valid: false,
            error: if tested.success {
                None
            } else {
                Some(tested.last_error_line())
            },
            output: Some(tested.stdout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_failure_class_names() {
        let mut report = FitnessReport {
            score: 0,
            syntax_valid: false,
            runtime_valid: false,
            correctness_valid: false,
            error: None,
            output: None,
        };
        assert_eq!(report.failure_class(), "syntax");

        report.syntax_valid = true;
        report.error = Some("IndexError: list index out of range".to_string());
        assert_eq!(report.failure_class(), "index");

        report.runtime_valid = true;
        assert_eq!(report.failure_class(), "correctness");

        report.correctness_valid = true;
        assert_eq!(report.failure_class(), "none");
    }

    #[test]
    fn test_runtime_score_bands() {
        assert_eq!(runtime_score("TypeError: bad"), 25);
        assert_eq!(runtime_score("ValueError: bad"), 20);
        assert_eq!(runtime_score("IndexError: bad"), 15);
        assert_eq!(runtime_score("NameError: bad"), 10);
        assert_eq!(runtime_score("ZeroDivisionError: bad"), 10);
    }

    #[tokio::test]
    async fn test_syntax_error_scores_zero() {
        if !python_available() {
            return;
        }
        let report = CodeEvaluator::default()
            .evaluate("def broken(:\n    pass\n", None)
            .await
            .unwrap();
        assert_eq!(report.score, 0);
        assert!(!report.syntax_valid);
    }

    #[tokio::test]
    async fn test_runtime_error_scores_by_class() {
        if !python_available() {
            return;
        }
        let report = CodeEvaluator::default()
            .evaluate("print(undefined_name)\n", None)
            .await
            .unwrap();
        assert!(report.syntax_valid);
        assert!(!report.runtime_valid);
        assert_eq!(report.score, 10);
        assert!(report.error.unwrap().contains("NameError"));
    }

    #[tokio::test]
    async fn test_clean_run_without_tests_is_midband() {
        if !python_available() {
            return;
        }
        let report = CodeEvaluator::default()
            .evaluate("print('hello')\n", None)
            .await
            .unwrap();
        assert_eq!(report.score, 50);
        assert!(report.runtime_valid);
        assert!(!report.correctness_valid);
        assert_eq!(report.output.unwrap().trim(), "hello");
    }

    #[tokio::test]
    async fn test_sentinel_scores_perfect() {
        if !python_available() {
            return;
        }
        let code = "def add(a, b):\n    return a + b\n";
        let tests = "assert add(1, 2) == 3\nprint('All tests passed')\n";
        let report = CodeEvaluator::default()
            .evaluate(code, Some(tests))
            .await
            .unwrap();
        assert_eq!(report.score, PERFECT_SCORE);
        assert!(report.correctness_valid);
    }

    #[tokio::test]
    async fn test_failing_tests_score_below_sentinel() {
        if !python_available() {
            return;
        }
        let code = "def add(a, b):\n    return a - b\n";
        let tests = "assert add(1, 2) == 3\nprint('All tests passed')\n";
        let report = CodeEvaluator::default()
            .evaluate(code, Some(tests))
            .await
            .unwrap();
        assert_eq!(report.score, 45);
        assert!(!report.correctness_valid);
    }

    #[tokio::test]
    async fn test_evaluation_is_repeatable() {
        if !python_available() {
            return;
        }
        let evaluator = CodeEvaluator::default();
        let first = evaluator.evaluate("print(1)\n", None).await.unwrap();
        let second = evaluator.evaluate("print(1)\n", None).await.unwrap();
        assert_eq!(first.score, second.score);
    }
}
