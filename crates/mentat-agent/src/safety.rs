use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::operator::{Operator, OperatorResult};
use crate::state::AgentState;

/// Bounded ledger of recent safety decisions.
const DECISION_LOG_CAPACITY: usize = 50;

/// Gate configuration for operator execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Report success without executing anything.
    pub dry_run: bool,
    /// Destructive operators require approval.
    pub require_approval_for_destructive: bool,
    /// Selections with utility below this also require approval.
    pub utility_threshold: f64,
    /// Execute non-destructive operators without asking.
    pub auto_approve_safe: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            require_approval_for_destructive: true,
            utility_threshold: 3.0,
            auto_approve_safe: true,
        }
    }
}

/// How an execution request was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyDecision {
    Auto,
    Approved,
    Denied,
    DryRun,
}

/// The approval hook. Synchronous from the middleware's perspective; an
/// implementation may suspend the cooperative task while it asks.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn request_approval(
        &self,
        operator_name: &str,
        reasoning: &str,
        utility: Option<f64>,
    ) -> bool;
}

/// Approves everything; the default for non-interactive runs.
pub struct ApproveAll;

#[async_trait]
impl ApprovalHandler for ApproveAll {
    async fn request_approval(&self, _operator: &str, _reasoning: &str, _utility: Option<f64>) -> bool {
        true
    }
}

/// Rejects everything; useful for locked-down runs and tests.
pub struct DenyAll;

#[async_trait]
impl ApprovalHandler for DenyAll {
    async fn request_approval(&self, _operator: &str, _reasoning: &str, _utility: Option<f64>) -> bool {
        false
    }
}

/// Running counters per decision class.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SafetyStats {
    pub auto: u64,
    pub approved: u64,
    pub denied: u64,
    pub dry_run: u64,
}

/// One ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub operator: String,
    pub decision: SafetyDecision,
    pub utility: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Middleware between operator selection and execution.
pub struct SafetyMiddleware {
    config: SafetyConfig,
    handler: Box<dyn ApprovalHandler>,
    stats: Mutex<SafetyStats>,
    recent: Mutex<VecDeque<DecisionRecord>>,
}

impl SafetyMiddleware {
    pub fn new(config: SafetyConfig, handler: Box<dyn ApprovalHandler>) -> Self {
        Self {
            config,
            handler,
            stats: Mutex::new(SafetyStats::default()),
            recent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn permissive() -> Self {
        Self::new(SafetyConfig::default(), Box::new(ApproveAll))
    }

    pub fn stats(&self) -> SafetyStats {
        self.stats.lock().expect("stats lock").clone()
    }

    pub fn recent_decisions(&self) -> Vec<DecisionRecord> {
        self.recent.lock().expect("ledger lock").iter().cloned().collect()
    }

    /// Gate and execute an operator.
    ///
    /// Decision order: dry-run, destructive gating, utility-threshold
    /// gating, auto-approve for safe operators, then execution.
    pub async fn execute_with_safety(
        &self,
        operator: &dyn Operator,
        state: &AgentState,
        utility: Option<f64>,
        reasoning: &str,
        verbose: bool,
    ) -> OperatorResult {
        let name = operator.name();

        if self.config.dry_run {
            self.record(&name, SafetyDecision::DryRun, utility, verbose);
            return OperatorResult {
                success: true,
                new_state: None,
                output: format!("[dry-run] would execute {name}"),
                error: None,
            };
        }

        let needs_approval = (operator.is_destructive() && self.config.require_approval_for_destructive)
            || utility.map(|u| u < self.config.utility_threshold).unwrap_or(false);

        if needs_approval {
            let approved = self.handler.request_approval(&name, reasoning, utility).await;
            if !approved {
                self.record(&name, SafetyDecision::Denied, utility, verbose);
                warn!("safety.denied op={name}");
                return OperatorResult::failed("denied");
            }
            self.record(&name, SafetyDecision::Approved, utility, verbose);
        } else if !operator.is_destructive() && self.config.auto_approve_safe {
            self.record(&name, SafetyDecision::Auto, utility, verbose);
        } else {
            // Destructive but ungated, or auto-approve disabled: still an
            // automatic decision, just not a silent one.
            self.record(&name, SafetyDecision::Auto, utility, verbose);
        }

        match operator.execute(state).await {
            Ok(result) => result,
            Err(e) => OperatorResult::failed(format!("operator error: {e}")),
        }
    }

    fn record(&self, operator: &str, decision: SafetyDecision, utility: Option<f64>, verbose: bool) {
        if verbose {
            info!("safety.decision op={operator} decision={decision:?} utility={utility:?}");
        }
        {
            let mut stats = self.stats.lock().expect("stats lock");
            match decision {
                SafetyDecision::Auto => stats.auto += 1,
                SafetyDecision::Approved => stats.approved += 1,
                SafetyDecision::Denied => stats.denied += 1,
                SafetyDecision::DryRun => stats.dry_run += 1,
            }
        }
        let mut recent = self.recent.lock().expect("ledger lock");
        recent.push_back(DecisionRecord {
            operator: operator.to_string(),
            decision,
            utility,
            timestamp: Utc::now(),
        });
        while recent.len() > DECISION_LOG_CAPACITY {
            recent.pop_front();
        }
    }
}
