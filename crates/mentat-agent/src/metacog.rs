use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use mentat_core::EngineConfig;

use crate::impasse::Impasse;

/// Pressure at which the symbolic tier hands over to the heuristic resolver.
pub const HEURISTIC_THRESHOLD: f64 = 0.7;
/// Pressure at which code-fix goals escalate to the evolutionary solver.
pub const EVOLUTION_THRESHOLD: f64 = 0.9;

const DEPTH_WEIGHT: f64 = 0.4;
const TIME_WEIGHT: f64 = 0.3;
const AMBIGUITY_WEIGHT: f64 = 0.3;

/// Signals feeding the pressure computation.
#[derive(Debug, Clone, Serialize)]
pub struct CognitiveMetrics {
    pub goal_depth: u32,
    pub time_in_state_ms: u64,
    pub impasse_count: u32,
    pub operator_ambiguity: f64,
}

/// Which tier resolves the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionPath {
    /// Apply the top operator as-is.
    Proceed,
    /// Push a symbolic sub-goal.
    Subgoal,
    /// Invoke the ACT-R utility resolver.
    Heuristic,
    /// Invoke the evolutionary solver.
    Evolution,
}

pub type CodeFixClassifier = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Keyword classifier used unless the caller supplies a predicate.
pub fn default_code_fix_classifier() -> CodeFixClassifier {
    Arc::new(|description: &str| {
        let lowered = description.to_lowercase();
        ["fix", "bug", "error"].iter().any(|kw| lowered.contains(kw))
    })
}

/// The relief valve: watches depth, dwell time and ambiguity, and decides
/// when the symbolic tier has run out of cheap moves.
pub struct MetaCognitiveMonitor {
    depth_threshold: u32,
    time_threshold_ms: u64,
    evolution_enabled: bool,
    state_entered: Instant,
    impasse_count: u32,
    code_fix: CodeFixClassifier,
}

impl MetaCognitiveMonitor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            depth_threshold: config.cognitive_depth_threshold.max(1),
            time_threshold_ms: config.cognitive_time_threshold_ms.max(1),
            evolution_enabled: config.evolution_enabled,
            state_entered: Instant::now(),
            impasse_count: 0,
            code_fix: default_code_fix_classifier(),
        }
    }

    /// Swap in a caller-supplied code-fix goal predicate.
    pub fn with_code_fix_classifier(mut self, classifier: CodeFixClassifier) -> Self {
        self.code_fix = classifier;
        self
    }

    /// Called by the agent whenever state changes.
    pub fn reset_timer(&mut self) {
        self.state_entered = Instant::now();
    }

    pub fn note_impasse(&mut self) {
        self.impasse_count += 1;
    }

    pub fn impasse_count(&self) -> u32 {
        self.impasse_count
    }

    pub fn metrics(&self, goal_depth: u32, operator_ambiguity: f64) -> CognitiveMetrics {
        CognitiveMetrics {
            goal_depth,
            time_in_state_ms: self.state_entered.elapsed().as_millis() as u64,
            impasse_count: self.impasse_count,
            operator_ambiguity,
        }
    }

    /// Weighted pressure in [0, 1]. A detected loop overrides to at least
    /// [`EVOLUTION_THRESHOLD`].
    pub fn pressure(&self, metrics: &CognitiveMetrics, looping: bool) -> f64 {
        let depth = (metrics.goal_depth as f64 / self.depth_threshold as f64).min(1.0);
        let time = (metrics.time_in_state_ms as f64 / self.time_threshold_ms as f64).min(1.0);
        let pressure =
            DEPTH_WEIGHT * depth + TIME_WEIGHT * time + AMBIGUITY_WEIGHT * metrics.operator_ambiguity;
        if looping {
            pressure.max(EVOLUTION_THRESHOLD)
        } else {
            pressure
        }
    }

    pub fn is_code_fix_goal(&self, description: &str) -> bool {
        (self.code_fix)(description)
    }

    /// Resolution policy.
    pub fn route(&self, pressure: f64, impasse: &Impasse, goal_description: &str) -> ResolutionPath {
        if pressure < HEURISTIC_THRESHOLD {
            return match impasse {
                Impasse::NoChange | Impasse::Tie(_) | Impasse::Conflict(_) => ResolutionPath::Subgoal,
                Impasse::OperatorNoChange(_) => ResolutionPath::Proceed,
            };
        }
        if pressure >= EVOLUTION_THRESHOLD
            && self.evolution_enabled
            && self.is_code_fix_goal(goal_description)
        {
            return ResolutionPath::Evolution;
        }
        ResolutionPath::Heuristic
    }
}

/// Ambiguity contribution of an impasse: 0 for a lone winner, `1 - 1/n` for
/// `n` tied top proposals, 1 when nothing was proposed.
pub fn operator_ambiguity(impasse: Option<&Impasse>) -> f64 {
    match impasse {
        None | Some(Impasse::OperatorNoChange(_)) => 0.0,
        Some(Impasse::NoChange) => 1.0,
        Some(Impasse::Tie(ops)) | Some(Impasse::Conflict(ops)) => {
            if ops.is_empty() {
                1.0
            } else {
                1.0 - 1.0 / ops.len() as f64
            }
        }
    }
}
