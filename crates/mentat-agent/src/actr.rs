use log::{debug, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use mentat_core::{EngineConfig, LlmClient};

use crate::compressor::ContextCompressor;
use crate::goal::Goal;
use crate::memory::WorkingMemory;
use crate::operator::{Operator, OperatorSpec};
use crate::state::AgentState;

/// Token budget for the compressed state embedded in resolver prompts.
const PROMPT_BUDGET_TOKENS: usize = 1500;
/// Cap on LLM-suggested operators per no-change impasse.
const MAX_SUGGESTIONS: usize = 5;

/// Per-operator estimate returned by the model.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OperatorEstimate {
    /// Exact operator name being estimated.
    pub operator: String,
    /// Probability the operator advances the goal, in [0, 1].
    pub probability_of_success: f64,
    /// Execution cost on a 1 (trivial) to 10 (expensive) scale.
    pub estimated_cost: f64,
    pub reasoning: String,
}

/// The structured response the resolver asks the model for.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UtilityEvaluation {
    pub estimates: Vec<OperatorEstimate>,
    pub recommendation: String,
}

/// Operator suggestions for a no-change impasse.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OperatorSuggestions {
    pub suggestions: Vec<OperatorSpec>,
}

/// A resolver pick: the winning operator, its computed utility, and the
/// model's reasoning for the estimate that produced it.
pub struct Selection {
    pub operator: Arc<dyn Operator>,
    pub utility: f64,
    pub reasoning: String,
}

/// ACT-R-style utility resolver.
///
/// The model supplies P and C per candidate; the resolver computes
/// `U = P*G - C - action_count*penalty + Normal(0, sigma)` and picks the
/// maximum. Estimates are merged back in input operator order, and the whole
/// call degrades to `None` when the model is unavailable or its answer does
/// not cover the candidate set.
pub struct ActRResolver {
    llm: Arc<LlmClient>,
    compressor: ContextCompressor,
    goal_value: f64,
    noise_stddev: f64,
    penalty_multiplier: f64,
    rng: Mutex<StdRng>,
}

impl ActRResolver {
    pub fn new(llm: Arc<LlmClient>, config: &EngineConfig) -> Self {
        Self {
            llm,
            compressor: ContextCompressor::default(),
            goal_value: config.actr_goal_value,
            noise_stddev: config.actr_noise_stddev,
            penalty_multiplier: config.cognitive_history_penalty_multiplier,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic noise source for tests.
    pub fn with_seeded_rng(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Pick the highest-utility operator among `operators`, or `None` when
    /// the model cannot produce a usable evaluation.
    pub async fn resolve(
        &self,
        operators: &[Arc<dyn Operator>],
        state: &AgentState,
        goal: &Goal,
        working_memory: &WorkingMemory,
        history: &[String],
    ) -> Option<Selection> {
        if operators.is_empty() {
            return None;
        }

        let prompt = self.build_utility_prompt(operators, state, goal, working_memory, history);
        let evaluation: UtilityEvaluation = self.llm.structured_query_default(&prompt).await?;

        if evaluation.estimates.len() != operators.len() {
            warn!(
                "actr.estimate_mismatch expected={} got={}",
                operators.len(),
                evaluation.estimates.len()
            );
            return None;
        }

        // Merge back in input order so utility evaluation preserves the
        // proposal ordering guarantees.
        let mut best: Option<Selection> = None;
        for operator in operators {
            let name = operator.name();
            let estimate = match evaluation.estimates.iter().find(|e| e.operator == name) {
                Some(estimate) => estimate,
                None => {
                    warn!("actr.estimate_missing operator={name}");
                    return None;
                }
            };

            let probability = estimate.probability_of_success.clamp(0.0, 1.0);
            let cost = estimate.estimated_cost.clamp(1.0, 10.0);
            let penalty = working_memory.action_count(&name) as f64 * self.penalty_multiplier;
            let utility = probability * self.goal_value - cost - penalty + self.sample_noise();

            debug!(
                "actr.utility op={name} p={probability:.2} c={cost:.1} penalty={penalty:.1} u={utility:.2}"
            );

            let better = match &best {
                Some(current) => utility > current.utility,
                None => true,
            };
            if better {
                best = Some(Selection {
                    operator: operator.clone(),
                    utility,
                    reasoning: estimate.reasoning.clone(),
                });
            }
        }
        best
    }

    /// Ask the model to invent 1-5 operators for a no-change impasse. An
    /// unavailable model yields an empty list.
    pub async fn generate_operators(&self, state: &AgentState, goal: &Goal) -> Vec<OperatorSpec> {
        let view = self.compressor.compress(state, &goal.description, PROMPT_BUDGET_TOKENS);
        let prompt = format!(
            "You control a code-editing agent that is stuck: no rule proposed any \
             action for the current goal.\n\n{}\n\
             Suggest between 1 and 5 concrete next operators. Allowed kinds: \
             read_file, list_directory, write_file, apply_fix, run_code. \
             `path` is required for every kind except list_directory; \
             write_file and apply_fix also require `content`. \
             Paths are relative to the working directory.",
            view.render()
        );

        let suggestions: Option<OperatorSuggestions> =
            self.llm.structured_query_default(&prompt).await;
        let mut specs = suggestions.map(|s| s.suggestions).unwrap_or_default();
        specs.truncate(MAX_SUGGESTIONS);
        specs
    }

    fn build_utility_prompt(
        &self,
        operators: &[Arc<dyn Operator>],
        state: &AgentState,
        goal: &Goal,
        working_memory: &WorkingMemory,
        history: &[String],
    ) -> String {
        let view = self.compressor.compress(state, &goal.description, PROMPT_BUDGET_TOKENS);
        let mut prompt = String::from(
            "You are the utility estimator for a code-editing agent choosing its next \
             operator.\n\n",
        );
        prompt.push_str(&view.render());

        prompt.push_str("\nCandidate operators:\n");
        for operator in operators {
            let name = operator.name();
            prompt.push_str(&format!(
                "  - {} (already tried {} times this session)\n",
                name,
                working_memory.action_count(&name)
            ));
        }

        if !history.is_empty() {
            prompt.push_str("\nRelevant past solutions:\n");
            for line in history {
                prompt.push_str(&format!("  - {line}\n"));
            }
        }

        prompt.push_str(&format!(
            "\nFor EVERY candidate operator, estimate probability_of_success in [0,1] \
             and estimated_cost on a 1-10 scale (1 = trivial read, 10 = long-running \
             or risky change). The agent computes utility as \
             P * {} - cost - repetition penalty, so repeating an already-tried \
             operator must clear a higher bar. Respond with one estimate per \
             candidate, using the exact operator names given.",
            self.goal_value
        ));
        prompt
    }

    fn sample_noise(&self) -> f64 {
        if self.noise_stddev <= 0.0 {
            return 0.0;
        }
        match Normal::new(0.0, self.noise_stddev) {
            Ok(normal) => {
                let mut rng = self.rng.lock().expect("rng lock");
                normal.sample(&mut *rng)
            }
            Err(_) => 0.0,
        }
    }
}
