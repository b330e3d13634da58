use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use mentat_core::{EngineConfig, LlmClient};

use crate::evaluator::{FitnessEvaluator, FitnessReport, PERFECT_SCORE, SUCCESS_SENTINEL};

/// One candidate repair.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CandidateFix {
    /// What the candidate believes is wrong.
    pub hypothesis: String,
    /// Full replacement source for the broken code.
    pub code_patch: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct CandidatePopulation {
    candidates: Vec<CandidateFix>,
}

/// A candidate with its fitness.
pub struct ScoredCandidate {
    pub candidate: CandidateFix,
    pub report: FitnessReport,
}

/// Population-based repair search.
///
/// Generation zero is seeded entirely by the model; afterwards each round
/// keeps the best candidate, mutates it against its named failure class, and
/// refills the rest of the population with fresh diverse candidates. Returns
/// `None` only when the model could not produce generation zero.
pub struct EvolutionarySolver {
    llm: Arc<LlmClient>,
    evaluator: Arc<dyn FitnessEvaluator>,
    population_size: usize,
    max_generations: usize,
}

impl EvolutionarySolver {
    pub fn new(llm: Arc<LlmClient>, evaluator: Arc<dyn FitnessEvaluator>, config: &EngineConfig) -> Self {
        Self {
            llm,
            evaluator,
            population_size: config.evolution_population_size.clamp(2, 10),
            max_generations: config.evolution_max_generations.clamp(1, 10),
        }
    }

    pub async fn evolve(
        &self,
        error_context: &str,
        goal: &str,
        original_code: &str,
        test_code: Option<&str>,
    ) -> Option<ScoredCandidate> {
        let seed_prompt = self.population_prompt(error_context, goal, original_code, self.population_size);
        let population: CandidatePopulation = self.llm.structured_query_default(&seed_prompt).await?;
        if population.candidates.is_empty() {
            warn!("evolution.empty_seed_population");
            return None;
        }

        let mut best = self.score_population(population.candidates, test_code).await?;
        if best.report.score >= PERFECT_SCORE {
            info!("evolution.converged generation=0 score={}", best.report.score);
            return Some(best);
        }

        for generation in 1..self.max_generations {
            let mut next = Vec::new();

            let mutation_prompt = self.mutation_prompt(error_context, goal, &best);
            if let Some(mutated) = self
                .llm
                .structured_query_default::<CandidateFix>(&mutation_prompt)
                .await
            {
                next.push(mutated);
            }

            if self.population_size > 1 {
                let refill_prompt =
                    self.population_prompt(error_context, goal, original_code, self.population_size - 1);
                if let Some(fresh) = self
                    .llm
                    .structured_query_default::<CandidatePopulation>(&refill_prompt)
                    .await
                {
                    next.extend(fresh.candidates);
                }
            }

            if next.is_empty() {
                // The model has gone away mid-search; the best seen stands.
                warn!("evolution.generation_starved generation={generation}");
                break;
            }

            if let Some(challenger) = self.score_population(next, test_code).await {
                if challenger.report.score > best.report.score {
                    best = challenger;
                }
            }
            debug!(
                "evolution.generation generation={generation} best_score={}",
                best.report.score
            );
            if best.report.score >= PERFECT_SCORE {
                info!("evolution.converged generation={generation} score={}", best.report.score);
                break;
            }
        }

        Some(best)
    }

    /// Score every candidate, returning the best.
    async fn score_population(
        &self,
        candidates: Vec<CandidateFix>,
        test_code: Option<&str>,
    ) -> Option<ScoredCandidate> {
        let mut best: Option<ScoredCandidate> = None;
        for candidate in candidates {
            let report = match self.evaluator.evaluate(&candidate.code_patch, test_code).await {
                Ok(report) => report,
                Err(e) => {
                    // An evaluator breakdown scores the candidate out rather
                    // than aborting the search.
                    warn!("evolution.evaluator_failed err={e:#}");
                    FitnessReport {
                        score: 0,
                        syntax_valid: false,
                        runtime_valid: false,
                        correctness_valid: false,
                        error: Some(e.to_string()),
                        output: None,
                    }
                }
            };
            let replace = match &best {
                Some(current) => report.score > current.report.score,
                None => true,
            };
            if replace {
                best = Some(ScoredCandidate { candidate, report });
            }
        }
        best
    }

    fn population_prompt(
        &self,
        error_context: &str,
        goal: &str,
        original_code: &str,
        count: usize,
    ) -> String {
        format!(
            "You are repairing code for the goal: {goal}\n\n\
             Observed failure:\n{error_context}\n\n\
             Current code:\n```\n{original_code}\n```\n\n\
             Produce {count} DISTINCT candidate repairs. Each must state a \
             different hypothesis about the defect and carry a complete \
             replacement in code_patch. Do not propose re-reading files or \
             repeating actions already tried; every candidate must change the \
             code. A correct repair makes the tests print \"{SUCCESS_SENTINEL}\"."
        )
    }

    fn mutation_prompt(&self, error_context: &str, goal: &str, best: &ScoredCandidate) -> String {
        format!(
            "You are refining the most promising repair for the goal: {goal}\n\n\
             Original failure:\n{error_context}\n\n\
             Best candidate so far (score {}):\n\
             Hypothesis: {}\n```\n{}\n```\n\n\
             Its remaining failure class is `{}`{}. Mutate this candidate to \
             clear that specific failure while keeping what already works. \
             Return one improved candidate.",
            best.report.score,
            best.candidate.hypothesis,
            best.candidate.code_patch,
            best.report.failure_class(),
            best.report
                .error
                .as_deref()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use mentat_core::{ChatRequest, CoreError, LlmTransport};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedTransport {
        responses: Vec<String>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmTransport for ScriptedTransport {
        async fn chat(&self, _request: ChatRequest) -> Result<String, CoreError> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            self.responses
                .get(idx)
                .cloned()
                .ok_or_else(|| CoreError::Transport("script exhausted".to_string()))
        }

        async fn list_models(&self) -> Result<Vec<String>, CoreError> {
            Ok(vec![])
        }
    }

    /// Scores candidates by a marker embedded in the patch text.
    struct ScriptedEvaluator {
        calls: AtomicU32,
    }

    #[async_trait]
    impl FitnessEvaluator for ScriptedEvaluator {
        async fn evaluate(&self, code: &str, _test_code: Option<&str>) -> Result<FitnessReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let score = if code.contains("perfect") {
                100
            } else if code.contains("close") {
                55
            } else {
                20
            };
            Ok(FitnessReport {
                score,
                syntax_valid: true,
                runtime_valid: score > 20,
                correctness_valid: score == 100,
                error: (score < 100).then(|| "IndexError: off by one".to_string()),
                output: None,
            })
        }
    }

    fn candidate_json(tag: &str) -> serde_json::Value {
        serde_json::json!({
            "hypothesis": format!("hypothesis {tag}"),
            "code_patch": format!("# {tag}\n"),
            "reasoning": format!("reasoning {tag}"),
        })
    }

    fn population_json(tags: &[&str]) -> String {
        serde_json::json!({
            "candidates": tags.iter().map(|t| candidate_json(t)).collect::<Vec<_>>()
        })
        .to_string()
    }

    fn config() -> EngineConfig {
        EngineConfig {
            evolution_population_size: 3,
            evolution_max_generations: 3,
            llm_max_retries: 0,
            ..Default::default()
        }
    }

    fn solver(
        responses: Vec<String>,
    ) -> (EvolutionarySolver, Arc<ScriptedTransport>, Arc<ScriptedEvaluator>) {
        let transport = Arc::new(ScriptedTransport {
            responses,
            calls: AtomicU32::new(0),
        });
        let evaluator = Arc::new(ScriptedEvaluator {
            calls: AtomicU32::new(0),
        });
        let llm = Arc::new(LlmClient::with_transport(transport.clone(), &config()));
        (
            EvolutionarySolver::new(llm, evaluator.clone(), &config()),
            transport,
            evaluator,
        )
    }

    #[tokio::test]
    async fn test_generation_zero_short_circuits_on_perfect_candidate() {
        let (solver, transport, evaluator) =
            solver(vec![population_json(&["weak", "perfect", "close"])]);

        let best = solver
            .evolve("IndexError in sort", "Fix the sort bug", "def sort(): pass", None)
            .await
            .expect("best candidate");

        assert_eq!(best.report.score, 100);
        assert!(best.candidate.code_patch.contains("perfect"));
        // One generation call, one evaluation per seeded candidate.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_mutation_round_can_converge() {
        let (solver, transport, _evaluator) = solver(vec![
            population_json(&["weak-a", "weak-b", "close"]),
            candidate_json("perfect mutation").to_string(),
            population_json(&["weak-c", "weak-d"]),
        ]);

        let best = solver
            .evolve("IndexError in sort", "Fix the sort bug", "def sort(): pass", None)
            .await
            .expect("best candidate");

        assert_eq!(best.report.score, 100);
        assert!(best.candidate.hypothesis.contains("perfect mutation"));
        // Seed + mutation + refill.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_seed_failure_returns_none() {
        let (solver, _transport, evaluator) = solver(vec!["not json".to_string()]);
        let best = solver
            .evolve("err", "Fix bug", "code", None)
            .await;
        assert!(best.is_none());
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_llm_death_after_seed_keeps_best() {
        // Seed succeeds, every later call fails: best of generation 0 stands.
        let (solver, _transport, _evaluator) =
            solver(vec![population_json(&["weak-a", "close", "weak-b"])]);

        let best = solver
            .evolve("err", "Fix bug", "code", None)
            .await
            .expect("generation zero best");
        assert_eq!(best.report.score, 55);
        assert!(best.candidate.code_patch.contains("close"));
    }

    #[tokio::test]
    async fn test_mutation_prompt_names_failure_class() {
        let (solver, _t, _e) = solver(vec![]);
        let best = ScoredCandidate {
            candidate: CandidateFix {
                hypothesis: "off by one".to_string(),
                code_patch: "# patch".to_string(),
                reasoning: "r".to_string(),
            },
            report: FitnessReport {
                score: 15,
                syntax_valid: true,
                runtime_valid: false,
                correctness_valid: false,
                error: Some("IndexError: list index out of range".to_string()),
                output: None,
            },
        };
        let prompt = solver.mutation_prompt("ctx", "Fix bug", &best);
        assert!(prompt.contains("`index`"));
        assert!(prompt.contains("IndexError"));
    }
}
