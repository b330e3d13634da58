//! Shared doubles for the integration suites: a scripted LLM transport and
//! a scripted fitness evaluator, in the spirit of the engine's mock-based
//! unit tests.
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use mentat_agent::evaluator::{FitnessEvaluator, FitnessReport};
use mentat_core::{ChatRequest, CoreError, EngineConfig, LlmClient, LlmTransport};

/// Replays canned responses in order; repeats the last one when asked again.
pub struct ScriptedTransport {
    responses: Vec<String>,
    pub calls: AtomicU32,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            responses,
            calls: AtomicU32::new(0),
        })
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmTransport for ScriptedTransport {
    async fn chat(&self, _request: ChatRequest) -> Result<String, CoreError> {
        let idx = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        let capped = idx.min(self.responses.len().saturating_sub(1));
        self.responses
            .get(capped)
            .cloned()
            .ok_or_else(|| CoreError::Transport("no scripted response".to_string()))
    }

    async fn list_models(&self) -> Result<Vec<String>, CoreError> {
        Ok(vec!["scripted".to_string()])
    }
}

pub fn llm_over(transport: Arc<ScriptedTransport>, config: &EngineConfig) -> Arc<LlmClient> {
    Arc::new(LlmClient::with_transport(transport, config))
}

/// Scores candidates by a marker in the patch text: "perfect" -> 100,
/// anything else -> 20.
pub struct MarkerEvaluator {
    pub calls: AtomicU32,
}

impl MarkerEvaluator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FitnessEvaluator for MarkerEvaluator {
    async fn evaluate(&self, code: &str, _test_code: Option<&str>) -> Result<FitnessReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let perfect = code.contains("perfect");
        Ok(FitnessReport {
            score: if perfect { 100 } else { 20 },
            syntax_valid: true,
            runtime_valid: perfect,
            correctness_valid: perfect,
            error: (!perfect).then(|| "IndexError: off by one".to_string()),
            output: None,
        })
    }
}

/// JSON for a `UtilityEvaluation` over (operator, probability, cost) rows.
pub fn utility_evaluation_json(estimates: &[(&str, f64, f64)]) -> String {
    let estimates: Vec<_> = estimates
        .iter()
        .map(|(op, p, c)| {
            serde_json::json!({
                "operator": op,
                "probability_of_success": p,
                "estimated_cost": c,
                "reasoning": format!("scripted estimate for {op}"),
            })
        })
        .collect();
    serde_json::json!({
        "estimates": estimates,
        "recommendation": "scripted recommendation",
    })
    .to_string()
}

/// JSON for a `CandidatePopulation` with the given patch markers.
pub fn population_json(markers: &[&str]) -> String {
    let candidates: Vec<_> = markers
        .iter()
        .map(|m| {
            serde_json::json!({
                "hypothesis": format!("hypothesis {m}"),
                "code_patch": format!("# {m}\n"),
                "reasoning": format!("reasoning {m}"),
            })
        })
        .collect();
    serde_json::json!({ "candidates": candidates }).to_string()
}
