//! Learning-loop behavior: evolution under loop pressure, chunk reflexes
//! replayed without the model, and memory degradation.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{llm_over, population_json, MarkerEvaluator, ScriptedTransport};
use mentat_agent::memory::SqliteVectorStore;
use mentat_agent::operator::OperatorSpec;
use mentat_agent::operators::RunCodeOperator;
use mentat_agent::{
    AgentState, Chunk, CognitiveAgent, Goal, Operator, Rule, RuleRegistry, UnifiedMemory,
    VectorStore,
};
use mentat_core::EngineConfig;

fn state_in(dir: &tempfile::TempDir) -> AgentState {
    AgentState::new(dir.path().to_string_lossy().to_string())
}

/// A rule stuck on an operator that can never run: no interpreter exists
/// for the target, so every application fails the same way.
fn doomed_registry() -> RuleRegistry {
    let mut registry = RuleRegistry::new();
    registry.register(Rule::new(
        "run_the_tool",
        5.0,
        Arc::new(|_: &AgentState, _: &Goal| true),
        Arc::new(|_: &AgentState, _: &Goal| {
            Some(Arc::new(RunCodeOperator::new("tool.exe")) as Arc<dyn Operator>)
        }),
    ));
    registry
}

#[tokio::test]
async fn test_loop_pressure_escalates_to_evolution_and_repairs() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("calc.py"), "def calc():\n    return 1\n").unwrap();

    let config = EngineConfig {
        cognitive_max_cycles: 6,
        evolution_population_size: 3,
        evolution_max_generations: 3,
        llm_max_retries: 0,
        ..Default::default()
    };

    // One perfect candidate hides in the seeded population.
    let transport = ScriptedTransport::new(vec![population_json(&["weak-a", "perfect", "weak-b"])]);
    let evaluator = MarkerEvaluator::new();
    let store: Arc<SqliteVectorStore> = Arc::new(SqliteVectorStore::open(None).await.unwrap());

    let mut state = state_in(&dir);
    state.open_file("calc.py", "def calc():\n    return 1\n".to_string());

    let mut agent = CognitiveAgent::new(
        config.clone(),
        Some(llm_over(transport.clone(), &config)),
        UnifiedMemory::with_store(store.clone()),
    )
    .with_rules(doomed_registry())
    .with_evaluator(evaluator.clone());

    let (success, final_state) = agent
        .solve("Fix the bug in calc.py", state, false)
        .await;

    // Three identical failures trip loop detection; pressure jumps to 0.9,
    // the goal is a code fix, and the evolutionary tier repairs the file.
    assert!(success);
    assert!(final_state.files["calc.py"].content.contains("perfect"));
    assert!(std::fs::read_to_string(dir.path().join("calc.py"))
        .unwrap()
        .contains("perfect"));

    // One population call; every seeded candidate was scored.
    assert_eq!(transport.call_count(), 1);
    assert_eq!(evaluator.call_count(), 3);

    // The repair was chunked from the evolutionary tier.
    let chunks = store.query("chunks", "calc fix bug", 5, None).await.unwrap();
    assert_eq!(chunks.len(), 1);
    let chunk: Chunk = serde_json::from_value(chunks[0].metadata.clone()).unwrap();
    assert_eq!(chunk.operator_name, "apply_fix(calc.py)");
    assert_eq!(chunk.utility, Some(100.0));
}

#[tokio::test]
async fn test_chunk_reflex_replays_without_model() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.json"), "{}\n").unwrap();

    let store: Arc<SqliteVectorStore> = Arc::new(SqliteVectorStore::open(None).await.unwrap());
    let memory = UnifiedMemory::with_store(store.clone());

    // Seed the chunk a past heuristic resolution would have minted.
    let mut signature = BTreeMap::new();
    signature.insert("goal".to_string(), "Open config.json".to_string());
    signature.insert("working_directory".to_string(), dir.path().to_string_lossy().to_string());
    signature.insert("open_files".to_string(), String::new());
    signature.insert("last_error".to_string(), String::new());
    let chunk = Chunk::new(
        signature,
        "read_file(config.json)",
        serde_json::to_value(OperatorSpec::new("read_file").with_path("config.json")).unwrap(),
        "Open config.json",
        Some(7.0),
    );
    let chunk_id = chunk.id.clone();
    memory.store_chunk(&chunk).await.unwrap();

    // No LLM and no static rules: the chunk reflex is the only move.
    let config = EngineConfig {
        cognitive_max_cycles: 5,
        ..Default::default()
    };
    let mut agent = CognitiveAgent::new(config, None, memory).with_rules(RuleRegistry::new());

    let (success, final_state) = agent
        .solve("Open config.json please", state_in(&dir), false)
        .await;

    assert!(success);
    assert!(final_state.is_file_open("config.json"));

    // Reuse fed back into the chunk's counters.
    let stored = store.get("chunks", &chunk_id).await.unwrap().unwrap();
    let updated: Chunk = serde_json::from_value(stored.metadata).unwrap();
    assert_eq!(updated.success_count, 2);
    assert_eq!(updated.failure_count, 0);
}

#[tokio::test]
async fn test_degraded_memory_still_solves_symbolically() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("main.py"), "x = 1\n").unwrap();

    let config = EngineConfig::default();
    let mut agent = CognitiveAgent::new(config, None, UnifiedMemory::disabled());

    let (success, final_state) = agent.solve("Read main.py", state_in(&dir), false).await;
    assert!(success, "learning disabled is not fatal");
    assert!(final_state.is_file_open("main.py"));
}

#[tokio::test]
async fn test_durable_memory_survives_reopen() {
    let memory_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();
    std::fs::write(work_dir.path().join("config.json"), "{}\n").unwrap();

    {
        let memory = UnifiedMemory::open(Some(memory_dir.path())).await;
        assert!(memory.learning_enabled());
        let mut signature = BTreeMap::new();
        signature.insert("goal".to_string(), "Open config.json".to_string());
        signature.insert(
            "working_directory".to_string(),
            work_dir.path().to_string_lossy().to_string(),
        );
        signature.insert("open_files".to_string(), String::new());
        signature.insert("last_error".to_string(), String::new());
        memory
            .store_chunk(&Chunk::new(
                signature,
                "read_file(config.json)",
                serde_json::to_value(OperatorSpec::new("read_file").with_path("config.json"))
                    .unwrap(),
                "Open config.json",
                None,
            ))
            .await
            .unwrap();
    }

    // A new process over the same directory sees the learned reflex.
    let memory = UnifiedMemory::open(Some(memory_dir.path())).await;
    let config = EngineConfig {
        cognitive_max_cycles: 5,
        ..Default::default()
    };
    let mut agent = CognitiveAgent::new(config, None, memory).with_rules(RuleRegistry::new());

    let (success, final_state) = agent
        .solve(
            "Open config.json please",
            AgentState::new(work_dir.path().to_string_lossy().to_string()),
            false,
        )
        .await;
    assert!(success);
    assert!(final_state.is_file_open("config.json"));
}
