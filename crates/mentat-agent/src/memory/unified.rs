use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

use super::chunk::Chunk;
use super::store::{SqliteVectorStore, VectorStore};
use crate::goal::GoalStatus;
use crate::operator::OperatorSpec;
use crate::operators::materialize;
use crate::rules::{Rule, CHUNK_RULE_PRIORITY};
use crate::state::AgentState;

const CHUNK_COLLECTION: &str = "chunks";
const GOAL_COLLECTION: &str = "goal_stack";

/// Retrieval policy: minimum success rate and injection cap for
/// chunk-derived synthetic rules.
pub const MIN_CHUNK_SUCCESS_RATE: f64 = 0.7;
pub const CHUNK_RULE_LIMIT: usize = 3;

/// A persisted goal frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub goal_description: String,
    pub state_snapshot: Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_reasoning: Option<String>,
}

/// Long-lived memory: the chunk store and the persisted goal stack, both
/// backed by the same indexed collection store.
///
/// Construction failure of the backing store is non-fatal. The goal chain
/// still works in-process; chunk learning is disabled, retrievals come back
/// empty, and stores become no-ops.
pub struct UnifiedMemory {
    store: Option<Arc<dyn VectorStore>>,
    active_chain: Vec<ContextNode>,
}

impl UnifiedMemory {
    /// Open memory, durable under `directory` when given.
    pub async fn open(directory: Option<&Path>) -> Self {
        match SqliteVectorStore::open(directory).await {
            Ok(store) => Self {
                store: Some(Arc::new(store)),
                active_chain: Vec::new(),
            },
            Err(e) => {
                warn!("memory.store_unavailable learning_disabled err={e:#}");
                Self {
                    store: None,
                    active_chain: Vec::new(),
                }
            }
        }
    }

    /// Build over an injected store. Test seam.
    pub fn with_store(store: Arc<dyn VectorStore>) -> Self {
        Self {
            store: Some(store),
            active_chain: Vec::new(),
        }
    }

    /// Memory with learning disabled.
    pub fn disabled() -> Self {
        Self {
            store: None,
            active_chain: Vec::new(),
        }
    }

    pub fn learning_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Insert a chunk, merging counters into any existing chunk with the
    /// same deterministic id.
    pub async fn store_chunk(&self, chunk: &Chunk) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let merged = match store.get(CHUNK_COLLECTION, &chunk.id).await? {
            Some(existing) => {
                let mut prior: Chunk = serde_json::from_value(existing.metadata)?;
                prior.success_count += chunk.success_count;
                prior.failure_count += chunk.failure_count;
                prior.last_used = prior.last_used.max(chunk.last_used);
                prior.utility = chunk.utility.or(prior.utility);
                prior
            }
            None => chunk.clone(),
        };

        store
            .update(
                CHUNK_COLLECTION,
                &merged.id,
                &merged.embedding_text(),
                &serde_json::to_value(&merged)?,
            )
            .await
    }

    /// Record a reuse outcome for a stored chunk.
    pub async fn update_success(&self, chunk_id: &str, succeeded: bool) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let Some(existing) = store.get(CHUNK_COLLECTION, chunk_id).await? else {
            return Ok(());
        };
        let mut chunk: Chunk = serde_json::from_value(existing.metadata)?;
        chunk.record_use(succeeded);
        store
            .update(
                CHUNK_COLLECTION,
                chunk_id,
                &chunk.embedding_text(),
                &serde_json::to_value(&chunk)?,
            )
            .await
    }

    /// Chunks similar to the current situation, filtered by success rate and
    /// ordered by descending activation.
    pub async fn retrieve_similar(
        &self,
        state: &AgentState,
        goal_description: &str,
        top_k: usize,
        min_success_rate: f64,
    ) -> Vec<Chunk> {
        let Some(store) = &self.store else {
            return Vec::new();
        };

        let query = format!(
            "Goal: {} | Error: {} | Files: {}",
            goal_description,
            state.latest_error().unwrap_or(""),
            state.files.keys().cloned().collect::<Vec<_>>().join(","),
        );

        // Overfetch so the success-rate filter does not starve the result.
        let candidates = match store.query(CHUNK_COLLECTION, &query, top_k * 4, None).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("memory.retrieve_failed err={e:#}");
                return Vec::new();
            }
        };

        let now = Utc::now();
        let mut chunks: Vec<Chunk> = candidates
            .into_iter()
            .filter_map(|doc| serde_json::from_value::<Chunk>(doc.metadata).ok())
            .filter(|chunk| chunk.success_rate() >= min_success_rate)
            .collect();
        chunks.sort_by(|a, b| {
            b.activation(now)
                .partial_cmp(&a.activation(now))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        chunks.truncate(top_k);
        chunks
    }

    /// Materialize retrieved chunks as priority-7 synthetic rules for this
    /// cycle. The static registry is never mutated.
    pub async fn synthetic_rules(&self, state: &AgentState, goal_description: &str) -> Vec<Rule> {
        let chunks = self
            .retrieve_similar(state, goal_description, CHUNK_RULE_LIMIT, MIN_CHUNK_SUCCESS_RATE)
            .await;

        chunks
            .into_iter()
            .filter_map(|chunk| {
                let spec: OperatorSpec = serde_json::from_value(chunk.operator_params.clone()).ok()?;
                debug!(
                    "memory.chunk_rule op={} success_rate={:.2}",
                    chunk.operator_name,
                    chunk.success_rate()
                );
                Some(Rule::new(
                    format!("chunk:{}", chunk.id),
                    CHUNK_RULE_PRIORITY,
                    Arc::new(|_: &AgentState, _: &crate::goal::Goal| true),
                    Arc::new(move |_: &AgentState, _: &crate::goal::Goal| materialize(&spec)),
                ))
            })
            .collect()
    }

    /// Push a goal frame; returns the new context id.
    pub async fn push_context(
        &mut self,
        goal_description: &str,
        state: &AgentState,
        parent_id: Option<String>,
    ) -> String {
        let node = ContextNode {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id,
            goal_description: goal_description.to_string(),
            state_snapshot: serde_json::to_value(state).unwrap_or(Value::Null),
            status: GoalStatus::Active.as_str().to_string(),
            created_at: Utc::now(),
            depth: self.active_chain.len() as u32,
            resolution_operator: None,
            resolution_reasoning: None,
        };
        self.persist(&node).await;
        let id = node.id.clone();
        self.active_chain.push(node);
        id
    }

    /// Seal and pop the active frame; returns the parent context id.
    pub async fn pop_context(
        &mut self,
        status: GoalStatus,
        resolution_operator: Option<String>,
        resolution_reasoning: Option<String>,
    ) -> Option<String> {
        let mut node = self.active_chain.pop()?;
        node.status = status.as_str().to_string();
        node.resolution_operator = resolution_operator;
        node.resolution_reasoning = resolution_reasoning;
        self.persist(&node).await;
        self.active_chain.last().map(|n| n.id.clone())
    }

    pub fn get_active_context(&self) -> Option<&ContextNode> {
        self.active_chain.last()
    }

    pub fn get_context_chain(&self) -> &[ContextNode] {
        &self.active_chain
    }

    /// Past resolved goals matching a query, rendered for prompt injection.
    pub async fn retrieve_relevant_history(&self, query: &str, max_results: usize) -> Vec<String> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        let docs = match store
            .query(
                GOAL_COLLECTION,
                query,
                max_results,
                Some(&json!({"status": "success"})),
            )
            .await
        {
            Ok(docs) => docs,
            Err(e) => {
                warn!("memory.history_failed err={e:#}");
                return Vec::new();
            }
        };

        docs.into_iter()
            .filter_map(|doc| serde_json::from_value::<ContextNode>(doc.metadata).ok())
            .map(|node| match &node.resolution_operator {
                Some(op) => format!(
                    "Previously solved \"{}\" with {}",
                    node.goal_description, op
                ),
                None => format!("Previously solved \"{}\"", node.goal_description),
            })
            .collect()
    }

    async fn persist(&self, node: &ContextNode) {
        let Some(store) = &self.store else {
            return;
        };
        let metadata = match serde_json::to_value(node) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("memory.context_serialize_failed err={e}");
                return;
            }
        };
        if let Err(e) = store
            .update(GOAL_COLLECTION, &node.id, &node.goal_description, &metadata)
            .await
        {
            // A failed context write never fails the cycle.
            warn!("memory.context_persist_failed err={e:#}");
        }
    }
}
