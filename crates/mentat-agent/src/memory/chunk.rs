use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Activation decay per hour since last use.
pub const DECAY_RATE: f64 = 0.5;

/// A proceduralized success: this operator worked in a state with this
/// signature while pursuing this goal.
///
/// Chunks are heuristic hints, not authoritative state; counters only grow
/// and the id is a pure function of (signature, operator), so re-learning
/// the same reflex merges instead of duplicating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub state_signature: BTreeMap<String, String>,
    pub operator_name: String,
    pub operator_params: serde_json::Value,
    pub goal_description: String,
    pub success_count: u32,
    pub failure_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utility: Option<f64>,
}

impl Chunk {
    /// A fresh chunk records the success that created it.
    pub fn new(
        state_signature: BTreeMap<String, String>,
        operator_name: impl Into<String>,
        operator_params: serde_json::Value,
        goal_description: impl Into<String>,
        utility: Option<f64>,
    ) -> Self {
        let operator_name = operator_name.into();
        let id = Self::deterministic_id(&state_signature, &operator_name);
        let now = Utc::now();
        Self {
            id,
            state_signature,
            operator_name,
            operator_params,
            goal_description: goal_description.into(),
            success_count: 1,
            failure_count: 0,
            created_at: now,
            last_used: now,
            utility,
        }
    }

    /// Content hash over the canonical (signature, operator) pair.
    pub fn deterministic_id(
        state_signature: &BTreeMap<String, String>,
        operator_name: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in state_signature {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(operator_name.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// `success_count + failure_count >= 1` holds by construction.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        self.success_count as f64 / total.max(1) as f64
    }

    /// `ln(successes + 1) - DECAY_RATE * hours_since_last_use`.
    pub fn activation(&self, now: DateTime<Utc>) -> f64 {
        let hours = (now - self.last_used).num_seconds().max(0) as f64 / 3600.0;
        ((self.success_count + 1) as f64).ln() - DECAY_RATE * hours
    }

    /// Record a reuse outcome.
    pub fn record_use(&mut self, succeeded: bool) {
        if succeeded {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.last_used = Utc::now();
    }

    /// Text indexed by the vector store.
    pub fn embedding_text(&self) -> String {
        format!(
            "Goal: {} | Operator: {} | Error: {} | Files: {}",
            self.goal_description,
            self.operator_name,
            self.state_signature.get("last_error").map(|s| s.as_str()).unwrap_or(""),
            self.state_signature.get("open_files").map(|s| s.as_str()).unwrap_or(""),
        )
    }
}
