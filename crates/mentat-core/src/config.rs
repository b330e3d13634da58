use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::CoreError;

/// Immutable engine configuration, loaded once at startup.
///
/// Every knob the decision engine honors lives here. Out-of-range values are
/// normalized on load rather than rejected: the engine always starts with a
/// usable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Model identifier sent to the transport.
    pub llm_model: String,
    /// Base URL of the local model server.
    pub llm_host: String,
    /// Default sampling temperature, clamped to [0, 2].
    pub llm_temperature: f64,
    /// Attempts beyond the first on transport or schema failure.
    pub llm_max_retries: u32,
    /// Per-attempt deadline in seconds.
    pub llm_timeout: u64,
    /// `G` in the ACT-R utility formula.
    pub actr_goal_value: f64,
    /// Standard deviation of the Gaussian utility noise term.
    pub actr_noise_stddev: f64,
    /// Goal depth at which depth pressure saturates.
    pub cognitive_depth_threshold: u32,
    /// Time in state at which time pressure saturates.
    pub cognitive_time_threshold_ms: u64,
    /// Hard ceiling on decision cycles per solve.
    pub cognitive_max_cycles: u32,
    /// Tabu penalty weight per prior application of an operator.
    pub cognitive_history_penalty_multiplier: f64,
    /// Toggles the evolutionary solver tier.
    pub evolution_enabled: bool,
    /// Population size per generation, clamped to [2, 10].
    pub evolution_population_size: usize,
    /// Generation count, clamped to [1, 10].
    pub evolution_max_generations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            llm_model: "qwen2.5-coder:7b".to_string(),
            llm_host: "http://localhost:11434".to_string(),
            llm_temperature: 0.2,
            llm_max_retries: 2,
            llm_timeout: 5,
            actr_goal_value: 10.0,
            actr_noise_stddev: 0.5,
            cognitive_depth_threshold: 3,
            cognitive_time_threshold_ms: 500,
            cognitive_max_cycles: 50,
            cognitive_history_penalty_multiplier: 2.0,
            evolution_enabled: true,
            evolution_population_size: 3,
            evolution_max_generations: 3,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file and normalize it.
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, CoreError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        Ok(config.normalized())
    }

    /// Clamp every bounded option into its documented range.
    pub fn normalized(mut self) -> Self {
        self.llm_temperature = self.llm_temperature.clamp(0.0, 2.0);
        self.evolution_population_size = self.evolution_population_size.clamp(2, 10);
        self.evolution_max_generations = self.evolution_max_generations.clamp(1, 10);
        if self.cognitive_max_cycles == 0 {
            self.cognitive_max_cycles = 1;
        }
        if self.llm_timeout == 0 {
            self.llm_timeout = 1;
        }
        self
    }
}
