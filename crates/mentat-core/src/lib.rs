//! # Mentat Core
//!
//! Shared foundation for the mentat decision engine: the immutable engine
//! configuration, typed errors, and the structured-output LLM client used by
//! the heuristic resolution tiers.
//!
//! Everything here is deliberately small and dependency-injected. The agent
//! crate owns the decision cycle; this crate owns the contracts it degrades
//! gracefully against when the model server is absent or unreliable.

pub mod config;
pub mod error;
pub mod llm;

pub use config::EngineConfig;
pub use error::CoreError;
pub use llm::{ChatMessage, ChatRequest, HttpTransport, LlmClient, LlmTransport};
