//! # Mentat Agent
//!
//! A hybrid neuro-symbolic decision engine for autonomous code-editing
//! agents. Given a natural-language goal and an environment snapshot, the
//! engine iteratively selects and applies operators against a structured
//! working memory until the goal resolves, a hard failure is reached, or the
//! cycle budget runs out.
//!
//! ## Architecture
//!
//! Three reasoning tiers, cheapest first:
//! - **Symbolic**: a registry of production rules proposes operators; the
//!   impasse detector classifies anything the rules cannot settle.
//! - **Heuristic**: under cognitive pressure the ACT-R resolver asks a local
//!   model for per-operator success/cost estimates and picks the best
//!   utility, with a tabu penalty against repetition.
//! - **Evolutionary**: code-repair goals under maximum pressure run a
//!   population search over candidate patches scored by a sandboxed
//!   evaluator.
//!
//! Successful heuristic and evolutionary resolutions are chunked into
//! unified memory and come back on later cycles as high-priority synthetic
//! rules, so expensive decisions become cheap reflexes. A safety middleware
//! gates every execution (dry-run, destructive-operator approval, utility
//! thresholds).
//!
//! The engine degrades gracefully: without a reachable model server it runs
//! purely symbolically, and without a writable memory store it simply stops
//! learning.

pub mod actr;
pub mod agent;
pub mod compressor;
pub mod evaluator;
pub mod evolution;
pub mod goal;
pub mod impasse;
pub mod memory;
pub mod metacog;
pub mod operator;
pub mod operators;
pub mod outline;
pub mod rules;
pub mod safety;
pub mod state;

pub use actr::{ActRResolver, OperatorEstimate, Selection, UtilityEvaluation};
pub use agent::{CognitiveAgent, NO_OPERATORS_ERROR};
pub use compressor::{CompressedView, ContextCompressor};
pub use evaluator::{CodeEvaluator, FitnessEvaluator, FitnessReport};
pub use evolution::{CandidateFix, EvolutionarySolver, ScoredCandidate};
pub use goal::{Goal, GoalStack, GoalStatus};
pub use impasse::{classify, Decision, Impasse};
pub use memory::{Chunk, UnifiedMemory, VectorStore, WorkingMemory};
pub use metacog::{CognitiveMetrics, MetaCognitiveMonitor, ResolutionPath};
pub use operator::{Operator, OperatorResult, OperatorSpec};
pub use rules::{Proposal, Rule, RuleRegistry};
pub use safety::{ApprovalHandler, SafetyConfig, SafetyMiddleware};
pub use state::AgentState;
