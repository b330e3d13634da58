//! Memory tiers.
//!
//! [`working`] is the per-solve scratchpad: goal stack, snapshots,
//! transitions and the tabu table. [`unified`] persists across solves when a
//! storage directory is supplied: the chunk store and the goal-stack
//! collection, both over the [`store::VectorStore`] contract.

pub mod chunk;
pub mod store;
pub mod unified;
pub mod working;

pub use chunk::{Chunk, DECAY_RATE};
pub use store::{SqliteVectorStore, StoredDocument, VectorStore};
pub use unified::{ContextNode, UnifiedMemory, CHUNK_RULE_LIMIT, MIN_CHUNK_SUCCESS_RATE};
pub use working::{Transition, WorkingMemory, LOOP_WINDOW, TRANSITION_CAPACITY};
