//! Context bounding and cache planning.
//!
//! Each turn flows leaf-first through:
//!
//! 1. **[`store`]**: append-only history. The first message is the anchor
//!    and is never dropped, summarized or moved.
//! 2. **[`classifier`]**: HIGH / MEDIUM / LOW per message of the region
//!    between the anchor and the recent window.
//! 3. **[`allocator`]**: keeps every HIGH, fills the remaining budget with
//!    MEDIUM in order, drops LOW.
//! 4. **[`summarizer`]**: folds newly dropped messages into the single live
//!    summary, emitted right after the anchor.
//! 5. **[`planner`]**: tiered cache breakpoints over the final sequence.
//!
//! [`manager`] runs these in order and owns the session state. [`usage`]
//! estimates how many tokens a turn submits and how many sit in the cached
//! prefix.

pub mod allocator;
pub mod classifier;
pub mod manager;
pub mod planner;
pub mod store;
pub mod summarizer;
pub mod usage;

pub use classifier::ImportanceClass;
pub use manager::{ContextManager, PreparedTurn, TurnPhase, TurnReport};
pub use usage::{ContextUsage, DEFAULT_CHARS_PER_TOKEN};
