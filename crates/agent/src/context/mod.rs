//! Context budgeting for one agent turn.
//!
//! | Piece | Role |
//! |-------|------|
//! | `token` | Heuristic token estimates for text, messages and tool schemas |
//! | `guard` | Maps a context estimate to none / flush / compact / reject |
//! | `compaction` | Shrinks history to a preserved tail plus an extractive summary |
//! | `assembler` | Builds the system prompt and history under per-layer sub-budgets |

pub mod assembler;
pub mod compaction;
pub mod guard;
pub mod token;

pub use assembler::{AssembledPrompt, AssemblyInput, DropInfo, LayerStats, PromptAssembler};
pub use compaction::{
    CompactionResult, compact_messages, extract_key_points, get_history_within_budget,
    is_important,
};
pub use guard::{ContextGuard, GuardAction, GuardResult, check_thresholds};
pub use token::{
    EstimationMethod, StreamingTokenCounter, TokenEstimate, TokenEstimator, WindowFit,
    context_fits_window,
};
