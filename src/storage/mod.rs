//! Block storage, the ordered map built from it, and its operation layer.
//!
//! Blocks hold sorted records in arena regions; the block index orders the
//! blocks into one keyspace; the engine resolves, locks and rewrites blocks
//! on behalf of callers and [`Operation`]s.

/// Sorted record blocks and their locking wrapper.
pub mod block;

/// Lock-free ordering of blocks by anchor key.
pub mod index;

/// Packed multi-field values layered on top of the engine.
pub mod packed;

mod engine;
mod operation;
mod options;
mod scanner;
mod stats;

/// Main map interface.
pub use engine::{BigSortedMap, VerifyReport};

/// Read-modify-write protocol and the built-in operations.
pub use operation::{
    AppendOp, FoundRecord, GetOp, IncrementOp, Operation, Update, Updates, WorkerContext,
    MAX_UPDATES,
};

/// Engine configuration.
pub use options::{EngineOptions, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Range cursors.
pub use scanner::{Entry, Scanner};

/// Engine-wide counters.
pub use stats::{EngineStats, EngineStatsSnapshot};

/// Field-level access to packed values.
pub use packed::{PackedMap, PackedOptions, SetOutcome};
