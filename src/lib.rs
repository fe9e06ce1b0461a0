//! Embedded ordered key-value storage engine.
//!
//! Records live in arena-owned byte regions grouped into blocks; a lock-free
//! skip list orders the blocks into one logical keyspace. Higher level data
//! types are expressed as [`storage::Operation`]s executed against a located
//! record.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::{BigSortedMap, EngineOptions, Scanner};
pub use types::{BigMapError, Result, Retry};
