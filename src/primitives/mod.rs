//! Low-level primitives for building the storage engine.
//!
//! Includes byte utilities, the memory arena blocks allocate from, and the
//! logical-key lock table.

/// Memory regions and allocation accounting.
///
/// Every block owns exactly one region handed out by the arena.
pub mod arena;

/// Byte-level utilities and encoding/decoding.
///
/// Order-preserving integers, short varints and a bounds-checked cursor.
pub mod bytes;

/// Concurrency primitives and synchronization.
///
/// Sharded read/write locks over logical keys.
pub mod concurrency;
