use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of engine statistics at a point in time.
#[derive(Default, Debug, Clone, Copy)]
pub struct EngineStatsSnapshot {
    /// Bytes held by live block regions.
    pub allocated_bytes: u64,
    /// Bytes occupied by records (including tombstones) across all blocks.
    pub data_bytes: i64,
    /// Live records across all blocks.
    pub live_records: i64,
    /// Number of blocks in the index.
    pub blocks: i64,
    /// Number of block splits performed.
    pub splits: u64,
    /// Number of block merges performed.
    pub merges: u64,
    /// Number of compactions that evicted at least one tombstone.
    pub compactions: u64,
    /// Number of capacity expansions along the size ladder.
    pub expansions: u64,
    /// Number of stale-block retries taken by the engine.
    pub retries: u64,
    /// Number of writes refused by the memory ceiling.
    pub rejected_writes: u64,
}

/// Thread-safe engine-wide counters.
///
/// Updated with relaxed atomics outside any lock; values are approximations
/// used for admission control and observability, never for lookups.
#[derive(Default, Debug)]
pub struct EngineStats {
    data_bytes: AtomicI64,
    live_records: AtomicI64,
    blocks: AtomicI64,
    splits: AtomicU64,
    merges: AtomicU64,
    compactions: AtomicU64,
    expansions: AtomicU64,
    retries: AtomicU64,
    rejected_writes: AtomicU64,
}

impl EngineStats {
    /// Returns the bytes occupied by records.
    pub fn data_bytes(&self) -> i64 {
        self.data_bytes.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of live records.
    pub fn live_records(&self) -> i64 {
        self.live_records.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of blocks.
    pub fn blocks(&self) -> i64 {
        self.blocks.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of splits.
    pub fn splits(&self) -> u64 {
        self.splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of merges.
    pub fn merges(&self) -> u64 {
        self.merges.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of effective compactions.
    pub fn compactions(&self) -> u64 {
        self.compactions.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of ladder expansions.
    pub fn expansions(&self) -> u64 {
        self.expansions.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of retries.
    pub fn retries(&self) -> u64 {
        self.retries.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of writes refused by the memory ceiling.
    pub fn rejected_writes(&self) -> u64 {
        self.rejected_writes.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn add_data_bytes(&self, delta: i64) {
        self.data_bytes.fetch_add(delta, AtomicOrdering::Relaxed);
    }

    pub(crate) fn add_live_records(&self, delta: i64) {
        self.live_records.fetch_add(delta, AtomicOrdering::Relaxed);
    }

    pub(crate) fn add_blocks(&self, delta: i64) {
        self.blocks.fetch_add(delta, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_splits(&self) {
        self.splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_merges(&self) {
        self.merges.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_compactions(&self) {
        self.compactions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_expansions(&self) {
        self.expansions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_retries(&self) {
        self.retries.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_rejected_writes(&self) {
        self.rejected_writes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all counters; `allocated_bytes` comes from the arena.
    pub fn snapshot(&self, allocated_bytes: u64) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            allocated_bytes,
            data_bytes: self.data_bytes(),
            live_records: self.live_records(),
            blocks: self.blocks(),
            splits: self.splits(),
            merges: self.merges(),
            compactions: self.compactions(),
            expansions: self.expansions(),
            retries: self.retries(),
            rejected_writes: self.rejected_writes(),
        }
    }
}

impl EngineStatsSnapshot {
    /// Emits the snapshot to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        tracing::info!(
            target: "bigmap::stats",
            allocated_bytes = self.allocated_bytes,
            data_bytes = self.data_bytes,
            live_records = self.live_records,
            blocks = self.blocks,
            splits = self.splits,
            merges = self.merges,
            compactions = self.compactions,
            expansions = self.expansions,
            retries = self.retries,
            rejected_writes = self.rejected_writes,
            "engine stats snapshot"
        );
    }
}
