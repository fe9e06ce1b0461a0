#![forbid(unsafe_code)]
//! Allocation of the fixed byte regions blocks are built on.
//!
//! A [`Region`] releases itself exactly once when dropped, so allocation and
//! deallocation are always paired. The arena only keeps accounting; with
//! tracking enabled it also remembers every live region and treats any
//! mismatch as fatal.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Shared allocator state for all blocks of one engine.
pub struct MemoryArena {
    allocated: AtomicU64,
    live: AtomicU64,
    next_id: AtomicU64,
    tracker: Option<Mutex<HashMap<u64, usize>>>,
}

impl MemoryArena {
    /// Creates a new arena; `track_allocations` enables the live-region table.
    pub fn new(track_allocations: bool) -> Arc<Self> {
        Arc::new(Self {
            allocated: AtomicU64::new(0),
            live: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            tracker: track_allocations.then(|| Mutex::new(HashMap::new())),
        })
    }

    /// Allocates a zero-filled region of `size` bytes.
    pub fn allocate(self: &Arc<Self>, size: usize) -> Region {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.allocated.fetch_add(size as u64, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);
        if let Some(tracker) = &self.tracker {
            tracker.lock().insert(id, size);
        }
        tracing::trace!(target: "bigmap::arena", region = id, size, "allocated region");
        Region {
            id,
            buf: vec![0u8; size].into_boxed_slice(),
            arena: Some(Arc::clone(self)),
        }
    }

    /// Total bytes currently held by live regions.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Number of live regions.
    pub fn live_regions(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }

    fn release(&self, id: u64, size: usize) {
        if let Some(tracker) = &self.tracker {
            match tracker.lock().remove(&id) {
                Some(recorded) if recorded == size => {}
                Some(_) => fatal(id, "released region size differs from allocation"),
                None => fatal(id, "released region was never allocated"),
            }
        }
        self.allocated.fetch_sub(size as u64, Ordering::Relaxed);
        self.live.fetch_sub(1, Ordering::Relaxed);
        tracing::trace!(target: "bigmap::arena", region = id, size, "released region");
    }
}

impl fmt::Debug for MemoryArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryArena")
            .field("allocated", &self.allocated_bytes())
            .field("live", &self.live_regions())
            .field("tracking", &self.tracker.is_some())
            .finish()
    }
}

fn fatal(region: u64, reason: &'static str) -> ! {
    tracing::error!(target: "bigmap::arena", region, reason, "allocation tracking mismatch");
    std::process::abort();
}

/// An owned, fixed-size byte region.
pub struct Region {
    id: u64,
    buf: Box<[u8]>,
    arena: Option<Arc<MemoryArena>>,
}

impl Region {
    /// Creates a region outside any arena; used by scratch blocks.
    pub fn detached(size: usize) -> Self {
        Self {
            id: 0,
            buf: vec![0u8; size].into_boxed_slice(),
            arena: None,
        }
    }

    /// Allocates a region of `size` bytes from the same arena as `self`.
    pub fn sibling(&self, size: usize) -> Region {
        match &self.arena {
            Some(arena) => arena.allocate(size),
            None => Region::detached(size),
        }
    }

    /// Whether this region is accounted by an arena.
    pub fn is_detached(&self) -> bool {
        self.arena.is_none()
    }
}

impl Deref for Region {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for Region {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Some(arena) = self.arena.take() {
            arena.release(self.id, self.buf.len());
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("len", &self.buf.len())
            .field("detached", &self.arena.is_none())
            .finish()
    }
}
