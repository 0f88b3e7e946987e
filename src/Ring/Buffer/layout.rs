use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};

/// High bit of the write cursor. Once set, every push fails.
pub const SEALED: u64 = 1 << 63;

/// Cursor block for one ring.
///
/// Producers hammer `tail` while the flusher owns `head`, so each cursor
/// gets its own cache line to keep the two sides from false sharing.
#[repr(C, align(128))]
#[derive(Default)]
pub struct RingCursors {
    /// Write cursor. Producers claim sequence numbers by CAS. Carries the
    /// `SEALED` bit after shutdown begins.
    pub tail: CachePadded<AtomicU64>,

    /// Read cursor. Written only by the single consumer; producers read it
    /// to estimate occupancy.
    pub head: CachePadded<AtomicU64>,

    /// Signal word for futex-based parking of the consumer.
    pub signal: AtomicU32,

    /// Set while the consumer is parked on `signal`.
    pub parked: AtomicBool,
}

impl RingCursors {
    pub fn new() -> Self {
        Self::default()
    }
}
