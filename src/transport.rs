//! Interface to the asynchronous point-to-point messaging substrate.
//!
//! The engine never owns threads and never polls: it posts sends and
//! receives through [`Transport`] and reacts when the substrate invokes
//! each transfer's completion callback. A callback is invoked exactly once
//! per transfer, runs to completion before another callback for the same
//! transfer could run, and may be invoked from any thread — callbacks for
//! different transfers may run concurrently.
//!
//! Buffers travel with the transfer: the engine hands the substrate an
//! owned [`SegBuf`] and receives it back (filled, for receives) through
//! the callback. This keeps ownership explicit with no pointer recovery.

use crate::error::Result;
use crate::pool::Lease;
use crate::types::Rank;

/// Wire tag carried by every transfer.
///
/// A per-call tag in the high bits combined with the segment id in the low
/// 16 bits distinguishes concurrent segments of the same call on the wire.
pub type WireTag = u64;

/// Pack a call tag and a segment id into a wire tag.
pub fn pack_tag(call_tag: u32, seg_id: u32) -> WireTag {
    debug_assert!(seg_id < (1 << 16), "segment id exceeds tag field");
    ((call_tag as u64) << 16) | (seg_id as u64)
}

/// Number of distinct call tags before the allocator wraps.
const CALL_TAG_SPACE: u32 = 4096;

/// Allocates per-call tags for one group of communicating processes.
///
/// Tags cycle through `[4096, 8192)`; the window is large enough that a
/// wrapped tag can only collide with a call that has long since finished.
#[derive(Debug, Default)]
pub struct CallTagAllocator {
    next: std::sync::atomic::AtomicU32,
}

impl CallTagAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next call tag.
    pub fn next_tag(&self) -> u32 {
        let t = self
            .next
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        (t % CALL_TAG_SPACE) + CALL_TAG_SPACE
    }
}

/// An owned byte buffer moving through a transfer.
///
/// `Pooled` buffers are leases from a call's staging pool and return to it
/// when dropped; `Owned` buffers are plain allocations (leaf contribution
/// copies, or accumulation buffers on nodes without a pool).
pub enum SegBuf {
    Pooled(Lease<Vec<u8>>),
    Owned(Vec<u8>),
}

impl SegBuf {
    pub fn bytes(&self) -> &[u8] {
        match self {
            SegBuf::Pooled(lease) => lease,
            SegBuf::Owned(v) => v,
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            SegBuf::Pooled(lease) => lease,
            SegBuf::Owned(v) => v,
        }
    }
}

impl std::fmt::Debug for SegBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegBuf::Pooled(lease) => write!(f, "SegBuf::Pooled({} bytes)", lease.len()),
            SegBuf::Owned(v) => write!(f, "SegBuf::Owned({} bytes)", v.len()),
        }
    }
}

/// Completion callback for a send: receives the payload buffer back so the
/// engine can recycle it, or the transfer error.
pub type SendCompletion = Box<dyn FnOnce(Result<SegBuf>) + Send + 'static>;

/// Completion callback for a receive: receives the staging buffer back
/// with the payload written into its prefix, or the transfer error.
pub type RecvCompletion = Box<dyn FnOnce(Result<SegBuf>) + Send + 'static>;

/// Asynchronous point-to-point messaging substrate.
///
/// Implementations must invoke each `on_complete` exactly once. Errors
/// detected while posting are returned synchronously and mean the callback
/// will never run; errors detected later are delivered through the
/// callback.
pub trait Transport: Send + Sync {
    /// Post an asynchronous send of `buf.bytes()[..len]` to `peer`.
    fn isend(
        &self,
        buf: SegBuf,
        len: usize,
        peer: Rank,
        tag: WireTag,
        on_complete: SendCompletion,
    ) -> Result<()>;

    /// Post an asynchronous receive of `len` bytes from `peer` into
    /// `buf.bytes_mut()[..len]`.
    fn irecv(
        &self,
        buf: SegBuf,
        len: usize,
        peer: Rank,
        tag: WireTag,
        on_complete: RecvCompletion,
    ) -> Result<()>;
}
