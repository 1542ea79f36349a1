//! Shared per-call state of the reduction engine.
//!
//! One `ReduceShared` exists per collective call, held through an `Arc` by
//! every in-flight transfer callback. Whichever completion path drops the
//! last reference runs the `Drop` finalizer, which completes the result
//! handle exactly once — the refcount itself is the termination detector.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::collective::handle::ResultCell;
use crate::config::TuningParams;
use crate::error::ArborError;
use crate::pool::FreeList;
use crate::segment::Segmentation;
use crate::topology::Tree;
use crate::transport::{SegBuf, Transport};
use crate::types::{DataType, Rank, ReduceOp};

/// Bookkeeping for one in-flight transfer. Recycled through the context
/// pool so the hot path does not allocate.
#[derive(Debug, Default)]
pub(crate) struct ReduceContext {
    pub seg_id: usize,
    pub child_idx: usize,
    pub peer: Rank,
}

/// Per-segment arrival tracking.
///
/// A segment is ready to forward once contributions from all children have
/// been folded into its accumulation slot. `next_ready` hands out the
/// lowest ready segment that has not been taken yet; readiness follows
/// completion order of the last contributing child, so a later segment can
/// overtake an earlier one still waiting on a slow child. That bounded
/// reordering is correct because the operator is commutative.
pub(crate) struct ReadySet {
    arrivals: Vec<u32>,
    taken: Vec<bool>,
    num_children: u32,
}

impl ReadySet {
    pub(crate) fn new(num_segs: usize, num_children: usize) -> Self {
        Self {
            arrivals: vec![0; num_segs],
            taken: vec![false; num_segs],
            num_children: num_children as u32,
        }
    }

    /// Record one child contribution for `seg_id`; returns the new count.
    pub(crate) fn record_arrival(&mut self, seg_id: usize) -> u32 {
        self.arrivals[seg_id] += 1;
        debug_assert!(self.arrivals[seg_id] <= self.num_children);
        self.arrivals[seg_id]
    }

    /// Take the lowest-id segment with contributions from every child.
    /// Leaves have zero children, so every segment is born ready.
    pub(crate) fn next_ready(&mut self) -> Option<usize> {
        for seg_id in 0..self.arrivals.len() {
            if !self.taken[seg_id] && self.arrivals[seg_id] == self.num_children {
                self.taken[seg_id] = true;
                return Some(seg_id);
            }
        }
        None
    }
}

/// State shared by every completion callback of one reduction call.
pub(crate) struct ReduceShared {
    pub rank: Rank,
    pub root: Rank,
    pub tree: Tree,
    pub dtype: DataType,
    pub op: ReduceOp,
    pub seg: Segmentation,
    pub elem_size: usize,
    pub call_tag: u32,
    pub max_send_requests: usize,
    pub max_recv_requests: usize,
    pub transport: Arc<dyn Transport>,

    /// This rank's own contribution, folded into every segment exactly
    /// once (when the segment's first child contribution arrives, or sent
    /// directly at leaves).
    pub sbuf: Vec<u8>,

    /// Receive-staging buffer pool; present only on nodes with children.
    pub inbuf_pool: Option<FreeList<Vec<u8>>>,
    pub ctx_pool: FreeList<ReduceContext>,

    /// One independently lockable accumulation slot per segment. At most
    /// one buffer is the authoritative partial result for a segment at
    /// any time.
    pub accum: Vec<Mutex<Option<SegBuf>>>,
    pub ready: Mutex<ReadySet>,

    /// Next segment id to request from each child.
    pub next_recv_seg: Vec<AtomicU32>,
    pub num_recv_segs: AtomicU32,
    pub num_sent_segs: AtomicU32,
    ongoing_sends: AtomicU32,

    /// First fatal error; the call finalizes with it.
    error: Mutex<Option<ArborError>>,

    cell: Arc<ResultCell>,
}

impl ReduceShared {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        rank: Rank,
        root: Rank,
        tree: Tree,
        dtype: DataType,
        op: ReduceOp,
        seg: Segmentation,
        call_tag: u32,
        params: &TuningParams,
        transport: Arc<dyn Transport>,
        sbuf: Vec<u8>,
        cell: Arc<ResultCell>,
    ) -> Self {
        let elem_size = dtype.size_in_bytes();
        let num_children = tree.num_children();
        let recv_depth = seg.num_segs.min(params.max_recv_requests);

        // Staging pool sized for the receive pipeline depth, not for the
        // message: `children * max_recv_requests` buffers may be in
        // flight at once, growth covers accumulation slots that outlive
        // their transfer.
        let inbuf_pool = (num_children > 0).then(|| {
            let seg_bytes = seg.seg_count * elem_size;
            FreeList::new(
                params.inbuf_pool_min.max(num_children * recv_depth),
                params.inbuf_pool_max,
                params.inbuf_pool_inc,
                move || vec![0u8; seg_bytes],
            )
        });
        let ctx_pool = FreeList::new(
            params
                .context_pool_min
                .max(num_children * recv_depth + params.max_send_requests),
            params.context_pool_max,
            params.context_pool_inc,
            ReduceContext::default,
        );

        Self {
            rank,
            root,
            dtype,
            op,
            elem_size,
            call_tag,
            max_send_requests: params.max_send_requests,
            max_recv_requests: params.max_recv_requests,
            transport,
            sbuf,
            inbuf_pool,
            ctx_pool,
            accum: (0..seg.num_segs).map(|_| Mutex::new(None)).collect(),
            ready: Mutex::new(ReadySet::new(seg.num_segs, num_children)),
            next_recv_seg: (0..num_children)
                .map(|_| AtomicU32::new(recv_depth.saturating_sub(1) as u32))
                .collect(),
            num_recv_segs: AtomicU32::new(0),
            num_sent_segs: AtomicU32::new(0),
            ongoing_sends: AtomicU32::new(0),
            error: Mutex::new(None),
            seg,
            tree,
            cell,
        }
    }

    pub(crate) fn is_root(&self) -> bool {
        self.rank == self.root
    }

    /// Reserve one of the bounded send slots; the count never exceeds
    /// `max_send_requests`.
    pub(crate) fn try_reserve_send_slot(&self) -> bool {
        self.ongoing_sends
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                ((v as usize) < self.max_send_requests).then_some(v + 1)
            })
            .is_ok()
    }

    pub(crate) fn release_send_slot(&self) {
        self.ongoing_sends.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record the first fatal error; later errors are dropped.
    pub(crate) fn record_error(&self, e: ArborError) {
        tracing::warn!(rank = self.rank, error = %e, "reduction aborting");
        let mut slot = self.error.lock().expect("error slot lock poisoned");
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    pub(crate) fn failed(&self) -> bool {
        self.error
            .lock()
            .expect("error slot lock poisoned")
            .is_some()
    }
}

impl Drop for ReduceShared {
    fn drop(&mut self) {
        // Last reference gone: all work for this rank is finished (or the
        // call aborted). Complete the result handle exactly once.
        if let Some(e) = self.error.get_mut().expect("error slot lock poisoned").take() {
            tracing::debug!(rank = self.rank, "reduction finalized with error");
            self.cell.complete(Err(e));
            return;
        }

        if self.rank != self.root {
            tracing::debug!(
                rank = self.rank,
                sent = self.num_sent_segs.load(Ordering::Relaxed),
                "reduction finalized"
            );
            self.cell.complete(Ok(None));
            return;
        }

        // Root: assemble the final buffer from the accumulation slots.
        let mut out = vec![0u8; self.seg.count * self.elem_size];
        for seg_id in 0..self.seg.num_segs {
            let slot = self.accum[seg_id]
                .get_mut()
                .expect("accumulation slot lock poisoned")
                .take()
                .expect("finalized root segment missing accumulation buffer");
            let range = self.seg.byte_range(seg_id, self.elem_size);
            let len = range.len();
            out[range].copy_from_slice(&slot.bytes()[..len]);
        }
        tracing::debug!(
            rank = self.rank,
            received = self.num_recv_segs.load(Ordering::Relaxed),
            "root reduction finalized"
        );
        self.cell.complete(Ok(Some(out)));
    }
}
