//! Segment scheduler for the tree reduction.
//!
//! The engine posts asynchronous transfers and reacts to their
//! completions; it owns no threads and never blocks except on pool
//! acquire. Internal nodes keep `max_recv_requests` receives in flight
//! per child and fold each arriving segment into its accumulation slot;
//! non-root nodes forward ready segments to their parent while at most
//! `max_send_requests` sends are outstanding; leaves stream their own
//! contribution upward. Whichever callback drops the last reference to
//! the shared state finalizes the call.
//!
//! Callbacks for different transfers may run concurrently: every shared
//! mutation goes through the per-segment slot locks, the ready-set lock,
//! or an atomic counter. No lock is held across a transport call.

use std::sync::Arc;

use crate::collective::state::{ReduceContext, ReduceShared};
use crate::error::Result;
use crate::pool::Lease;
use crate::reduce::apply_op;
use crate::transport::{SegBuf, pack_tag};
use crate::types::Rank;

/// Post the initial batch of transfers for this rank.
pub(crate) fn start(shared: &Arc<ReduceShared>) -> Result<()> {
    let num_segs = shared.seg.num_segs;
    if shared.tree.is_leaf() {
        // Leaves stream their own data: every segment is born ready.
        let depth = num_segs.min(shared.max_send_requests);
        for _ in 0..depth {
            if !try_send_ready(shared)? {
                break;
            }
        }
    } else {
        // Internal nodes prime the receive pipeline for every child.
        let depth = num_segs.min(shared.max_recv_requests);
        for seg_id in 0..depth {
            for (child_idx, &peer) in shared.tree.children.iter().enumerate() {
                post_recv(shared, child_idx, peer, seg_id)?;
            }
        }
    }
    Ok(())
}

/// Post one receive for `seg_id` from a child, staging into a pooled
/// buffer.
fn post_recv(shared: &Arc<ReduceShared>, child_idx: usize, peer: Rank, seg_id: usize) -> Result<()> {
    let pool = shared
        .inbuf_pool
        .as_ref()
        .expect("receiving node has a staging pool");
    let buf = SegBuf::Pooled(pool.acquire());
    let len = shared.seg.len_of(seg_id) * shared.elem_size;

    let mut ctx = shared.ctx_pool.acquire();
    ctx.seg_id = seg_id;
    ctx.child_idx = child_idx;
    ctx.peer = peer;

    let tag = pack_tag(shared.call_tag, seg_id as u32);
    tracing::trace!(rank = shared.rank, seg_id, peer, "posting recv");

    let s = Arc::clone(shared);
    shared
        .transport
        .irecv(buf, len, peer, tag, Box::new(move |res| on_recv_complete(s, ctx, res)))
}

/// Forward the lowest ready segment to the parent if a send slot is free.
/// Returns whether a send was issued.
fn try_send_ready(shared: &Arc<ReduceShared>) -> Result<bool> {
    if !shared.try_reserve_send_slot() {
        return Ok(false);
    }
    let seg_id = {
        let mut ready = shared.ready.lock().expect("ready set lock poisoned");
        ready.next_ready()
    };
    let Some(seg_id) = seg_id else {
        shared.release_send_slot();
        return Ok(false);
    };
    issue_send(shared, seg_id)?;
    Ok(true)
}

/// Send segment `seg_id` to the parent.
///
/// Leaves copy the segment out of their own contribution; internal nodes
/// hand over the segment's accumulation buffer, which has absorbed every
/// child contribution plus the local one.
fn issue_send(shared: &Arc<ReduceShared>, seg_id: usize) -> Result<()> {
    let parent = shared
        .tree
        .parent
        .expect("only non-root ranks forward segments");
    let len = shared.seg.len_of(seg_id) * shared.elem_size;

    let buf = if shared.tree.is_leaf() {
        let range = shared.seg.byte_range(seg_id, shared.elem_size);
        SegBuf::Owned(shared.sbuf[range].to_vec())
    } else {
        let mut slot = shared.accum[seg_id]
            .lock()
            .expect("accumulation slot lock poisoned");
        slot.take().expect("ready segment has an accumulation buffer")
    };

    let mut ctx = shared.ctx_pool.acquire();
    ctx.seg_id = seg_id;
    ctx.child_idx = 0;
    ctx.peer = parent;

    let tag = pack_tag(shared.call_tag, seg_id as u32);
    tracing::trace!(rank = shared.rank, seg_id, parent, "posting send");

    let s = Arc::clone(shared);
    shared
        .transport
        .isend(buf, len, parent, tag, Box::new(move |res| on_send_complete(s, ctx, res)))
}

/// Reaction to one completed receive.
fn on_recv_complete(
    shared: Arc<ReduceShared>,
    ctx: Lease<ReduceContext>,
    res: Result<SegBuf>,
) {
    let (seg_id, child_idx, peer) = (ctx.seg_id, ctx.child_idx, ctx.peer);
    drop(ctx);

    let buf = match res {
        Ok(buf) => buf,
        Err(e) => {
            shared.record_error(e);
            return;
        }
    };
    if shared.failed() {
        return;
    }
    tracing::trace!(rank = shared.rank, seg_id, peer, "recv complete");

    // Keep the pipe full: request this child's next segment before
    // touching any lock.
    let next_id = shared.next_recv_seg[child_idx]
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed) as usize
        + 1;
    if next_id < shared.seg.num_segs {
        if let Err(e) = post_recv(&shared, child_idx, peer, next_id) {
            shared.record_error(e);
            return;
        }
    }

    // Fold the contribution into the segment's accumulation slot.
    let seg_len = shared.seg.len_of(seg_id);
    let payload_bytes = seg_len * shared.elem_size;
    {
        let mut slot = shared.accum[seg_id]
            .lock()
            .expect("accumulation slot lock poisoned");
        let outcome = match slot.as_mut() {
            None => {
                // First arrival: the received buffer becomes the
                // accumulation buffer, seeded with the local
                // contribution.
                let mut buf = buf;
                let local = &shared.sbuf[shared.seg.byte_range(seg_id, shared.elem_size)];
                let r = apply_op(
                    shared.op,
                    local,
                    &mut buf.bytes_mut()[..payload_bytes],
                    seg_len,
                    shared.dtype,
                );
                *slot = Some(buf);
                r
            }
            Some(acc) => {
                // Later arrival: fold into the existing accumulation
                // buffer; the staging buffer goes back to the pool when
                // `buf` drops.
                apply_op(
                    shared.op,
                    &buf.bytes()[..payload_bytes],
                    &mut acc.bytes_mut()[..payload_bytes],
                    seg_len,
                    shared.dtype,
                )
            }
        };
        if let Err(e) = outcome {
            shared.record_error(e);
            return;
        }
    }

    {
        let mut ready = shared.ready.lock().expect("ready set lock poisoned");
        ready.record_arrival(seg_id);
    }

    // Forward the lowest ready segment while a send slot is free.
    if !shared.is_root() {
        if let Err(e) = try_send_ready(&shared) {
            shared.record_error(e);
            return;
        }
    }

    let received = shared
        .num_recv_segs
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        + 1;
    let expected = (shared.seg.num_segs * shared.tree.num_children()) as u32;
    if shared.is_root() && received == expected {
        // Every child contribution is folded in. Dropping this callback's
        // reference (below) finalizes the call.
        tracing::trace!(rank = shared.rank, received, "root received all segments");
    }
}

/// Reaction to one completed send.
fn on_send_complete(
    shared: Arc<ReduceShared>,
    ctx: Lease<ReduceContext>,
    res: Result<SegBuf>,
) {
    let seg_id = ctx.seg_id;
    drop(ctx);

    match res {
        // Dropping the returned buffer releases it (to the pool, if
        // pooled) for the next receive.
        Ok(buf) => drop(buf),
        Err(e) => {
            shared.record_error(e);
            shared.release_send_slot();
            return;
        }
    }
    tracing::trace!(rank = shared.rank, seg_id, "send complete");

    shared.release_send_slot();
    if shared.failed() {
        return;
    }

    // The freed slot can carry the next ready segment.
    if let Err(e) = try_send_ready(&shared) {
        shared.record_error(e);
        return;
    }

    let sent = shared
        .num_sent_segs
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        + 1;
    if !shared.is_root() && sent as usize == shared.seg.num_segs {
        // All of this rank's segments reached the parent. Dropping this
        // callback's reference finalizes the call.
        tracing::trace!(rank = shared.rank, sent, "all segments forwarded");
    }
}
