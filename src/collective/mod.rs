//! Non-blocking tree reduction over an asynchronous messaging substrate.

mod handle;
mod ireduce;
mod state;

pub use handle::ReduceHandle;

use std::sync::Arc;

use crate::collective::handle::ResultCell;
use crate::collective::state::ReduceShared;
use crate::config::TuningParams;
use crate::error::{ArborError, Result};
use crate::segment::{Segmentation, computed_seg_count};
use crate::topology::{
    Tree, build_binomial_tree, build_chain_tree, build_in_order_binomial_tree, build_kary_tree,
};
use crate::transport::{CallTagAllocator, Transport};
use crate::types::{DataType, Rank, ReduceOp};

/// Tree shape the reduction runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceAlgorithm {
    /// Binomial tree, `ceil(log2(N))` deep.
    Binomial,
    /// Rank-order-preserving binomial tree.
    InOrderBinomial,
    /// Binary (2-ary) tree.
    Binary,
    /// Single chain: every rank forwards to its predecessor.
    Pipeline,
    /// Four parallel chains hanging off the root.
    Chain,
    /// Flat tree: every rank is a direct child of the root.
    Linear,
}

impl ReduceAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            ReduceAlgorithm::Binomial => "binomial",
            ReduceAlgorithm::InOrderBinomial => "in_order_binomial",
            ReduceAlgorithm::Binary => "binary",
            ReduceAlgorithm::Pipeline => "pipeline",
            ReduceAlgorithm::Chain => "chain",
            ReduceAlgorithm::Linear => "linear",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "binomial" => Some(ReduceAlgorithm::Binomial),
            "in_order_binomial" => Some(ReduceAlgorithm::InOrderBinomial),
            "binary" => Some(ReduceAlgorithm::Binary),
            "pipeline" => Some(ReduceAlgorithm::Pipeline),
            "chain" => Some(ReduceAlgorithm::Chain),
            "linear" => Some(ReduceAlgorithm::Linear),
            _ => None,
        }
    }

    /// Build this rank's view of the tree the algorithm reduces over.
    pub fn build_tree(self, size: u32, rank: Rank, root: Rank) -> Result<Tree> {
        match self {
            ReduceAlgorithm::Binomial => build_binomial_tree(size, rank, root),
            ReduceAlgorithm::InOrderBinomial => build_in_order_binomial_tree(size, rank, root),
            ReduceAlgorithm::Binary => build_kary_tree(2, size, rank, root),
            ReduceAlgorithm::Pipeline => build_chain_tree(1, size, rank, root),
            ReduceAlgorithm::Chain => build_chain_tree(4, size, rank, root),
            ReduceAlgorithm::Linear => {
                if size > 2 {
                    build_kary_tree(size as usize - 1, size, rank, root)
                } else {
                    build_chain_tree(1, size, rank, root)
                }
            }
        }
    }
}

impl std::fmt::Display for ReduceAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One rank's membership in a group of cooperating processes, plus the
/// per-call tag allocator shared by that group's collectives.
#[derive(Debug)]
pub struct ProcessGroup {
    rank: Rank,
    size: u32,
    tags: CallTagAllocator,
}

impl ProcessGroup {
    pub fn new(rank: Rank, size: u32) -> Result<Self> {
        if rank >= size {
            return Err(ArborError::InvalidRank { rank, size });
        }
        Ok(Self {
            rank,
            size,
            tags: CallTagAllocator::new(),
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    fn next_call_tag(&self) -> u32 {
        self.tags.next_tag()
    }
}

/// Start a non-blocking tree reduction of `count` elements toward `root`.
///
/// `sbuf` is this rank's contribution (`count * dtype.size_in_bytes()`
/// bytes). The returned handle completes exactly once; at the root it
/// yields the operator folded over every rank's contribution. The
/// operator must be commutative: contributions are combined in arrival
/// order, not rank order.
#[allow(clippy::too_many_arguments)]
pub fn ireduce(
    group: &ProcessGroup,
    sbuf: Vec<u8>,
    count: usize,
    dtype: DataType,
    op: ReduceOp,
    root: Rank,
    transport: Arc<dyn Transport>,
    params: &TuningParams,
) -> Result<ReduceHandle> {
    let tree = params.algorithm.build_tree(group.size, group.rank, root)?;
    ireduce_with_tree(group, sbuf, count, dtype, op, tree, transport, params)
}

/// Start a non-blocking reduction over a caller-supplied tree.
///
/// All ranks must pass views of the same spanning tree (typically from
/// one of the `topology` builders with identical arguments).
#[allow(clippy::too_many_arguments)]
pub fn ireduce_with_tree(
    group: &ProcessGroup,
    sbuf: Vec<u8>,
    count: usize,
    dtype: DataType,
    op: ReduceOp,
    tree: Tree,
    transport: Arc<dyn Transport>,
    params: &TuningParams,
) -> Result<ReduceHandle> {
    let root = tree.root;
    if root >= group.size {
        return Err(ArborError::InvalidRank {
            rank: root,
            size: group.size,
        });
    }
    let elem_size = dtype.size_in_bytes();
    if sbuf.len() < count * elem_size {
        return Err(ArborError::BufferSizeMismatch {
            expected: count * elem_size,
            actual: sbuf.len(),
        });
    }

    let cell = ResultCell::new();
    let handle = ReduceHandle::new(Arc::clone(&cell));
    let is_root = group.rank == root;

    // Nothing to move: complete before any transfer is issued.
    if count == 0 {
        cell.complete(Ok(is_root.then(Vec::new)));
        return Ok(handle);
    }
    // Single process (or a degenerate tree): the local contribution is
    // the result.
    if tree.is_leaf() && tree.parent.is_none() {
        let mut sbuf = sbuf;
        sbuf.truncate(count * elem_size);
        cell.complete(Ok(is_root.then_some(sbuf)));
        return Ok(handle);
    }

    let seg_count = computed_seg_count(params.segment_size, elem_size, count);
    let seg = Segmentation::new(count, seg_count);
    let call_tag = group.next_call_tag();

    tracing::debug!(
        rank = group.rank,
        root,
        count,
        num_segs = seg.num_segs,
        children = tree.num_children(),
        call_tag,
        "starting ireduce"
    );

    let shared = Arc::new(ReduceShared::new(
        group.rank,
        root,
        tree,
        dtype,
        op,
        seg,
        call_tag,
        params,
        transport,
        sbuf,
        cell,
    ));

    if let Err(e) = ireduce::start(&shared) {
        // Fatal: a transfer was refused. Record it so the in-flight
        // remainder finalizes the handle with the error, and surface it
        // synchronously as well.
        let reason = e.to_string();
        shared.record_error(e);
        return Err(ArborError::ReduceAborted {
            rank: group.rank,
            reason,
        });
    }

    Ok(handle)
}
