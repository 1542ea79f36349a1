//! arbor: a segmented, pipelined, tree-topology collective-reduction
//! engine.
//!
//! Given a group of cooperating processes, a per-process contribution
//! buffer, and a commutative combining operator, arbor computes the
//! combined result at a distinguished root, overlapping computation with
//! communication and bounding in-flight buffer usage. The engine owns no
//! threads: it posts asynchronous transfers through a caller-provided
//! [`Transport`] and reacts to completion callbacks.

pub mod collective;
pub mod config;
pub mod error;
pub mod pool;
pub mod reduce;
pub mod segment;
pub mod topology;
pub mod transport;
pub mod types;

pub use collective::{ProcessGroup, ReduceAlgorithm, ReduceHandle, ireduce, ireduce_with_tree};
pub use config::TuningParams;
pub use error::{ArborError, Result};
pub use pool::{FreeList, Lease};
pub use reduce::apply_op;
pub use segment::{Segmentation, computed_seg_count};
pub use topology::{
    MAX_TREE_FANOUT, Tree, build_binomial_tree, build_chain_tree, build_in_order_binary_tree,
    build_in_order_binomial_tree, build_kary_tree, build_two_binary_trees,
    build_two_binomial_trees,
};
pub use transport::{
    CallTagAllocator, RecvCompletion, SegBuf, SendCompletion, Transport, WireTag, pack_tag,
};
pub use types::{DataType, NodeId, Rank, ReduceOp};
