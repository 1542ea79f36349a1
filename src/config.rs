//! Runtime-configurable tuning parameters for arbor.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `ARBOR_`) or by constructing a custom `TuningParams`. The
//! parameters are a plain value struct passed into the engine at call time;
//! there is no process-wide mutable configuration.

use crate::collective::ReduceAlgorithm;

/// Tuning parameters for the segmented reduction engine.
#[derive(Debug, Clone)]
pub struct TuningParams {
    /// Which tree shape the reduction runs over.
    pub algorithm: ReduceAlgorithm,

    /// Segment size in bytes used for segmenting the message.
    /// 0 bytes means no segmentation (the whole message is one segment).
    pub segment_size: usize,

    /// Maximum number of outstanding send requests per node.
    pub max_send_requests: usize,

    /// Maximum number of outstanding receive requests per child.
    pub max_recv_requests: usize,

    /// Minimum number of staging buffers pre-allocated per call.
    pub inbuf_pool_min: usize,

    /// Maximum number of staging buffers a call's pool may grow to.
    pub inbuf_pool_max: usize,

    /// Number of staging buffers added on each pool growth step.
    pub inbuf_pool_inc: usize,

    /// Minimum number of transfer context records pre-allocated per call.
    pub context_pool_min: usize,

    /// Maximum number of transfer context records a call's pool may grow to.
    pub context_pool_max: usize,

    /// Number of context records added on each pool growth step.
    pub context_pool_inc: usize,
}

impl Default for TuningParams {
    fn default() -> Self {
        Self {
            algorithm: ReduceAlgorithm::Binomial,
            segment_size: 163740,
            max_send_requests: 2,
            max_recv_requests: 3,
            inbuf_pool_min: 10,
            inbuf_pool_max: 10000,
            inbuf_pool_inc: 10,
            context_pool_min: 10,
            context_pool_max: 10000,
            context_pool_inc: 10,
        }
    }
}

impl TuningParams {
    /// Load parameters from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `ARBOR_REDUCE_ALGORITHM` (binomial | in_order_binomial | binary |
    ///   pipeline | chain | linear)
    /// - `ARBOR_REDUCE_SEGMENT_SIZE`
    /// - `ARBOR_REDUCE_MAX_SEND_REQUESTS`
    /// - `ARBOR_REDUCE_MAX_RECV_REQUESTS`
    /// - `ARBOR_INBUF_POOL_MIN` / `ARBOR_INBUF_POOL_MAX` / `ARBOR_INBUF_POOL_INC`
    /// - `ARBOR_CONTEXT_POOL_MIN` / `ARBOR_CONTEXT_POOL_MAX` / `ARBOR_CONTEXT_POOL_INC`
    pub fn from_env() -> Self {
        let mut params = Self::default();

        if let Ok(v) = std::env::var("ARBOR_REDUCE_ALGORITHM") {
            if let Some(alg) = ReduceAlgorithm::from_name(&v) {
                params.algorithm = alg;
            }
        }
        if let Ok(v) = std::env::var("ARBOR_REDUCE_SEGMENT_SIZE") {
            if let Ok(n) = v.parse::<usize>() {
                params.segment_size = n;
            }
        }
        if let Ok(v) = std::env::var("ARBOR_REDUCE_MAX_SEND_REQUESTS") {
            if let Ok(n) = v.parse::<usize>() {
                params.max_send_requests = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("ARBOR_REDUCE_MAX_RECV_REQUESTS") {
            if let Ok(n) = v.parse::<usize>() {
                params.max_recv_requests = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("ARBOR_INBUF_POOL_MIN") {
            if let Ok(n) = v.parse::<usize>() {
                params.inbuf_pool_min = n;
            }
        }
        if let Ok(v) = std::env::var("ARBOR_INBUF_POOL_MAX") {
            if let Ok(n) = v.parse::<usize>() {
                params.inbuf_pool_max = n;
            }
        }
        if let Ok(v) = std::env::var("ARBOR_INBUF_POOL_INC") {
            if let Ok(n) = v.parse::<usize>() {
                params.inbuf_pool_inc = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("ARBOR_CONTEXT_POOL_MIN") {
            if let Ok(n) = v.parse::<usize>() {
                params.context_pool_min = n;
            }
        }
        if let Ok(v) = std::env::var("ARBOR_CONTEXT_POOL_MAX") {
            if let Ok(n) = v.parse::<usize>() {
                params.context_pool_max = n;
            }
        }
        if let Ok(v) = std::env::var("ARBOR_CONTEXT_POOL_INC") {
            if let Ok(n) = v.parse::<usize>() {
                params.context_pool_inc = n.max(1);
            }
        }

        params
    }
}
