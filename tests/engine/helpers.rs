//! In-process simulated messaging substrate.
//!
//! `SimNet` matches tagged sends and receives between ranks, queues the
//! paired completions, and delivers them in a controllable order: FIFO,
//! LIFO, or a seeded shuffle. That lets the order-independence tests run
//! the same reduction under many interleavings of the completion engine.
//! The net also instruments outstanding-transfer counts per edge so tests
//! can assert the engine's pipeline bounds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arbor::{
    ArborError, DataType, ProcessGroup, Rank, RecvCompletion, ReduceOp, Result, SegBuf,
    SendCompletion, Transport, TuningParams, WireTag, apply_op, ireduce,
};

/// Delivery order for queued completions.
#[derive(Debug, Clone, Copy)]
pub enum Order {
    Fifo,
    Lifo,
    Seeded(u64),
}

struct PendingSend {
    buf: SegBuf,
    len: usize,
    cb: SendCompletion,
}

struct PendingRecv {
    buf: SegBuf,
    len: usize,
    cb: RecvCompletion,
}

enum Delivery {
    Send { cb: SendCompletion, buf: SegBuf },
    Recv { cb: RecvCompletion, buf: SegBuf },
}

struct Completion {
    src: Rank,
    dst: Rank,
    delivery: Delivery,
}

#[derive(Default)]
struct NetState {
    sends: HashMap<(Rank, Rank, WireTag), PendingSend>,
    recvs: HashMap<(Rank, Rank, WireTag), PendingRecv>,
    ready: Vec<Completion>,
    in_flight: usize,
    refuse: bool,
    posted: usize,
    outstanding_recv: HashMap<(Rank, Rank), usize>,
    peak_recv: HashMap<(Rank, Rank), usize>,
    outstanding_send: HashMap<Rank, usize>,
    peak_send: HashMap<Rank, usize>,
}

/// A simulated network shared by every rank's transport endpoint.
#[derive(Default)]
pub struct SimNet {
    state: Mutex<NetState>,
}

impl SimNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Endpoint for one rank.
    pub fn endpoint(self: &Arc<Self>, rank: Rank) -> Arc<dyn Transport> {
        Arc::new(SimTransport {
            net: Arc::clone(self),
            rank,
        })
    }

    /// Make every subsequent post fail, as a substrate refusing transfers.
    pub fn refuse_new_transfers(&self) {
        self.state.lock().unwrap().refuse = true;
    }

    /// Total transfers posted so far.
    pub fn posted_transfers(&self) -> usize {
        self.state.lock().unwrap().posted
    }

    /// Peak outstanding receives over any (receiver, sender) edge.
    pub fn peak_recv_per_edge(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.peak_recv.values().copied().max().unwrap_or(0)
    }

    /// Peak outstanding sends for any single rank.
    pub fn peak_send_per_rank(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.peak_send.values().copied().max().unwrap_or(0)
    }

    /// Deliver queued completions in `order` until quiescent.
    ///
    /// Callbacks run outside the net lock, so they can post follow-up
    /// transfers, which are matched and queued like any others.
    pub fn pump(&self, order: Order) {
        let mut rng = Xorshift::new(match order {
            Order::Seeded(seed) => seed,
            _ => 1,
        });
        loop {
            let completion = {
                let mut st = self.state.lock().unwrap();
                if st.ready.is_empty() {
                    if st.in_flight == 0 {
                        break;
                    }
                    drop(st);
                    std::thread::yield_now();
                    continue;
                }
                let idx = match order {
                    Order::Fifo => 0,
                    Order::Lifo => st.ready.len() - 1,
                    Order::Seeded(_) => (rng.next() as usize) % st.ready.len(),
                };
                let c = st.ready.remove(idx);
                match &c.delivery {
                    Delivery::Recv { .. } => {
                        *st.outstanding_recv.entry((c.dst, c.src)).or_default() -= 1;
                    }
                    Delivery::Send { .. } => {
                        *st.outstanding_send.entry(c.src).or_default() -= 1;
                    }
                }
                st.in_flight += 1;
                c
            };
            match completion.delivery {
                Delivery::Send { cb, buf } => cb(Ok(buf)),
                Delivery::Recv { cb, buf } => cb(Ok(buf)),
            }
            self.state.lock().unwrap().in_flight -= 1;
        }
    }

    /// Deliver completions from several threads concurrently, exercising
    /// the engine's locking under real parallelism.
    pub fn pump_concurrently(self: &Arc<Self>, threads: usize) {
        let mut handles = Vec::new();
        for t in 0..threads {
            let net = Arc::clone(self);
            handles.push(std::thread::spawn(move || {
                net.pump(Order::Seeded(0x9E3779B9 + t as u64));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    /// Assert no unmatched transfer is left behind.
    pub fn assert_quiescent(&self) {
        let st = self.state.lock().unwrap();
        assert!(st.sends.is_empty(), "unmatched sends left in the net");
        assert!(st.recvs.is_empty(), "unmatched receives left in the net");
        assert!(st.ready.is_empty());
    }
}

struct SimTransport {
    net: Arc<SimNet>,
    rank: Rank,
}

impl Transport for SimTransport {
    fn isend(
        &self,
        buf: SegBuf,
        len: usize,
        peer: Rank,
        tag: WireTag,
        on_complete: SendCompletion,
    ) -> Result<()> {
        let mut st = self.net.state.lock().unwrap();
        if st.refuse {
            return Err(ArborError::transfer("send", peer, "substrate refused"));
        }
        st.posted += 1;
        let outstanding = st.outstanding_send.entry(self.rank).or_default();
        *outstanding += 1;
        let outstanding = *outstanding;
        let peak = st.peak_send.entry(self.rank).or_default();
        *peak = (*peak).max(outstanding);

        let key = (self.rank, peer, tag);
        if let Some(mut pending) = st.recvs.remove(&key) {
            assert_eq!(pending.len, len, "send/recv length mismatch on tag {tag}");
            pending.buf.bytes_mut()[..len].copy_from_slice(&buf.bytes()[..len]);
            st.ready.push(Completion {
                src: self.rank,
                dst: peer,
                delivery: Delivery::Recv {
                    cb: pending.cb,
                    buf: pending.buf,
                },
            });
            st.ready.push(Completion {
                src: self.rank,
                dst: peer,
                delivery: Delivery::Send {
                    cb: on_complete,
                    buf,
                },
            });
        } else {
            let prev = st.sends.insert(
                key,
                PendingSend {
                    buf,
                    len,
                    cb: on_complete,
                },
            );
            assert!(prev.is_none(), "duplicate send tag {tag}");
        }
        Ok(())
    }

    fn irecv(
        &self,
        buf: SegBuf,
        len: usize,
        peer: Rank,
        tag: WireTag,
        on_complete: RecvCompletion,
    ) -> Result<()> {
        let mut st = self.net.state.lock().unwrap();
        if st.refuse {
            return Err(ArborError::transfer("recv", peer, "substrate refused"));
        }
        st.posted += 1;
        let outstanding = st.outstanding_recv.entry((self.rank, peer)).or_default();
        *outstanding += 1;
        let outstanding = *outstanding;
        let peak = st.peak_recv.entry((self.rank, peer)).or_default();
        *peak = (*peak).max(outstanding);

        let key = (peer, self.rank, tag);
        if let Some(pending) = st.sends.remove(&key) {
            assert_eq!(pending.len, len, "send/recv length mismatch on tag {tag}");
            let mut buf = buf;
            buf.bytes_mut()[..len].copy_from_slice(&pending.buf.bytes()[..len]);
            st.ready.push(Completion {
                src: peer,
                dst: self.rank,
                delivery: Delivery::Recv {
                    cb: on_complete,
                    buf,
                },
            });
            st.ready.push(Completion {
                src: peer,
                dst: self.rank,
                delivery: Delivery::Send {
                    cb: pending.cb,
                    buf: pending.buf,
                },
            });
        } else {
            let prev = st.recvs.insert(
                key,
                PendingRecv {
                    buf,
                    len,
                    cb: on_complete,
                },
            );
            assert!(prev.is_none(), "duplicate recv tag {tag}");
        }
        Ok(())
    }
}

/// Deterministic xorshift generator for shuffled delivery orders.
struct Xorshift(u64);

impl Xorshift {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

/// Deterministic per-rank contribution: small positive values so integer
/// sums stay exact in every tested dtype.
pub fn pattern(rank: Rank, count: usize, dtype: DataType) -> Vec<u8> {
    let elem = dtype.size_in_bytes();
    let mut buf = vec![0u8; count * elem];
    for i in 0..count {
        let v = ((rank as usize * 31 + i * 7) % 23 + 1) as u64;
        let bytes = &mut buf[i * elem..(i + 1) * elem];
        match dtype {
            DataType::F32 => bytes.copy_from_slice(&(v as f32).to_le_bytes()),
            DataType::F64 => bytes.copy_from_slice(&(v as f64).to_le_bytes()),
            DataType::I32 => bytes.copy_from_slice(&(v as i32).to_le_bytes()),
            DataType::I64 => bytes.copy_from_slice(&(v as i64).to_le_bytes()),
            DataType::U32 => bytes.copy_from_slice(&(v as u32).to_le_bytes()),
            DataType::U64 => bytes.copy_from_slice(&v.to_le_bytes()),
            DataType::I8 => bytes.copy_from_slice(&(v as i8).to_le_bytes()),
            DataType::U8 => bytes.copy_from_slice(&(v as u8).to_le_bytes()),
            DataType::F16 | DataType::BF16 => unimplemented!("not exercised"),
        }
    }
    buf
}

/// The operator folded over every rank's contribution, computed locally.
pub fn expected(world: u32, count: usize, dtype: DataType, op: ReduceOp) -> Vec<u8> {
    let mut acc = pattern(0, count, dtype);
    for rank in 1..world {
        let src = pattern(rank, count, dtype);
        apply_op(op, &src, &mut acc, count, dtype).unwrap();
    }
    acc
}

/// Run a full reduction across `world` simulated ranks and return the
/// root's result. Non-root handles are asserted to complete empty.
pub fn run_reduce(
    world: u32,
    root: Rank,
    count: usize,
    dtype: DataType,
    op: ReduceOp,
    params: &TuningParams,
    order: Order,
) -> Vec<u8> {
    let net = SimNet::new();
    let mut handles = Vec::new();
    for rank in 0..world {
        let group = ProcessGroup::new(rank, world).unwrap();
        let sbuf = pattern(rank, count, dtype);
        let handle = ireduce(
            &group,
            sbuf,
            count,
            dtype,
            op,
            root,
            net.endpoint(rank),
            params,
        )
        .unwrap();
        handles.push((rank, handle));
    }

    net.pump(order);
    net.assert_quiescent();

    let mut result = None;
    for (rank, handle) in handles {
        assert!(handle.is_finished(), "rank {rank} did not finalize");
        let out = handle.wait().unwrap();
        if rank == root {
            result = out;
        } else {
            assert!(out.is_none(), "non-root rank {rank} produced a result");
        }
    }
    result.expect("root produced no result")
}
