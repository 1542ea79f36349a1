use crate::error::Result;
use std::sync::{Arc, Condvar, Mutex};

/// A handle to one in-flight collective reduction.
///
/// The call completes asynchronously as the messaging substrate delivers
/// transfer completions. Call `wait()` to block until it finishes, or
/// `is_finished()` to poll. At the root, a successful wait yields the
/// fully reduced buffer; elsewhere it yields `None`.
pub struct ReduceHandle {
    cell: Arc<ResultCell>,
}

impl std::fmt::Debug for ReduceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReduceHandle")
            .field("is_finished", &self.is_finished())
            .finish()
    }
}

impl ReduceHandle {
    pub(crate) fn new(cell: Arc<ResultCell>) -> Self {
        Self { cell }
    }

    /// Block until the reduction completes and return its outcome.
    pub fn wait(self) -> Result<Option<Vec<u8>>> {
        self.cell.wait()
    }

    /// Check whether the reduction has finished (non-blocking).
    pub fn is_finished(&self) -> bool {
        self.cell.is_finished()
    }
}

/// Completion cell shared between the handle and the reduction state.
///
/// Completed exactly once, by whichever completion path drops the last
/// reference to the shared reduction state. The completion counter backs
/// the exactly-once invariant: a second completion is a protocol bug and
/// panics outright.
pub(crate) struct ResultCell {
    state: Mutex<CellState>,
    done: Condvar,
}

struct CellState {
    outcome: Option<Result<Option<Vec<u8>>>>,
    completions: u32,
}

impl ResultCell {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CellState {
                outcome: None,
                completions: 0,
            }),
            done: Condvar::new(),
        })
    }

    pub(crate) fn complete(&self, outcome: Result<Option<Vec<u8>>>) {
        let mut state = self.state.lock().expect("result cell lock poisoned");
        state.completions += 1;
        assert_eq!(
            state.completions, 1,
            "reduction result completed more than once"
        );
        state.outcome = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock().expect("result cell lock poisoned");
        while state.outcome.is_none() {
            state = self.done.wait(state).expect("result cell lock poisoned");
        }
        state.outcome.take().expect("outcome present after wait")
    }

    fn is_finished(&self) -> bool {
        self.state
            .lock()
            .expect("result cell lock poisoned")
            .outcome
            .is_some()
    }
}
