//! Completion tracking for asynchronous fabric operations.
//!
//! Submission hands back either an immediately-completed marker or a live
//! request handle whose status is written by the progress engine. Waiting
//! consumes the handle, so release happens exactly once by construction.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Status of a submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus {
    /// Still owned by the fabric; not yet terminal.
    InProgress,
    /// Completed successfully.
    Success,
    /// The remote side faulted the operation (bad key, out-of-range access).
    RemoteFault,
    /// The channel carrying the operation was lost before completion.
    Disconnected,
}

impl OpStatus {
    /// Raw byte representation, used for atomic storage.
    pub fn as_u8(self) -> u8 {
        match self {
            OpStatus::InProgress => 0,
            OpStatus::Success => 1,
            OpStatus::RemoteFault => 2,
            OpStatus::Disconnected => 3,
        }
    }

    /// Decodes the raw byte representation; unknown values read as in-progress.
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => OpStatus::Success,
            2 => OpStatus::RemoteFault,
            3 => OpStatus::Disconnected,
            _ => OpStatus::InProgress,
        }
    }

    /// True once the operation left the in-progress state.
    pub fn is_terminal(self) -> bool {
        self != OpStatus::InProgress
    }
}

/// Shared completion slot written by the progress engine.
#[derive(Debug)]
pub struct RequestState {
    status: AtomicU8,
}

impl RequestState {
    pub(crate) fn new() -> Self {
        Self {
            status: AtomicU8::new(OpStatus::InProgress.as_u8()),
        }
    }

    /// Records a terminal status. The first terminal write wins; later
    /// writes (a disconnect racing a completion) are ignored.
    pub(crate) fn finish(&self, status: OpStatus) {
        let _ = self.status.compare_exchange(
            OpStatus::InProgress.as_u8(),
            status.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Current status.
    pub fn get(&self) -> OpStatus {
        OpStatus::from_u8(self.status.load(Ordering::Acquire))
    }
}

/// Handle to an operation still owned by the fabric.
#[derive(Debug)]
pub struct Request {
    state: Arc<RequestState>,
}

impl Request {
    pub(crate) fn new(state: Arc<RequestState>) -> Self {
        Self { state }
    }

    /// Polls the current status without driving progress.
    pub fn status(&self) -> OpStatus {
        self.state.get()
    }
}

/// Outcome of submitting an operation that did not fail outright.
#[derive(Debug)]
pub enum Submitted {
    /// The operation finished during submission; no live request exists.
    Completed,
    /// The operation is in flight and must be driven to completion.
    Pending(Request),
}

impl Submitted {
    /// True if the operation finished at submission time.
    pub fn is_completed(&self) -> bool {
        matches!(self, Submitted::Completed)
    }
}
