use crate::abi::PyObject;
use pybridge_vm::{ObjectId, PyException};

/// Everything that can go wrong inside the bridge.
///
/// Only [`Exception`](Self::Exception) is an ordinary, recoverable failure: a
/// managed exception on its way to or from native code. Every other variant
/// is a broken bridge invariant and ends the process through
/// [`fatal_error`] as soon as it reaches a call boundary.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Exception(#[from] PyException),
    #[error("native object {native:p} is already linked (refcount {refcnt})")]
    AlreadyLinked { native: *mut PyObject, refcnt: isize },
    #[error("managed object {managed} is already linked to {existing:p}")]
    ManagedAlreadyLinked {
        managed: ObjectId,
        existing: *mut PyObject,
    },
    #[error("refcount of {0:p} dropped below zero")]
    RefcountUnderflow(*mut PyObject),
    #[error("incref of {0:p}, which has refcount 0")]
    IncrefOfDead(*mut PyObject),
    #[error("type '{0}' is already being readied")]
    ReentrantReady(String),
    #[error("{0:p} is an unlinked object whose type is itself")]
    InvalidPointer(*mut PyObject),
    #[error("type '{name}' has basicsize {size}, smaller than its base's {base_size}")]
    LayoutConflict {
        name: String,
        size: isize,
        base_size: isize,
    },
    #[error("unexpected NULL object pointer")]
    NullPointer,
    #[error("managed object {0} is not alive")]
    DeadObject(ObjectId),
    #[error("managed object {0} is not a type")]
    NotAType(ObjectId),
    #[error("cannot allocate {0} bytes")]
    NoMemory(usize),
    #[error("the global lock was released by a thread that does not hold it")]
    LockNotHeld,
    #[error("no bridge is active on this thread")]
    NoBridge,
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Exception(_))
    }
}

/// Reports a broken bridge invariant and aborts.
///
/// The tracing collector and native code share object graphs that no longer
/// agree once an invariant is violated; there is no state to unwind to.
#[cold]
pub fn fatal_error(err: &BridgeError) -> ! {
    error!("Fatal error in the native object bridge: {err}");
    std::process::abort()
}

pub trait OrFatal<T> {
    /// Unwraps, aborting the process on any error.
    fn or_fatal(self) -> T;
}

impl<T> OrFatal<T> for BridgeResult<T> {
    #[track_caller]
    fn or_fatal(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => fatal_error(&err),
        }
    }
}
