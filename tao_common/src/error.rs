//! Error kinds and the thread-local last-error record.
//!
//! Every fallible operation returns one of `{OK, ERROR, TIMEOUT}` while
//! recording a richer error *kind* out of band. [`Status`] is that
//! tri-state result code; [`TaoError`] is the richer kind recorded in the
//! thread-local last-error slot.

use std::cell::RefCell;
use thiserror::Error;

/// Tri-state result code every guard/queue operation returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The operation completed successfully.
    Ok,
    /// The operation failed; see [`last_error`] for detail.
    Error,
    /// The operation's deadline elapsed with no side effects.
    Timeout,
}

/// Error kinds a conformant implementation must distinguish.
#[derive(Error, Debug, Clone)]
pub enum TaoError {
    /// A function argument was out of its accepted domain.
    #[error("bad argument: {0}")]
    BadArgument(String),
    /// A pointer or offset did not address valid memory.
    #[error("bad address")]
    BadAddress,
    /// A requested size was invalid (too small, too large, misaligned).
    #[error("bad size: {size} bytes")]
    BadSize {
        /// Offending size in bytes.
        size: usize,
    },
    /// A value fell outside its legal numeric range.
    #[error("bad range")]
    BadRange,
    /// A type tag did not match the expected family.
    #[error("bad type: expected family descending from {expected:#x}, got {actual:#x}")]
    BadType {
        /// Expected ancestor family byte.
        expected: u8,
        /// Actual family byte found in the header.
        actual: u8,
    },
    /// A name (segment, owner, attribute key) was invalid.
    #[error("bad name: {0}")]
    BadName(String),
    /// A header's magic did not carry the TAO magic in its upper bits.
    #[error("bad magic: {0:#x}")]
    BadMagic(u32),
    /// An array had an illegal rank (outside `0..=5`).
    #[error("bad rank: {0}")]
    BadRank(usize),
    /// A pixel/sensor encoding tag was not recognized.
    #[error("bad encoding: {0:#x}")]
    BadEncoding(u32),
    /// An array element type tag was not recognized.
    #[error("bad pixel type: {0}")]
    BadPixelType(i32),
    /// A ring/command serial was stale or out of the valid window.
    #[error("bad serial: {0}")]
    BadSerial(i64),
    /// The requested resource is already attached/locked by this caller.
    #[error("already in use")]
    AlreadyInUse,
    /// `create` was called for a name/segment that already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// `attach`/`find` could not locate the requested resource.
    #[error("not found: {0}")]
    NotFound(String),
    /// An `unlock` was attempted without holding the guard.
    #[error("not locked")]
    NotLocked,
    /// An operation requires a state the object has not yet reached.
    #[error("not ready")]
    NotReady,
    /// An operation requires the server to be running.
    #[error("not running")]
    NotRunning,
    /// An acquisition command was issued while none is in progress.
    #[error("not acquiring")]
    NotAcquiring,
    /// An acquisition command was issued while one is already running.
    #[error("acquisition running")]
    AcquisitionRunning,
    /// The object has been destroyed and must not be used further.
    #[error("destroyed")]
    Destroyed,
    /// A ring slot was reused before the caller could read it.
    #[error("overwritten")]
    Overwritten,
    /// The output cycle is broken (e.g. `nbufs` misconfigured).
    #[error("broken cycle")]
    BrokenCycle,
    /// An invariant-protected counter held an illegal value.
    #[error("corrupted")]
    Corrupted,
    /// A fixed-size resource (attribute table, trailing array) is full.
    #[error("exhausted")]
    Exhausted,
    /// A `configure` command touched a read-only attribute or invalid ROI.
    #[error("forbidden change: {0}")]
    ForbiddenChange(String),
    /// A numeric conversion would lose precision.
    #[error("inexact conversion")]
    InexactConversion,
    /// The object is in `error` state and requires `reset` before use.
    #[error("must reset")]
    MustReset,
    /// The owning process appears to be gone.
    #[error("unreachable")]
    Unreachable,
    /// A deadline elapsed before the operation could complete.
    #[error("timeout: {0}")]
    Timeout(String),
    /// The requested operation is not supported on this platform/build.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// A guard was left in an unrecoverable state (e.g. crashed holder, no
    /// robust-mutex support).
    #[error("unrecoverable")]
    Unrecoverable,
    /// An internal invariant check failed.
    #[error("assertion failed: {0}")]
    AssertionFailed(String),
    /// Wraps a `std::io::Error` (segment files, metadata).
    #[error("io error: {0}")]
    Io(String),
    /// Wraps an errno surfaced by a libc/nix call.
    #[error("system call error: {0}")]
    System(String),
}

impl From<std::io::Error> for TaoError {
    fn from(e: std::io::Error) -> Self {
        TaoError::Io(e.to_string())
    }
}

impl From<nix::Error> for TaoError {
    fn from(e: nix::Error) -> Self {
        TaoError::System(e.to_string())
    }
}

/// Result type used throughout the TAO workspace.
pub type TaoResult<T> = Result<T, TaoError>;

thread_local! {
    static LAST_ERROR: RefCell<Option<ErrorRecord>> = const { RefCell::new(None) };
}

/// A thread-local record of the most recent failure: the function name that
/// raised it, the kind, and (if the failure originated in a foreign call) the
/// raw errno.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    /// Name of the function that recorded the error.
    pub function: &'static str,
    /// The error kind.
    pub kind: TaoError,
    /// Raw errno, if the failure came from a foreign (libc/nix) call.
    pub errno: Option<i32>,
}

/// Record an error in the calling thread's last-error slot.
///
/// Getters that take `&self` must never call this.
pub fn set_last_error(function: &'static str, kind: TaoError, errno: Option<i32>) {
    LAST_ERROR.with(|cell| {
        *cell.borrow_mut() = Some(ErrorRecord {
            function,
            kind,
            errno,
        });
    });
}

/// Fetch a clone of the calling thread's last-error record, if any.
pub fn last_error() -> Option<ErrorRecord> {
    LAST_ERROR.with(|cell| cell.borrow().clone())
}

/// Clear the calling thread's last-error record.
pub fn clear_last_error() {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = None);
}

/// Global, replaceable error hook.
///
/// Invoked after every [`set_last_error`] call, in addition to the
/// thread-local record. Intended for integration with an external logging
/// sink; TAO itself only ever calls [`set_last_error`].
type ErrorHook = dyn Fn(&ErrorRecord) + Send + Sync;

static ERROR_HOOK: std::sync::OnceLock<std::sync::RwLock<Option<Box<ErrorHook>>>> =
    std::sync::OnceLock::new();

/// Install a global error hook, replacing any previous one.
pub fn set_error_hook<F>(hook: F)
where
    F: Fn(&ErrorRecord) + Send + Sync + 'static,
{
    let lock = ERROR_HOOK.get_or_init(|| std::sync::RwLock::new(None));
    *lock.write().unwrap() = Some(Box::new(hook));
}

/// Record an error and invoke the global hook, if any.
pub fn report_error(function: &'static str, kind: TaoError, errno: Option<i32>) {
    let record = ErrorRecord {
        function,
        kind,
        errno,
    };
    LAST_ERROR.with(|cell| *cell.borrow_mut() = Some(record.clone()));
    if let Some(lock) = ERROR_HOOK.get() {
        if let Some(hook) = lock.read().unwrap().as_ref() {
            hook(&record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_error_round_trip() {
        clear_last_error();
        assert!(last_error().is_none());
        set_last_error("attach", TaoError::NotFound("seg".into()), None);
        let rec = last_error().unwrap();
        assert_eq!(rec.function, "attach");
        matches!(rec.kind, TaoError::NotFound(_));
    }

    #[test]
    fn hook_is_invoked() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static COUNT: AtomicUsize = AtomicUsize::new(0);
        set_error_hook(|_rec| {
            COUNT.fetch_add(1, Ordering::SeqCst);
        });
        report_error("detach", TaoError::Destroyed, None);
        assert!(COUNT.load(Ordering::SeqCst) >= 1);
    }
}
