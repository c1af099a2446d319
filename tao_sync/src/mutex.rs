//! Process-shared mutex: the first of the four guard primitives.

use crate::time::Deadline;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use tao_common::error::Status;

/// Whether a guard is shared across processes or local to one process.
///
/// Set at initialization and immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedFlag {
    /// Usable only within the initializing process (thread-pool-internal).
    ProcessPrivate,
    /// Usable by any process that maps the segment containing this guard.
    ProcessShared,
}

/// A process-shared (or process-private) mutex in-place in shared memory.
///
/// Placed at a fixed offset inside a segment, identically to how
/// `SegmentHeader` is placed at offset 0 in `segment.rs` — callers obtain a
/// reference by casting a raw pointer into the mapping, never by moving this
/// struct after `init`.
#[repr(C)]
pub struct RawMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    /// Construct an uninitialized mutex. Call [`RawMutex::init`] before use.
    pub const fn new() -> Self {
        RawMutex {
            inner: UnsafeCell::new(unsafe_zeroed_pthread_mutex()),
        }
    }

    /// Initialize the mutex in place.
    pub fn init(&self, shared: SharedFlag) -> Result<(), Status> {
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            if libc::pthread_mutexattr_init(attr.as_mut_ptr()) != 0 {
                return Err(Status::Error);
            }
            let mut attr = attr.assume_init();
            if shared == SharedFlag::ProcessShared {
                libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            }
            let rc = libc::pthread_mutex_init(self.inner.get(), &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            if rc != 0 {
                return Err(Status::Error);
            }
        }
        Ok(())
    }

    /// Destroy the mutex. The caller must not hold the lock.
    pub fn destroy(&self) {
        unsafe {
            libc::pthread_mutex_destroy(self.inner.get());
        }
    }

    /// Block until the lock is acquired.
    pub fn lock(&self) -> Status {
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        if rc == 0 { Status::Ok } else { Status::Error }
    }

    /// Acquire the lock without blocking; `Timeout` on contention.
    pub fn try_lock(&self) -> Status {
        let rc = unsafe { libc::pthread_mutex_trylock(self.inner.get()) };
        match rc {
            0 => Status::Ok,
            libc::EBUSY => Status::Timeout,
            _ => Status::Error,
        }
    }

    /// Acquire the lock with a relative timeout, applying the degrade
    /// rules (beyond `MAX_TIME_SECONDS` blocks, below one tick is `try_lock`).
    pub fn timed_lock(&self, secs: f64) -> Status {
        match Deadline::relative(secs) {
            Deadline::Blocking => self.lock(),
            Deadline::NoWait => self.try_lock(),
            Deadline::Absolute(ts) => self.abstimed_lock(ts),
        }
    }

    /// Acquire the lock by an absolute `CLOCK_REALTIME` deadline.
    pub fn abstimed_lock(&self, deadline: crate::time::Timestamp) -> Status {
        let ts = deadline.to_timespec();
        let rc = unsafe { libc::pthread_mutex_timedlock(self.inner.get(), &ts) };
        match rc {
            0 => Status::Ok,
            libc::ETIMEDOUT => Status::Timeout,
            _ => Status::Error,
        }
    }

    /// Release the lock.
    pub fn unlock(&self) -> Status {
        let rc = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
        if rc == 0 { Status::Ok } else { Status::Error }
    }

    /// Raw pointer to the underlying `pthread_mutex_t`, for use by
    /// [`crate::condvar::RawCondvar::wait`] and friends.
    pub(crate) fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.inner.get()
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

const fn unsafe_zeroed_pthread_mutex() -> libc::pthread_mutex_t {
    // SAFETY: `pthread_mutex_t` is a POD type on every libc target this
    // crate supports; a zeroed value is reinitialized by `init` before use.
    unsafe { std::mem::zeroed() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_cycle() {
        let m = RawMutex::new();
        m.init(SharedFlag::ProcessPrivate).unwrap();
        assert_eq!(m.lock(), Status::Ok);
        assert_eq!(m.unlock(), Status::Ok);
        m.destroy();
    }

    #[test]
    fn try_lock_contends() {
        let m = RawMutex::new();
        m.init(SharedFlag::ProcessPrivate).unwrap();
        assert_eq!(m.lock(), Status::Ok);
        assert_eq!(m.try_lock(), Status::Timeout);
        assert_eq!(m.unlock(), Status::Ok);
        m.destroy();
    }

    #[test]
    fn timed_lock_expires() {
        let m = RawMutex::new();
        m.init(SharedFlag::ProcessPrivate).unwrap();
        assert_eq!(m.lock(), Status::Ok);
        assert_eq!(m.timed_lock(0.05), Status::Timeout);
        assert_eq!(m.unlock(), Status::Ok);
        m.destroy();
    }

    #[test]
    fn process_shared_init() {
        let m = RawMutex::new();
        assert!(m.init(SharedFlag::ProcessShared).is_ok());
        m.destroy();
    }
}
