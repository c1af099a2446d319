//! Process-shared condition variable, layered on [`crate::mutex::RawMutex`].

use crate::mutex::{RawMutex, SharedFlag};
use crate::time::{Deadline, Timestamp};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use tao_common::error::Status;

/// A condition variable usable in-place inside a shared segment.
///
/// Always paired with the [`RawMutex`] whose `lock` is held across `wait`
/// calls, mirroring pthreads' own contract.
#[repr(C)]
pub struct RawCondvar {
    inner: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for RawCondvar {}
unsafe impl Sync for RawCondvar {}

impl RawCondvar {
    /// Construct an uninitialized condvar. Call [`RawCondvar::init`] before use.
    pub const fn new() -> Self {
        RawCondvar {
            inner: UnsafeCell::new(unsafe_zeroed_pthread_cond()),
        }
    }

    /// Initialize the condvar in place, on `CLOCK_REALTIME`.
    pub fn init(&self, shared: SharedFlag) -> Result<(), Status> {
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
            if libc::pthread_condattr_init(attr.as_mut_ptr()) != 0 {
                return Err(Status::Error);
            }
            let mut attr = attr.assume_init();
            if shared == SharedFlag::ProcessShared {
                libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            }
            libc::pthread_condattr_setclock(&mut attr, libc::CLOCK_REALTIME);
            let rc = libc::pthread_cond_init(self.inner.get(), &attr);
            libc::pthread_condattr_destroy(&mut attr);
            if rc != 0 {
                return Err(Status::Error);
            }
        }
        Ok(())
    }

    /// Destroy the condvar. No thread may be waiting on it.
    pub fn destroy(&self) {
        unsafe {
            libc::pthread_cond_destroy(self.inner.get());
        }
    }

    /// Wake one waiter.
    pub fn signal(&self) -> Status {
        let rc = unsafe { libc::pthread_cond_signal(self.inner.get()) };
        if rc == 0 { Status::Ok } else { Status::Error }
    }

    /// Wake every waiter.
    pub fn broadcast(&self) -> Status {
        let rc = unsafe { libc::pthread_cond_broadcast(self.inner.get()) };
        if rc == 0 { Status::Ok } else { Status::Error }
    }

    /// Wait indefinitely, atomically releasing `mutex` and reacquiring it
    /// before returning. `mutex` must already be held by the caller.
    pub fn wait(&self, mutex: &RawMutex) -> Status {
        let rc = unsafe { libc::pthread_cond_wait(self.inner.get(), mutex.raw()) };
        if rc == 0 { Status::Ok } else { Status::Error }
    }

    /// Wait with a relative timeout, applying the degrade rules.
    pub fn timed_wait(&self, mutex: &RawMutex, secs: f64) -> Status {
        match Deadline::relative(secs) {
            Deadline::Blocking => self.wait(mutex),
            Deadline::NoWait => Status::Timeout,
            Deadline::Absolute(ts) => self.abstimed_wait(mutex, ts),
        }
    }

    /// Wait until an absolute `CLOCK_REALTIME` deadline.
    pub fn abstimed_wait(&self, mutex: &RawMutex, deadline: Timestamp) -> Status {
        let ts = deadline.to_timespec();
        let rc = unsafe { libc::pthread_cond_timedwait(self.inner.get(), mutex.raw(), &ts) };
        match rc {
            0 => Status::Ok,
            libc::ETIMEDOUT => Status::Timeout,
            _ => Status::Error,
        }
    }
}

impl Default for RawCondvar {
    fn default() -> Self {
        Self::new()
    }
}

const fn unsafe_zeroed_pthread_cond() -> libc::pthread_cond_t {
    // SAFETY: zeroed `pthread_cond_t` is reinitialized by `init` before use.
    unsafe { std::mem::zeroed() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn signal_wakes_waiter() {
        let mutex = Arc::new(RawMutex::new());
        mutex.init(SharedFlag::ProcessPrivate).unwrap();
        let cond = Arc::new(RawCondvar::new());
        cond.init(SharedFlag::ProcessPrivate).unwrap();

        let m2 = Arc::clone(&mutex);
        let c2 = Arc::clone(&cond);
        let handle = thread::spawn(move || {
            m2.lock();
            let status = c2.wait(&m2);
            m2.unlock();
            status
        });

        thread::sleep(Duration::from_millis(50));
        mutex.lock();
        cond.signal();
        mutex.unlock();

        assert_eq!(handle.join().unwrap(), Status::Ok);
    }

    #[test]
    fn timed_wait_expires_without_signal() {
        let mutex = RawMutex::new();
        mutex.init(SharedFlag::ProcessPrivate).unwrap();
        let cond = RawCondvar::new();
        cond.init(SharedFlag::ProcessPrivate).unwrap();

        mutex.lock();
        let status = cond.timed_wait(&mutex, 0.05);
        mutex.unlock();
        assert_eq!(status, Status::Timeout);
    }
}
