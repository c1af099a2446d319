//! POSIX unnamed semaphore wrapper, process-shared or process-private.

use crate::time::Deadline;
use std::cell::UnsafeCell;
use std::ffi::CString;
use tao_common::error::{Status, TaoError, TaoResult};

/// An unnamed semaphore placed in-place inside a shared segment.
#[repr(C)]
pub struct RawSemaphore {
    inner: UnsafeCell<libc::sem_t>,
}

unsafe impl Send for RawSemaphore {}
unsafe impl Sync for RawSemaphore {}

impl RawSemaphore {
    /// Construct an uninitialized semaphore. Call [`RawSemaphore::init`] first.
    pub const fn new() -> Self {
        RawSemaphore {
            inner: UnsafeCell::new(unsafe_zeroed_sem()),
        }
    }

    /// Initialize with the given starting value.
    ///
    /// `shared` selects `pshared` (`1` for process-shared, `0` otherwise),
    /// matching `sem_init(3)`'s own convention.
    pub fn init(&self, shared: bool, value: u32) -> Result<(), Status> {
        let rc = unsafe {
            libc::sem_init(self.inner.get(), if shared { 1 } else { 0 }, value)
        };
        if rc == 0 { Ok(()) } else { Err(Status::Error) }
    }

    /// Destroy the semaphore. No thread may be blocked on it.
    pub fn destroy(&self) {
        unsafe {
            libc::sem_destroy(self.inner.get());
        }
    }

    /// Increment the semaphore, waking one blocked waiter if any.
    pub fn post(&self) -> Status {
        let rc = unsafe { libc::sem_post(self.inner.get()) };
        if rc == 0 { Status::Ok } else { Status::Error }
    }

    /// Block until the semaphore is nonzero, then decrement it.
    pub fn wait(&self) -> Status {
        let rc = unsafe { libc::sem_wait(self.inner.get()) };
        if rc == 0 { Status::Ok } else { Status::Error }
    }

    /// Decrement without blocking; `Timeout` if the semaphore is zero.
    pub fn try_wait(&self) -> Status {
        let rc = unsafe { libc::sem_trywait(self.inner.get()) };
        if rc == 0 {
            Status::Ok
        } else if errno() == libc::EAGAIN {
            Status::Timeout
        } else {
            Status::Error
        }
    }

    /// Decrement with a relative timeout, applying the degrade rules.
    pub fn timed_wait(&self, secs: f64) -> Status {
        match Deadline::relative(secs) {
            Deadline::Blocking => self.wait(),
            Deadline::NoWait => self.try_wait(),
            Deadline::Absolute(ts) => {
                let spec = ts.to_timespec();
                let rc = unsafe { libc::sem_timedwait(self.inner.get(), &spec) };
                match rc {
                    0 => Status::Ok,
                    _ if errno() == libc::ETIMEDOUT => Status::Timeout,
                    _ => Status::Error,
                }
            }
        }
    }

    /// Current semaphore value. Diagnostic only; racy the instant it returns.
    pub fn get_value(&self) -> TaoResult<i32> {
        let mut value: libc::c_int = 0;
        let rc = unsafe { libc::sem_getvalue(self.inner.get(), &mut value) };
        if rc == 0 {
            Ok(value)
        } else {
            Err(TaoError::System("sem_getvalue failed".into()))
        }
    }
}

impl Default for RawSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

const fn unsafe_zeroed_sem() -> libc::sem_t {
    // SAFETY: zeroed `sem_t` is reinitialized by `init` before use.
    unsafe { std::mem::zeroed() }
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// A named semaphore, for rendezvous between processes that do not share a
/// segment (e.g. discovery handshakes). Not used by the core object
/// hierarchy, which always places [`RawSemaphore`] in-place.
pub struct NamedSemaphore {
    handle: *mut libc::sem_t,
    name: CString,
}

unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Open (creating if absent) a named semaphore.
    pub fn open(name: &str, initial_value: u32) -> TaoResult<Self> {
        let cname = CString::new(name)
            .map_err(|_| TaoError::BadName("semaphore name contains NUL".into()))?;
        let handle = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT,
                0o600 as libc::mode_t,
                initial_value,
            )
        };
        if handle == libc::SEM_FAILED {
            return Err(TaoError::System(format!(
                "sem_open({name}) failed: errno {}",
                errno()
            )));
        }
        Ok(NamedSemaphore {
            handle,
            name: cname,
        })
    }

    /// Increment the semaphore.
    pub fn post(&self) -> Status {
        let rc = unsafe { libc::sem_post(self.handle) };
        if rc == 0 { Status::Ok } else { Status::Error }
    }

    /// Block until nonzero, then decrement.
    pub fn wait(&self) -> Status {
        let rc = unsafe { libc::sem_wait(self.handle) };
        if rc == 0 { Status::Ok } else { Status::Error }
    }

    /// Remove the semaphore's name from the system. Existing handles (in
    /// this or other processes) remain valid until closed.
    pub fn unlink(name: &str) -> TaoResult<()> {
        let cname = CString::new(name)
            .map_err(|_| TaoError::BadName("semaphore name contains NUL".into()))?;
        let rc = unsafe { libc::sem_unlink(cname.as_ptr()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(TaoError::System(format!(
                "sem_unlink({name}) failed: errno {}",
                errno()
            )))
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.handle);
        }
        let _ = &self.name;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_wait_cycle() {
        let sem = RawSemaphore::new();
        sem.init(false, 0).unwrap();
        assert_eq!(sem.post(), Status::Ok);
        assert_eq!(sem.wait(), Status::Ok);
        sem.destroy();
    }

    #[test]
    fn try_wait_on_empty_times_out() {
        let sem = RawSemaphore::new();
        sem.init(false, 0).unwrap();
        assert_eq!(sem.try_wait(), Status::Timeout);
        sem.destroy();
    }

    #[test]
    fn get_value_reflects_posts() {
        let sem = RawSemaphore::new();
        sem.init(false, 0).unwrap();
        sem.post();
        sem.post();
        assert_eq!(sem.get_value().unwrap(), 2);
        sem.destroy();
    }

    #[test]
    fn timed_wait_expires() {
        let sem = RawSemaphore::new();
        sem.init(false, 0).unwrap();
        assert_eq!(sem.timed_wait(0.05), Status::Timeout);
        sem.destroy();
    }

    #[test]
    fn named_semaphore_round_trip() {
        let name = "/tao_sync_test_named_sem";
        let _ = NamedSemaphore::unlink(name);
        let sem = NamedSemaphore::open(name, 0).unwrap();
        assert_eq!(sem.post(), Status::Ok);
        assert_eq!(sem.wait(), Status::Ok);
        drop(sem);
        NamedSemaphore::unlink(name).unwrap();
    }
}
