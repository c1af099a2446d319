//! Writer-preference r/w lock built from a mutex and two condvars.
//!
//! `pthread_rwlock_t` is not used: glibc does not portably guarantee writer
//! preference, and the protocol below is the standard starvation-free one
//! built from a mutex and two condition variables.

use crate::condvar::RawCondvar;
use crate::mutex::{RawMutex, SharedFlag};
use crate::time::Deadline;
use std::sync::atomic::{AtomicI64, Ordering};
use tao_common::error::{Status, TaoError, TaoResult};

/// `users` encodes the lock's current occupancy:
/// - `0`: free
/// - `> 0`: that many readers hold the lock
/// - `-1`: a writer holds the lock
/// Any other value observed is corruption.
#[repr(C)]
pub struct RawRwLock {
    mutex: RawMutex,
    readers_ok: RawCondvar,
    writer_ok: RawCondvar,
    users: AtomicI64,
    writers: AtomicI64,
}

impl RawRwLock {
    /// Construct an uninitialized lock. Call [`RawRwLock::init`] before use.
    pub const fn new() -> Self {
        RawRwLock {
            mutex: RawMutex::new(),
            readers_ok: RawCondvar::new(),
            writer_ok: RawCondvar::new(),
            users: AtomicI64::new(0),
            writers: AtomicI64::new(0),
        }
    }

    /// Initialize the lock and its embedded primitives in place.
    pub fn init(&self, shared: SharedFlag) -> Result<(), Status> {
        self.mutex.init(shared)?;
        self.readers_ok.init(shared)?;
        self.writer_ok.init(shared)?;
        self.users.store(0, Ordering::Relaxed);
        self.writers.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Destroy the lock and its embedded primitives. No thread may hold it.
    pub fn destroy(&self) {
        self.mutex.destroy();
        self.readers_ok.destroy();
        self.writer_ok.destroy();
    }

    fn check_users(&self) -> TaoResult<i64> {
        let users = self.users.load(Ordering::SeqCst);
        if users < -1 {
            return Err(TaoError::Corrupted);
        }
        Ok(users)
    }

    /// Acquire for reading, blocking while a writer holds or awaits the lock.
    pub fn read_lock(&self) -> TaoResult<()> {
        self.deadline_read_lock(Deadline::Blocking).map(|_| ())
    }

    /// Acquire for reading with a relative timeout (degrade rules in
    /// [`Deadline::relative`]).
    pub fn timed_read_lock(&self, secs: f64) -> TaoResult<Status> {
        self.deadline_read_lock(Deadline::relative(secs))
    }

    /// Acquire for reading against an explicit [`Deadline`] (blocking,
    /// non-blocking, or an absolute `CLOCK_REALTIME` instant).
    pub fn deadline_read_lock(&self, deadline: Deadline) -> TaoResult<Status> {
        self.mutex.lock();
        loop {
            let users = self.check_users()?;
            if self.writers.load(Ordering::SeqCst) == 0 && users != -1 {
                break;
            }
            let status = match deadline {
                Deadline::Blocking => self.readers_ok.wait(&self.mutex),
                Deadline::NoWait => Status::Timeout,
                Deadline::Absolute(ts) => self.readers_ok.abstimed_wait(&self.mutex, ts),
            };
            if status == Status::Timeout {
                self.mutex.unlock();
                return Ok(Status::Timeout);
            }
        }
        self.users.fetch_add(1, Ordering::SeqCst);
        self.mutex.unlock();
        Ok(Status::Ok)
    }

    /// Release a reader's hold on the lock.
    pub fn read_unlock(&self) -> TaoResult<()> {
        self.mutex.lock();
        let users = self.users.fetch_sub(1, Ordering::SeqCst) - 1;
        if users < 0 {
            self.mutex.unlock();
            return Err(TaoError::Corrupted);
        }
        if users == 0 {
            self.writer_ok.signal();
        }
        self.mutex.unlock();
        Ok(())
    }

    /// Acquire for writing, blocking until no readers or writer remain.
    pub fn write_lock(&self) -> TaoResult<()> {
        self.deadline_write_lock(Deadline::Blocking).map(|_| ())
    }

    /// Acquire for writing with a relative timeout (degrade rules in
    /// [`Deadline::relative`]).
    pub fn timed_write_lock(&self, secs: f64) -> TaoResult<Status> {
        self.deadline_write_lock(Deadline::relative(secs))
    }

    /// Acquire for writing against an explicit [`Deadline`].
    ///
    /// Registers intent in `writers` before waiting so that new readers
    /// block behind this writer (writer preference), then waits for the
    /// lock to drain to `0` users before claiming it as `-1`.
    pub fn deadline_write_lock(&self, deadline: Deadline) -> TaoResult<Status> {
        self.mutex.lock();
        self.writers.fetch_add(1, Ordering::SeqCst);
        loop {
            let users = self.check_users().inspect_err(|_| {
                self.writers.fetch_sub(1, Ordering::SeqCst);
            })?;
            if users == 0 {
                break;
            }
            let status = match deadline {
                Deadline::Blocking => self.writer_ok.wait(&self.mutex),
                Deadline::NoWait => Status::Timeout,
                Deadline::Absolute(ts) => self.writer_ok.abstimed_wait(&self.mutex, ts),
            };
            if status == Status::Timeout {
                self.writers.fetch_sub(1, Ordering::SeqCst);
                self.mutex.unlock();
                return Ok(Status::Timeout);
            }
        }
        self.writers.fetch_sub(1, Ordering::SeqCst);
        self.users.store(-1, Ordering::SeqCst);
        self.mutex.unlock();
        Ok(Status::Ok)
    }

    /// Release a writer's hold on the lock.
    pub fn write_unlock(&self) -> TaoResult<()> {
        self.mutex.lock();
        if self.users.load(Ordering::SeqCst) != -1 {
            self.mutex.unlock();
            return Err(TaoError::Corrupted);
        }
        self.users.store(0, Ordering::SeqCst);
        if self.writers.load(Ordering::SeqCst) > 0 {
            self.writer_ok.signal();
        } else {
            self.readers_ok.broadcast();
        }
        self.mutex.unlock();
        Ok(())
    }

    /// Number of readers currently holding the lock, or `-1` if a writer
    /// holds it. Diagnostic only; racy the instant it returns.
    pub fn occupancy(&self) -> i64 {
        self.users.load(Ordering::SeqCst)
    }
}

impl Default for RawRwLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn new_lock() -> RawRwLock {
        let l = RawRwLock::new();
        l.init(SharedFlag::ProcessPrivate).unwrap();
        l
    }

    #[test]
    fn multiple_readers_concurrent() {
        let lock = new_lock();
        lock.read_lock().unwrap();
        lock.read_lock().unwrap();
        assert_eq!(lock.occupancy(), 2);
        lock.read_unlock().unwrap();
        lock.read_unlock().unwrap();
        assert_eq!(lock.occupancy(), 0);
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = Arc::new(new_lock());
        lock.write_lock().unwrap();
        assert_eq!(lock.occupancy(), -1);

        let l2 = Arc::clone(&lock);
        let reader_acquired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&reader_acquired);
        let handle = thread::spawn(move || {
            l2.read_lock().unwrap();
            flag.store(true, Ordering::SeqCst);
            l2.read_unlock().unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!reader_acquired.load(Ordering::SeqCst));

        lock.write_unlock().unwrap();
        handle.join().unwrap();
        assert!(reader_acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn writer_preference_blocks_new_readers() {
        let lock = Arc::new(new_lock());
        lock.read_lock().unwrap();

        let l2 = Arc::clone(&lock);
        let writer_acquired = Arc::new(AtomicBool::new(false));
        let wflag = Arc::clone(&writer_acquired);
        let writer = thread::spawn(move || {
            l2.write_lock().unwrap();
            wflag.store(true, Ordering::SeqCst);
            l2.write_unlock().unwrap();
        });
        thread::sleep(Duration::from_millis(30));

        let l3 = Arc::clone(&lock);
        let reader_acquired = Arc::new(AtomicBool::new(false));
        let rflag = Arc::clone(&reader_acquired);
        let reader = thread::spawn(move || {
            l3.read_lock().unwrap();
            rflag.store(true, Ordering::SeqCst);
            l3.read_unlock().unwrap();
        });
        thread::sleep(Duration::from_millis(30));

        assert!(!writer_acquired.load(Ordering::SeqCst));
        assert!(!reader_acquired.load(Ordering::SeqCst));

        lock.read_unlock().unwrap();
        writer.join().unwrap();
        reader.join().unwrap();
        assert!(writer_acquired.load(Ordering::SeqCst));
        assert!(reader_acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn timed_read_lock_times_out_behind_writer() {
        let lock = new_lock();
        lock.write_lock().unwrap();
        assert_eq!(lock.timed_read_lock(0.05).unwrap(), Status::Timeout);
        lock.write_unlock().unwrap();
    }

    #[test]
    fn corruption_detected_on_bad_users() {
        let lock = new_lock();
        lock.users.store(-7, Ordering::SeqCst);
        assert!(matches!(lock.read_lock(), Err(TaoError::Corrupted)));
    }
}
