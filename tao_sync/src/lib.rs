//! Process-shared concurrency primitives for TAO.
//!
//! Every guard here is `repr(C)`, fixed-size, and meant to be placed
//! in-place inside a shared segment mapped by more than one process — a
//! caller obtains a reference by casting a raw pointer into the mapping
//! (see `tao::segment`), never by moving a guard once `init` has run.
//!
//! - [`mutex::RawMutex`] / [`condvar::RawCondvar`]: thin wrappers over
//! `pthread_mutex_t` / `pthread_cond_t` with `PTHREAD_PROCESS_SHARED`.
//! - [`rwlock::RawRwLock`]: a writer-preference lock built from the above,
//! per, rather than `pthread_rwlock_t`.
//! - [`semaphore::RawSemaphore`] / [`semaphore::NamedSemaphore`]: `sem_t`
//! wrappers for the anonymous and named cases respectively.
//! - [`time`]: the shared `Timestamp`/`Deadline` vocabulary every blocking
//! call above degrades through.

pub mod condvar;
pub mod mutex;
pub mod rwlock;
pub mod semaphore;
pub mod time;

pub use condvar::RawCondvar;
pub use mutex::{RawMutex, SharedFlag};
pub use rwlock::RawRwLock;
pub use semaphore::{NamedSemaphore, RawSemaphore};
pub use time::{Deadline, Timestamp};
