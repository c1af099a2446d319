//! Remote object: command queue + cyclic output-frame ring (component F),
//! and the state machine shared by every server subclass.
//!
//! [`camera`], [`mirror`] and [`sensor`] each embed [`RemoteHeader`] as their
//! first field and add subclass-specific layout after it, the same
//! composition [`ArrayHeader`](crate::array::ArrayHeader) uses over
//! [`RwLockedHeader`](crate::rwlocked::RwLockedHeader).

pub mod camera;
pub mod mirror;
pub mod sensor;

use crate::object::ObjectHeader;
use crate::segment::{self, CreateFlags, ShmId};
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use tao_common::consts::{family_descends_from, tag_family, FAMILY_REMOTE, OWNER_NAME_MAX};
use tao_common::error::{Status, TaoError, TaoResult};
use tao_sync::{Deadline, Timestamp};
use tracing::{info, warn};

/// Server/object lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum State {
    /// The server has not yet entered its event loop.
    Initializing = 0,
    /// Idle, ready to accept a command.
    Waiting = 1,
    /// Processing a `config` command.
    Configuring = 2,
    /// Processing a `start` command, transitioning to `Working`.
    Starting = 3,
    /// Actively producing output frames.
    Working = 4,
    /// Processing a `stop` command, transitioning back to `Waiting`.
    Stopping = 5,
    /// Processing an `abort` command.
    Aborting = 6,
    /// A recoverable command failure left the server needing `reset`.
    Error = 7,
    /// Processing a `reset` command.
    Resetting = 8,
    /// Processing a `kill` command; terminal.
    Quitting = 9,
    /// Observer-side sentinel: the owning process appears to be gone.
    Unreachable = -1,
}

impl State {
    fn from_wire(v: i32) -> Self {
        match v {
            0 => State::Initializing,
            1 => State::Waiting,
            2 => State::Configuring,
            3 => State::Starting,
            4 => State::Working,
            5 => State::Stopping,
            6 => State::Aborting,
            7 => State::Error,
            8 => State::Resetting,
            9 => State::Quitting,
            _ => State::Unreachable,
        }
    }

    /// Whether the owning server is gone or going away.
    pub fn is_dead(self) -> bool {
        matches!(self, State::Quitting | State::Unreachable)
    }
}

/// The command codes a remote object's single command slot may carry.
/// `None` means the slot is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Command {
    /// Slot is empty.
    None = 0,
    /// Reconfigure (subclass-specific payload).
    Config = 1,
    /// Start producing output.
    Start = 2,
    /// Stop producing output.
    Stop = 3,
    /// Abort whatever is in progress.
    Abort = 4,
    /// Clear an `Error` state.
    Reset = 5,
    /// Subclass-specific action (mirror `send`, etc.).
    Send = 6,
    /// Terminate the server.
    Kill = 7,
}

impl Command {
    fn from_wire(v: i32) -> Option<Self> {
        Some(match v {
            0 => Command::None,
            1 => Command::Config,
            2 => Command::Start,
            3 => Command::Stop,
            4 => Command::Abort,
            5 => Command::Reset,
            6 => Command::Send,
            7 => Command::Kill,
            _ => return None,
        })
    }
}

/// Fixed-size owner name buffer, NUL-padded.
type OwnerBuf = [u8; OWNER_NAME_MAX];

/// Remote-object header: the base header plus owner/ring/command/state
/// fields.
#[repr(C)]
pub struct RemoteHeader {
    /// Base shared-object header.
    pub base: ObjectHeader,
    /// Number of ring slots.
    pub nbufs: i64,
    /// Byte offset of the ring's first slot from the start of the segment.
    pub offset: i64,
    /// Byte stride between consecutive ring slots.
    pub stride: i64,
    /// 1-based serial of the most recently published frame. Acquire/release.
    pub serial: AtomicI64,
    /// Lifecycle state. Acquire/release.
    pub state: AtomicI32,
    /// Pending command code. Plain; only touched under the base mutex.
    pub command: i32,
    /// Count of commands the server has completed. Acquire/release.
    pub ncmds: AtomicI64,
    /// Free-form owner name, NUL-padded.
    pub owner: OwnerBuf,
}

impl RemoteHeader {
    /// Initialize a freshly zero-filled header in place after `create`.
    ///
    /// # Safety
    /// `ptr` must point to at least `size_of::<RemoteHeader>` zeroed,
    /// writable bytes that will remain mapped for the object's lifetime.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn init_in_place(
        ptr: *mut RemoteHeader,
        family: u8,
        size: u64,
        shmid: ShmId,
        persistent: bool,
        owner: &str,
        nbufs: i64,
        offset: i64,
        stride: i64,
    ) -> TaoResult<()> {
        debug_assert!(family_descends_from(family, FAMILY_REMOTE));
        let mut owner_buf: OwnerBuf = [0; OWNER_NAME_MAX];
        let bytes = owner.as_bytes();
        if bytes.len() >= OWNER_NAME_MAX {
            return Err(TaoError::BadName(format!("owner name too long: {owner}")));
        }
        owner_buf[..bytes.len()].copy_from_slice(bytes);

        unsafe {
            let base_ptr = std::ptr::addr_of_mut!((*ptr).base);
            ObjectHeader::init_in_place(base_ptr, family, size, shmid, persistent)?;
            std::ptr::addr_of_mut!((*ptr).nbufs).write(nbufs);
            std::ptr::addr_of_mut!((*ptr).offset).write(offset);
            std::ptr::addr_of_mut!((*ptr).stride).write(stride);
            std::ptr::addr_of_mut!((*ptr).serial).write(AtomicI64::new(0));
            std::ptr::addr_of_mut!((*ptr).state).write(AtomicI32::new(State::Initializing as i32));
            std::ptr::addr_of_mut!((*ptr).command).write(Command::None as i32);
            std::ptr::addr_of_mut!((*ptr).ncmds).write(AtomicI64::new(0));
            std::ptr::addr_of_mut!((*ptr).owner).write(owner_buf);
        }
        Ok(())
    }

    /// Owner name as a `&str`, trimmed of trailing NULs.
    pub fn owner(&self) -> &str {
        let end = self.owner.iter().position(|&b| b == 0).unwrap_or(self.owner.len());
        std::str::from_utf8(&self.owner[..end]).unwrap_or("")
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        State::from_wire(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: State) {
        self.state.store(s as i32, Ordering::Release);
    }

    /// Most recently published frame serial.
    pub fn serial(&self) -> i64 {
        self.serial.load(Ordering::Acquire)
    }

    /// Count of commands completed so far.
    pub fn ncmds(&self) -> i64 {
        self.ncmds.load(Ordering::Acquire)
    }

    /// Byte offset of ring slot `((s - 1) mod nbufs)`, for `s >= 1`.
    pub fn slot_offset(&self, s: i64) -> i64 {
        let idx = (s - 1).rem_euclid(self.nbufs);
        self.offset + idx * self.stride
    }

    /// Whether the owning process still holds an attachment. A coarse
    /// liveness probe; `wait_command`/`wait_output` rely primarily on
    /// `state` rather than this.
    pub fn is_alive(&self) -> bool {
        self.base.attach_count.load(Ordering::Acquire) > 0 && !self.state().is_dead()
    }
}

/// Base operations shared by every remote-object subclass: queueing a
/// command and waiting for ring output. Subclasses expose their own
/// typed command constructors (e.g. `configure`) on top of
/// [`RemoteCore::queue_command`].
pub struct RemoteCore {
    header: *mut RemoteHeader,
    shmid: ShmId,
    size: usize,
    owns_segment: bool,
}

unsafe impl Send for RemoteCore {}
unsafe impl Sync for RemoteCore {}

impl RemoteCore {
    /// Allocate and initialize a new remote-object segment.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        size: usize,
        family: u8,
        owner: &str,
        nbufs: i64,
        offset: i64,
        stride: i64,
        flags: CreateFlags,
    ) -> TaoResult<Self> {
        let (shmid, ptr) = segment::create(size, flags)?;
        let header = ptr as *mut RemoteHeader;
        unsafe {
            RemoteHeader::init_in_place(
                header,
                family,
                size as u64,
                shmid,
                flags.is_persistent(),
                owner,
                nbufs,
                offset,
                stride,
            )?;
        }
        Ok(RemoteCore {
            header,
            shmid,
            size,
            owns_segment: true,
        })
    }

    /// Attach to an existing remote object by id.
    pub fn attach(shmid: ShmId, expected_family: u8) -> TaoResult<Self> {
        let (ptr, size) = segment::attach(shmid)?;
        let header = ptr as *mut RemoteHeader;
        unsafe {
            (*header).base.validate(expected_family)?;
            (*header).base.add_attach();
        }
        Ok(RemoteCore {
            header,
            shmid,
            size,
            owns_segment: false,
        })
    }

    /// Borrow the header.
    pub fn header(&self) -> &RemoteHeader {
        unsafe { &*self.header }
    }

    /// Raw base pointer, for subclasses placing fields after this header.
    pub fn base_ptr(&self) -> *mut u8 {
        self.header as *mut u8
    }

    /// Segment size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Backing shmid.
    pub fn shmid(&self) -> ShmId {
        self.shmid
    }

    /// Family byte.
    pub fn family(&self) -> u8 {
        tag_family(self.header().base.type_tag)
    }

    /// Client side of the command queue: blocks until the server is ready
    /// to accept a command, writes `command`, and returns the serial the
    /// completion will carry.
    ///
    /// `write_args` runs with the base mutex held, immediately before the
    /// command code is written and the condition signaled; it should write
    /// any subclass-specific argument fields.
    pub fn queue_command(
        &self,
        command: Command,
        deadline: Deadline,
        write_args: impl FnOnce(),
    ) -> TaoResult<i64> {
        let header = self.header();
        let locked = self.timed_lock_base(deadline)?;
        if !locked {
            return Err(TaoError::Corrupted);
        }

        loop {
            let state = header.state();
            if state.is_dead() {
                self.unlock_base();
                return Err(TaoError::Unreachable);
            }
            let ready = header.command == Command::None as i32
                && matches!(state, State::Waiting | State::Working);
            if ready {
                break;
            }
            let status = self.wait_base(deadline);
            if status == Status::Timeout {
                self.unlock_base();
                return Err(TaoError::Timeout(
                    "command not acceptable in current state before deadline".into(),
                ));
            }
        }

        write_args();
        unsafe {
            std::ptr::addr_of_mut!((*self.header).command).write(command as i32);
        }
        let expected = header.ncmds() + 1;
        header.base.cond.broadcast();
        self.unlock_base();
        Ok(expected)
    }

    /// Client side of `wait_command`: blocks until `ncmds >=
    /// expected` or the server is gone.
    pub fn wait_command(&self, expected: i64, deadline: Deadline) -> TaoResult<()> {
        let header = self.header();
        self.timed_lock_base(deadline)?;
        loop {
            if header.ncmds() >= expected {
                self.unlock_base();
                return Ok(());
            }
            if header.state().is_dead() {
                self.unlock_base();
                return Err(TaoError::Unreachable);
            }
            let status = self.wait_base(deadline);
            if status == Status::Timeout {
                self.unlock_base();
                return Err(TaoError::Timeout("wait_command deadline elapsed".into()));
            }
        }
    }

    /// Client side of `wait_output`: waits for `remote.serial >=
    /// s_tgt`. Returns the target serial on success, `0` if the deadline
    /// simply elapsed with nothing yet to report, or one of three negative
    /// sentinels on the documented failure paths: `-1` if the ring has
    /// already overwritten the target slot, `-2` if the server died before
    /// publishing it, `-3` on an unexpected/corrupted condition.
    pub fn wait_output(&self, requested: i64, deadline: Deadline) -> i64 {
        let header = self.header();
        let _ = self.timed_lock_base(deadline);
        let nbufs = header.nbufs;
        loop {
            let serial = header.serial();
            let target = if requested > 0 { requested } else { serial + 1 };
            if serial >= target + nbufs {
                self.unlock_base();
                return -1;
            }
            if header.state().is_dead() && target > serial {
                self.unlock_base();
                return -2;
            }
            if serial >= target {
                self.unlock_base();
                return target;
            }
            let status = self.wait_base(deadline);
            if status == Status::Timeout {
                self.unlock_base();
                return 0;
            }
        }
    }

    /// Server side: run the event loop body once. Blocks (respecting
    /// `deadline`) until a command is pending, copies it out under the base
    /// mutex, and returns it for `execute` to act on outside the lock.
    pub fn next_command(&self, deadline: Deadline) -> TaoResult<Option<Command>> {
        let header = self.header();
        self.timed_lock_base(deadline)?;
        header.set_state(State::Waiting);
        loop {
            let cmd = Command::from_wire(header.command).unwrap_or(Command::None);
            if cmd != Command::None {
                self.unlock_base();
                return Ok(Some(cmd));
            }
            let status = self.wait_base(deadline);
            if status == Status::Timeout {
                self.unlock_base();
                return Ok(None);
            }
        }
    }

    /// Server side: mark the in-flight command as finished, transition to
    /// `next_state` (`Error` or `Quitting` on the documented failure/kill
    /// paths), bump `ncmds`, and notify waiters.
    pub fn complete_command(&self, next_state: State) {
        let header = self.header();
        self.lock_base();
        unsafe {
            std::ptr::addr_of_mut!((*self.header).command).write(Command::None as i32);
        }
        header.ncmds.fetch_add(1, Ordering::Release);
        header.set_state(next_state);
        header.base.cond.broadcast();
        self.unlock_base();
        info!(state = ?next_state, ncmds = header.ncmds(), "command completed");
    }

    /// Server side: publish frame `s = serial + 1` after the caller has
    /// already written the slot payload and the slot's own dataframe-header
    /// serial.
    pub fn publish(&self) -> i64 {
        let header = self.header();
        self.lock_base();
        let s = header.serial() + 1;
        header.serial.store(s, Ordering::Release);
        header.base.cond.broadcast();
        self.unlock_base();
        s
    }

    /// Server side: set the lifecycle state without going through the
    /// command queue, for transitions driven directly by the event loop
    /// (e.g. `Starting -> Working`).
    pub fn set_state(&self, s: State) {
        self.lock_base();
        self.header().set_state(s);
        self.header().base.cond.broadcast();
        self.unlock_base();
    }

    fn lock_base(&self) {
        self.header().base.mutex.lock();
    }

    fn unlock_base(&self) {
        self.header().base.mutex.unlock();
    }

    fn timed_lock_base(&self, deadline: Deadline) -> TaoResult<bool> {
        let status = match deadline {
            Deadline::Blocking => self.header().base.mutex.lock(),
            Deadline::NoWait => self.header().base.mutex.try_lock(),
            Deadline::Absolute(ts) => self.header().base.mutex.abstimed_lock(ts),
        };
        Ok(status == Status::Ok)
    }

    fn wait_base(&self, deadline: Deadline) -> Status {
        match deadline {
            Deadline::Blocking => self.header().base.cond.wait(&self.header().base.mutex),
            Deadline::NoWait => Status::Timeout,
            Deadline::Absolute(ts) => self
                .header()
                .base
                .cond
                .abstimed_wait(&self.header().base.mutex, ts),
        }
    }
}

impl Drop for RemoteCore {
    fn drop(&mut self) {
        let remaining = self.header().base.remove_attach();
        let _ = segment::detach(self.header as *mut u8);
        if self.owns_segment && remaining == 0 {
            let _ = segment::destroy(self.shmid);
        }
    }
}

/// Compute the deadline-aware `abstimed_wait` target exactly once per call,
/// rather than recomputing "now + secs" on every loop iteration, the same
/// convention [`crate::object`]'s guards use via `tao_sync::Deadline`.
pub fn deadline_from_secs(secs: f64) -> Deadline {
    Deadline::relative(secs)
}

pub(crate) fn warn_if_stale(last_seen: Timestamp, grace_period_s: u64) -> bool {
    let stale = last_seen.seconds_from_now() < -(grace_period_s as f64);
    if stale {
        warn!("remote object heartbeat stale beyond grace period");
    }
    stale
}

#[cfg(test)]
mod tests {
    use super::*;
    use tao_common::consts::{FAMILY_REMOTE, SHM_MIN_SIZE};

    fn new_core(nbufs: i64) -> RemoteCore {
        RemoteCore::create(
            SHM_MIN_SIZE,
            FAMILY_REMOTE,
            "test",
            nbufs,
            512,
            256,
            CreateFlags::NONE,
        )
        .unwrap()
    }

    #[test]
    fn owner_round_trips() {
        let core = new_core(4);
        assert_eq!(core.header().owner(), "test");
    }

    #[test]
    fn slot_offset_wraps() {
        let core = new_core(4);
        assert_eq!(core.header().slot_offset(1), 512);
        assert_eq!(core.header().slot_offset(4), 512 + 3 * 256);
        assert_eq!(core.header().slot_offset(5), 512);
    }

    #[test]
    fn command_queue_round_trip() {
        let core = new_core(4);
        core.set_state(State::Waiting);

        let expected = core
            .queue_command(Command::Start, Deadline::relative(1.0), || {})
            .unwrap();
        assert_eq!(expected, 1);

        let next = core.next_command(Deadline::NoWait).unwrap();
        assert_eq!(next, Some(Command::Start));
        core.complete_command(State::Working);

        core.wait_command(expected, Deadline::relative(1.0)).unwrap();
        assert_eq!(core.header().ncmds(), 1);
    }

    #[test]
    fn wait_output_detects_overwrite() {
        let core = new_core(2);
        core.publish();
        core.publish();
        core.publish();
        let result = core.wait_output(1, Deadline::NoWait);
        assert_eq!(result, -1);
    }

    #[test]
    fn wait_output_detects_dead_server() {
        let core = new_core(2);
        core.set_state(State::Quitting);
        let result = core.wait_output(1, Deadline::NoWait);
        assert_eq!(result, -2);
    }

    #[test]
    fn wait_output_succeeds_after_publish() {
        let core = new_core(2);
        let s = core.publish();
        let result = core.wait_output(s, Deadline::NoWait);
        assert_eq!(result, s);
    }

    #[test]
    fn wait_output_plain_timeout_returns_zero() {
        let core = new_core(2);
        core.set_state(State::Waiting);
        let result = core.wait_output(1, Deadline::NoWait);
        assert_eq!(result, 0);
    }
}
