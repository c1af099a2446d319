//! Shared-segment manager (component C).
//!
//! Backed by System V shared memory: `shmget`/`shmat`/`shmdt`/`shmctl`. `nix`
//! has no System V shm wrappers, so this drops to raw `libc`, same as
//! elsewhere in this crate when `nix`'s safe surface doesn't cover a needed
//! primitive.

use std::ffi::c_void;
use tao_common::consts::{FLAG_PERSISTENT, SHMID_NONE, SHM_MAX_SIZE, SHM_MIN_SIZE};
use tao_common::error::{TaoError, TaoResult};
use tracing::{debug, warn};

/// A signed 32-bit shared-segment identifier. `-1` (`SHMID_NONE`) means
/// "no segment".
pub type ShmId = i32;

/// `create`-time flags. Bit `1 << 20` ([`FLAG_PERSISTENT`]) requests a
/// segment that survives every detach rather than being destroyed on the
/// last one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateFlags(pub u32);

impl CreateFlags {
    /// Destroy-on-last-detach (the default).
    pub const NONE: CreateFlags = CreateFlags(0);
    /// Survive all detaches until explicitly [`destroy`]ed.
    pub const PERSISTENT: CreateFlags = CreateFlags(FLAG_PERSISTENT);

    /// Whether the persistent bit is set.
    pub fn is_persistent(self) -> bool {
        self.0 & FLAG_PERSISTENT != 0
    }
}

/// `(size, attach_count)` as reported by [`stat`]. `(0, 0)` means the
/// segment does not exist (or has been fully destroyed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentStat {
    /// Data section size in bytes.
    pub size: usize,
    /// Number of processes currently attached.
    pub attach_count: u32,
}

fn io_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn errno_to_error(call: &str, errno: i32) -> TaoError {
    match errno {
        libc::ENOMEM | libc::ENOSPC => TaoError::System(format!("{call}: out of resources")),
        libc::EACCES | libc::EPERM => TaoError::System(format!("{call}: permission denied")),
        libc::EINVAL => TaoError::BadArgument(format!("{call}: invalid argument")),
        libc::EIDRM | libc::ENOENT => TaoError::NotFound(format!("{call}: no such segment")),
        other => TaoError::System(format!("{call}: errno {other}")),
    }
}

/// Allocate a new segment of `size` bytes, zero-filled by the kernel.
///
/// Returns the new segment's id and the address it is mapped at in this
/// process. `size` is rounded up to a multiple of [`SHM_MIN_SIZE`] by the
/// kernel; callers that care about the exact allocated size should follow
/// up with [`stat`].
pub fn create(size: usize, flags: CreateFlags) -> TaoResult<(ShmId, *mut u8)> {
    if size < SHM_MIN_SIZE || size > SHM_MAX_SIZE {
        return Err(TaoError::BadSize { size });
    }

    let shmflg = libc::IPC_CREAT | 0o600;
    let id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, shmflg) };
    if id < 0 {
        return Err(errno_to_error("shmget", io_errno()));
    }

    let ptr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
    if ptr == usize::MAX as *mut c_void {
        let errno = io_errno();
        unsafe {
            libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut());
        }
        return Err(errno_to_error("shmat", errno));
    }

    if !flags.is_persistent() {
        // Mark for destruction once the last process detaches; this
        // process's own attachment keeps it alive until `detach`.
        unsafe {
            libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut());
        }
    }

    debug!(shmid = id, size, "created shared segment");
    Ok((id, ptr as *mut u8))
}

/// Attach to an existing segment by id.
pub fn attach(shmid: ShmId) -> TaoResult<(*mut u8, usize)> {
    if shmid == SHMID_NONE {
        return Err(TaoError::BadArgument("shmid is SHMID_NONE".into()));
    }

    let stat = stat(shmid)?;
    if stat.size == 0 {
        return Err(TaoError::NotFound(format!("shmid {shmid}")));
    }

    let ptr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
    if ptr == usize::MAX as *mut c_void {
        return Err(errno_to_error("shmat", io_errno()));
    }

    Ok((ptr as *mut u8, stat.size))
}

/// Unmap a previously attached or created segment.
///
/// The caller must have released any locks inside the segment first;
/// detaching while holding a lock on the mapped header is undefined.
pub fn detach(base_ptr: *mut u8) -> TaoResult<()> {
    let rc = unsafe { libc::shmdt(base_ptr as *const c_void) };
    if rc != 0 {
        return Err(errno_to_error("shmdt", io_errno()));
    }
    Ok(())
}

/// Mark a segment for destruction.
///
/// On Linux this is effective immediately for new attaches but the
/// underlying memory persists until the last existing attachment detaches —
/// callers on other System V implementations without that semantic must
/// instead poll [`stat`] until `attach_count` reaches zero before reusing
/// the id space.
pub fn destroy(shmid: ShmId) -> TaoResult<()> {
    let rc = unsafe { libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut()) };
    if rc != 0 {
        let errno = io_errno();
        if errno == libc::EIDRM || errno == libc::ENOENT {
            return Ok(());
        }
        return Err(errno_to_error("shmctl(IPC_RMID)", errno));
    }
    Ok(())
}

/// Report `(size, attach_count)` for `shmid`, or `(0, 0)` if it does not
/// exist. Used as an existence probe.
pub fn stat(shmid: ShmId) -> TaoResult<SegmentStat> {
    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::shmctl(shmid, libc::IPC_STAT, &mut ds) };
    if rc != 0 {
        let errno = io_errno();
        if errno == libc::EIDRM || errno == libc::ENOENT || errno == libc::EINVAL {
            return Ok(SegmentStat {
                size: 0,
                attach_count: 0,
            });
        }
        return Err(errno_to_error("shmctl(IPC_STAT)", errno));
    }
    Ok(SegmentStat {
        size: ds.shm_segsz as usize,
        attach_count: ds.shm_nattch as u32,
    })
}

/// Force-remove a segment regardless of outstanding attachments, logging a
/// warning. Used only by cleanup tooling, never by the normal lifecycle.
pub fn force_destroy(shmid: ShmId) -> TaoResult<()> {
    let before = stat(shmid)?;
    if before.attach_count > 0 {
        warn!(
            shmid,
            attach_count = before.attach_count,
            "force-destroying segment with live attachments"
        );
    }
    destroy(shmid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_stat_attach_detach_destroy_cycle() {
        let (shmid, p1) = create(SHM_MIN_SIZE, CreateFlags::NONE).unwrap();
        let s = stat(shmid).unwrap();
        assert_eq!(s.size, SHM_MIN_SIZE);
        assert_eq!(s.attach_count, 1);

        let (p2, size2) = attach(shmid).unwrap();
        assert_eq!(size2, SHM_MIN_SIZE);
        let s2 = stat(shmid).unwrap();
        assert_eq!(s2.attach_count, 2);

        detach(p1).unwrap();
        detach(p2).unwrap();
        let s3 = stat(shmid).unwrap();
        assert_eq!(s3, SegmentStat { size: 0, attach_count: 0 });
    }

    #[test]
    fn create_zero_fills_memory() {
        let (shmid, ptr) = create(SHM_MIN_SIZE, CreateFlags::NONE).unwrap();
        let slice = unsafe { std::slice::from_raw_parts(ptr, SHM_MIN_SIZE) };
        assert!(slice.iter().all(|&b| b == 0));
        detach(ptr).unwrap();
        let _ = destroy(shmid);
    }

    #[test]
    fn persistent_segment_survives_until_explicit_destroy() {
        let (shmid, ptr) = create(SHM_MIN_SIZE, CreateFlags::PERSISTENT).unwrap();
        detach(ptr).unwrap();
        let s = stat(shmid).unwrap();
        assert_eq!(s.attach_count, 0);
        assert_eq!(s.size, SHM_MIN_SIZE);
        destroy(shmid).unwrap();
        let s2 = stat(shmid).unwrap();
        assert_eq!(s2.size, 0);
    }

    #[test]
    fn attach_with_bad_shmid_is_not_found() {
        assert!(matches!(attach(123_456_789), Err(TaoError::NotFound(_))));
    }

    #[test]
    fn create_rejects_undersized_request() {
        assert!(matches!(
            create(16, CreateFlags::NONE),
            Err(TaoError::BadSize { .. })
        ));
    }

    #[test]
    fn stat_of_nonexistent_segment_is_zero() {
        let s = stat(123_456_789).unwrap();
        assert_eq!(s, SegmentStat { size: 0, attach_count: 0 });
    }
}
