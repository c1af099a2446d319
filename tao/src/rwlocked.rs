//! R/w-locked object (component E).
//!
//! Embeds [`ObjectHeader`] followed immediately by a [`RawRwLock`],
//! generalized by [`crate::array::SharedArray`] the same way `rwlocked` is
//! the parent family of `shared_array` in the type hierarchy.

use crate::object::ObjectHeader;
use crate::segment::{self, CreateFlags, ShmId};
use tao_common::consts::{family_descends_from, tag_family, FAMILY_RWLOCKED};
use tao_common::error::{Status, TaoError, TaoResult};
use tao_sync::{Deadline, RawRwLock, SharedFlag};

/// Header for an r/w-locked object: the base header plus an embedded lock.
#[repr(C)]
pub struct RwLockedHeader {
    /// Base shared-object header.
    pub base: ObjectHeader,
    /// The object's r/w lock, guarding everything placed after this header
    /// by a concrete descendant (e.g. a shared array's dimension table and
    /// payload).
    pub rwlock: RawRwLock,
}

impl RwLockedHeader {
    /// Initialize a freshly zero-filled header in place after `create`.
    ///
    /// # Safety
    /// `ptr` must point to at least `size_of::<RwLockedHeader>()` zeroed,
    /// writable bytes that will remain mapped for the object's lifetime.
    pub unsafe fn init_in_place(
        ptr: *mut RwLockedHeader,
        family: u8,
        size: u64,
        shmid: ShmId,
        persistent: bool,
    ) -> TaoResult<()> {
        debug_assert!(family_descends_from(family, FAMILY_RWLOCKED));
        unsafe {
            let base_ptr = std::ptr::addr_of_mut!((*ptr).base);
            ObjectHeader::init_in_place(base_ptr, family, size, shmid, persistent)?;
            let rwlock_ptr = std::ptr::addr_of_mut!((*ptr).rwlock);
            std::ptr::write(rwlock_ptr, RawRwLock::new());
            (*rwlock_ptr)
                .init(SharedFlag::ProcessShared)
                .map_err(|_| TaoError::System("rwlock init failed".into()))?;
        }
        Ok(())
    }
}

/// An owned handle to a mapped r/w-locked object.
pub struct RwLockedObject {
    base: *mut RwLockedHeader,
    shmid: ShmId,
    size: usize,
    owns_segment: bool,
}

unsafe impl Send for RwLockedObject {}
unsafe impl Sync for RwLockedObject {}

impl RwLockedObject {
    /// Create a new r/w-locked object of `size` bytes and `family`.
    ///
    /// `family` must descend from [`FAMILY_RWLOCKED`] (it is typically
    /// [`tao_common::consts::FAMILY_SHARED_ARRAY`], written by a concrete
    /// constructor such as [`crate::array::SharedArray::create`]).
    pub fn create(size: usize, family: u8, flags: CreateFlags) -> TaoResult<Self> {
        if !family_descends_from(family, FAMILY_RWLOCKED) {
            return Err(TaoError::BadType {
                expected: FAMILY_RWLOCKED,
                actual: family,
            });
        }
        let (shmid, ptr) = segment::create(size, flags)?;
        let header = ptr as *mut RwLockedHeader;
        unsafe {
            RwLockedHeader::init_in_place(header, family, size as u64, shmid, flags.is_persistent())?;
        }
        Ok(RwLockedObject {
            base: header,
            shmid,
            size,
            owns_segment: true,
        })
    }

    /// Attach to an existing r/w-locked object by id.
    pub fn attach(shmid: ShmId, expected_family: u8) -> TaoResult<Self> {
        let (ptr, size) = segment::attach(shmid)?;
        let header = ptr as *mut RwLockedHeader;
        unsafe {
            (*header).base.validate(expected_family)?;
            (*header).base.add_attach();
        }
        Ok(RwLockedObject {
            base: header,
            shmid,
            size,
            owns_segment: false,
        })
    }

    /// Borrow the header.
    pub fn header(&self) -> &RwLockedHeader {
        unsafe { &*self.base }
    }

    /// Raw base pointer, for subclasses that place a payload after this
    /// header.
    pub fn base_ptr(&self) -> *mut u8 {
        self.base as *mut u8
    }

    /// Immutable getter: object size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Immutable getter: backing shmid.
    pub fn shmid(&self) -> ShmId {
        self.shmid
    }

    /// Immutable getter: family byte.
    pub fn family(&self) -> u8 {
        tag_family(self.header().base.type_tag)
    }

    /// Acquire the read lock, blocking.
    pub fn read_lock(&self) -> TaoResult<()> {
        self.header().rwlock.read_lock()
    }

    /// Acquire the read lock against an explicit [`Deadline`].
    pub fn deadline_read_lock(&self, deadline: Deadline) -> TaoResult<Status> {
        self.header().rwlock.deadline_read_lock(deadline)
    }

    /// Release the read lock.
    pub fn read_unlock(&self) -> TaoResult<()> {
        self.header().rwlock.read_unlock()
    }

    /// Acquire the write lock, blocking.
    pub fn write_lock(&self) -> TaoResult<()> {
        self.header().rwlock.write_lock()
    }

    /// Acquire the write lock against an explicit [`Deadline`].
    pub fn deadline_write_lock(&self, deadline: Deadline) -> TaoResult<Status> {
        self.header().rwlock.deadline_write_lock(deadline)
    }

    /// Release the write lock.
    pub fn write_unlock(&self) -> TaoResult<()> {
        self.header().rwlock.write_unlock()
    }
}

impl Drop for RwLockedObject {
    fn drop(&mut self) {
        let remaining = self.header().base.remove_attach();
        let _ = segment::detach(self.base as *mut u8);
        if self.owns_segment && remaining == 0 {
            let _ = segment::destroy(self.shmid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tao_common::consts::{FAMILY_SHARED_ARRAY, SHM_MIN_SIZE};

    #[test]
    fn create_rejects_non_descendant_family() {
        let result = RwLockedObject::create(SHM_MIN_SIZE, tao_common::consts::FAMILY_REMOTE, CreateFlags::NONE);
        assert!(matches!(result, Err(TaoError::BadType { .. })));
    }

    #[test]
    fn create_attach_lock_cycle() {
        let obj = RwLockedObject::create(SHM_MIN_SIZE, FAMILY_SHARED_ARRAY, CreateFlags::NONE).unwrap();
        obj.write_lock().unwrap();
        obj.write_unlock().unwrap();

        let attached = RwLockedObject::attach(obj.shmid(), FAMILY_RWLOCKED).unwrap();
        attached.read_lock().unwrap();
        attached.read_unlock().unwrap();
    }
}
