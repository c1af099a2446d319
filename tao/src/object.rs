//! Shared-object base header (component D).
//!
//! Placed at offset 0 of every segment, identically for every member of the
//! type hierarchy — `rwlocked`/`shared_array` and `remote`/`remote_camera`
//! etc. all embed [`ObjectHeader`] as their first field: composition over
//! inheritance, with a cache-line-aligned header pinned at offset 0.

use crate::segment::{self, CreateFlags, ShmId};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use tao_common::consts::{
    FAMILY_SHARED, family_descends_from, tag_family, tag_magic, type_tag, CACHE_LINE_SIZE,
    TAO_MAGIC,
};
use tao_common::error::{TaoError, TaoResult};
use tao_sync::{RawCondvar, RawMutex, SharedFlag};
use tracing::debug;

/// Base header every shared object starts with.
///
/// `type_tag`, `size` and `shmid` are immutable for the object's lifetime;
/// only the mutex, condvar and attach count are mutated after creation.
#[repr(C, align(64))]
pub struct ObjectHeader {
    /// `TAO_MAGIC << 8 | family`. Immutable.
    pub type_tag: u32,
    /// Total segment size in bytes, including this header. Immutable.
    pub size: u64,
    /// The backing segment's id. Immutable.
    pub shmid: AtomicI32,
    /// Number of processes currently attached. Maintained by `attach`/`detach`.
    pub attach_count: AtomicU32,
    /// `1` if the segment survives all detaches.
    pub persistent: u32,
    /// Base mutex: guards the header's own mutable fields and, for
    /// `rwlocked`/`remote` descendants, serializes access to their
    /// embedded state alongside the more specific locks those types add.
    pub mutex: RawMutex,
    /// Base condition variable, signaled on state transitions a waiter
    /// might care about (new data, command processed, server state change).
    pub cond: RawCondvar,
}

const _: () = {
    static_assertions::const_assert_eq!(std::mem::align_of::<ObjectHeader>(), CACHE_LINE_SIZE);
};

impl ObjectHeader {
    /// Initialize a freshly zero-filled header in place after `create`.
    ///
    /// # Safety
    /// `ptr` must point to at least `size_of::<ObjectHeader>()` zeroed,
    /// writable bytes that will remain mapped for the header's lifetime.
    pub unsafe fn init_in_place(
        ptr: *mut ObjectHeader,
        family: u8,
        size: u64,
        shmid: ShmId,
        persistent: bool,
    ) -> TaoResult<()> {
        unsafe {
            std::ptr::write(
                ptr,
                ObjectHeader {
                    type_tag: type_tag(family),
                    size,
                    shmid: AtomicI32::new(shmid),
                    attach_count: AtomicU32::new(1),
                    persistent: persistent as u32,
                    mutex: RawMutex::new(),
                    cond: RawCondvar::new(),
                },
            );
            let header = &*ptr;
            header
                .mutex
                .init(SharedFlag::ProcessShared)
                .map_err(|_| TaoError::System("mutex init failed".into()))?;
            header
                .cond
                .init(SharedFlag::ProcessShared)
                .map_err(|_| TaoError::System("condvar init failed".into()))?;
        }
        Ok(())
    }

    /// Validate that this header's magic is present and its family
    /// descends from `expected_family`.
    pub fn validate(&self, expected_family: u8) -> TaoResult<()> {
        let magic = tag_magic(self.type_tag);
        if magic != TAO_MAGIC {
            return Err(TaoError::BadMagic(self.type_tag));
        }
        let family = tag_family(self.type_tag);
        if !family_descends_from(family, expected_family) {
            return Err(TaoError::BadType {
                expected: expected_family,
                actual: family,
            });
        }
        Ok(())
    }

    /// This header's family byte.
    pub fn family(&self) -> u8 {
        tag_family(self.type_tag)
    }

    /// Record a new attachment. Called by `attach`, never by `create`
    /// (which starts the count at 1).
    pub fn add_attach(&self) -> u32 {
        self.attach_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record a detachment, returning the new count.
    pub fn remove_attach(&self) -> u32 {
        self.attach_count.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

/// An owned handle to a mapped shared object: base family [`FAMILY_SHARED`],
/// generalized over richer families by [`crate::rwlocked`] and
/// [`crate::remote`], which embed this as their first field rather than
/// wrapping it, mirroring [`ObjectHeader`]'s own composition.
pub struct SharedObject {
    base: *mut ObjectHeader,
    shmid: ShmId,
    size: usize,
    owns_segment: bool,
}

unsafe impl Send for SharedObject {}
unsafe impl Sync for SharedObject {}

impl SharedObject {
    /// Create a new base shared object of `size` bytes.
    pub fn create(size: usize, flags: CreateFlags) -> TaoResult<Self> {
        let (shmid, ptr) = segment::create(size, flags)?;
        let header = ptr as *mut ObjectHeader;
        unsafe {
            ObjectHeader::init_in_place(
                header,
                FAMILY_SHARED,
                size as u64,
                shmid,
                flags.is_persistent(),
            )?;
        }
        debug!(shmid, size, "created shared object");
        Ok(SharedObject {
            base: header,
            shmid,
            size,
            owns_segment: true,
        })
    }

    /// Attach to an existing shared object by id, validating its type.
    pub fn attach(shmid: ShmId, expected_family: u8) -> TaoResult<Self> {
        let (ptr, size) = segment::attach(shmid)?;
        let header = ptr as *mut ObjectHeader;
        unsafe { (*header).validate(expected_family)? };
        unsafe { (*header).add_attach() };
        Ok(SharedObject {
            base: header,
            shmid,
            size,
            owns_segment: false,
        })
    }

    /// Borrow the header.
    pub fn header(&self) -> &ObjectHeader {
        unsafe { &*self.base }
    }

    /// Raw base pointer, for subclasses that place additional fields after
    /// the header.
    pub fn base_ptr(&self) -> *mut u8 {
        self.base as *mut u8
    }

    /// Immutable getter: the object's size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Immutable getter: the object's backing shmid.
    pub fn shmid(&self) -> ShmId {
        self.shmid
    }

    /// Immutable getter: the object's family byte.
    pub fn family(&self) -> u8 {
        self.header().family()
    }

    /// Detach (and, if this is the last reference and the object is not
    /// persistent, destroy) the underlying segment.
    ///
    /// The caller must not be holding the base mutex.
    pub fn detach(self) -> TaoResult<()> {
        drop(self);
        Ok(())
    }
}

impl Drop for SharedObject {
    fn drop(&mut self) {
        let remaining = self.header().remove_attach();
        let _ = segment::detach(self.base as *mut u8);
        if self.owns_segment && remaining == 0 {
            let _ = segment::destroy(self.shmid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tao_common::consts::{FAMILY_REMOTE, SHM_MIN_SIZE};

    #[test]
    fn create_then_attach_validates_family() {
        let obj = SharedObject::create(SHM_MIN_SIZE, CreateFlags::NONE).unwrap();
        let shmid = obj.shmid();
        let attached = SharedObject::attach(shmid, FAMILY_SHARED).unwrap();
        assert_eq!(attached.family(), FAMILY_SHARED);
        assert_eq!(attached.size(), obj.size());
    }

    #[test]
    fn attach_rejects_wrong_family() {
        let obj = SharedObject::create(SHM_MIN_SIZE, CreateFlags::NONE).unwrap();
        let shmid = obj.shmid();
        let result = SharedObject::attach(shmid, FAMILY_REMOTE);
        assert!(matches!(result, Err(TaoError::BadType { .. })));
    }

    #[test]
    fn immutable_fields_survive_attach() {
        let obj = SharedObject::create(SHM_MIN_SIZE, CreateFlags::NONE).unwrap();
        let shmid = obj.shmid();
        let size = obj.size();
        let attached = SharedObject::attach(shmid, FAMILY_SHARED).unwrap();
        assert_eq!(attached.shmid(), shmid);
        assert_eq!(attached.size(), size);
    }
}
