//! Shared multi-dimensional array (component G).
//!
//! Sits on [`RwLockedHeader`]: immutable element type, rank and dimensions;
//! a mutable element payload, serial number and five timestamps, all
//! protected by the embedded r/w lock. Column-major, SIMD-aligned, the same
//! "typed payload over a locked header" composition `shared_array` has over
//! `rwlocked` in the type hierarchy.

use crate::rwlocked::{RwLockedHeader, RwLockedObject};
use crate::segment::{CreateFlags, ShmId};
use std::sync::atomic::{AtomicI64, Ordering};
use tao_common::consts::{FAMILY_SHARED_ARRAY, MAX_ARRAY_NDIMS, SIMD_ALIGNMENT};
use tao_common::error::{TaoError, TaoResult};
use tao_common::types::ElementType;
use tao_sync::{Deadline, Timestamp};

/// Shared-array header: the r/w-locked base plus the array's own immutable
/// and r/w-locked-mutable fields.
#[repr(C)]
pub struct ArrayHeader {
    /// R/w-locked base (object header + lock).
    pub base: RwLockedHeader,
    /// Total element count, `∏ dims[0..ndims]`. Immutable.
    pub nelem: i64,
    /// Number of dimensions, `0..=5`. Immutable.
    pub ndims: i32,
    /// Dimension extents; only the first `ndims` entries are meaningful.
    /// Immutable.
    pub dims: [i64; MAX_ARRAY_NDIMS],
    /// Wire-stable element type tag. Immutable.
    pub eltype: i32,
    /// Monotone serial, bumped by the writer on every publish. Mutable only
    /// under the write lock.
    pub serial: AtomicI64,
    /// Five most recent write timestamps, newest first. Mutable only under
    /// the write lock.
    pub timestamps: [Timestamp; 5],
}

fn element_count(dims: &[i64]) -> TaoResult<i64> {
    let mut count: i64 = 1;
    for &d in dims {
        if d < 1 {
            return Err(TaoError::BadRange);
        }
        count = count.checked_mul(d).ok_or(TaoError::BadRange)?;
    }
    Ok(count)
}

fn payload_offset() -> usize {
    let raw = std::mem::size_of::<ArrayHeader>();
    raw.div_ceil(SIMD_ALIGNMENT) * SIMD_ALIGNMENT
}

/// An owned handle to a mapped shared array.
pub struct SharedArray {
    inner: RwLockedObject,
}

impl SharedArray {
    /// Allocate and initialize a new shared array.
    ///
    /// `dims` must have `0..=5` entries, each `>= 1`; a zero-dimensional
    /// array has exactly one element.
    pub fn create(eltype: ElementType, dims: &[i64], flags: CreateFlags) -> TaoResult<Self> {
        if dims.len() > MAX_ARRAY_NDIMS {
            return Err(TaoError::BadRank(dims.len()));
        }
        let nelem = element_count(dims)?;
        let payload_bytes = (nelem as usize)
            .checked_mul(eltype.size())
            .ok_or(TaoError::BadRange)?;
        let total = payload_offset() + payload_bytes;

        let inner = RwLockedObject::create(total, FAMILY_SHARED_ARRAY, flags)?;

        let header = inner.base_ptr() as *mut ArrayHeader;
        unsafe {
            let mut dims_arr = [0i64; MAX_ARRAY_NDIMS];
            dims_arr[..dims.len()].copy_from_slice(dims);
            std::ptr::addr_of_mut!((*header).nelem).write(nelem);
            std::ptr::addr_of_mut!((*header).ndims).write(dims.len() as i32);
            std::ptr::addr_of_mut!((*header).dims).write(dims_arr);
            std::ptr::addr_of_mut!((*header).eltype).write(eltype.to_wire());
            std::ptr::addr_of_mut!((*header).serial).write(AtomicI64::new(0));
            std::ptr::addr_of_mut!((*header).timestamps).write([Timestamp::default(); 5]);
        }

        Ok(SharedArray { inner })
    }

    /// Attach to an existing shared array by id.
    pub fn attach(shmid: ShmId) -> TaoResult<Self> {
        let inner = RwLockedObject::attach(shmid, FAMILY_SHARED_ARRAY)?;
        Ok(SharedArray { inner })
    }

    fn header(&self) -> &ArrayHeader {
        unsafe { &*(self.inner.base_ptr() as *const ArrayHeader) }
    }

    /// The array's backing shmid.
    pub fn shmid(&self) -> ShmId {
        self.inner.shmid()
    }

    /// Element type. Immutable; may be read without locking.
    pub fn eltype(&self) -> TaoResult<ElementType> {
        ElementType::from_wire(self.header().eltype)
    }

    /// Number of dimensions. Immutable; may be read without locking.
    pub fn ndims(&self) -> usize {
        self.header().ndims as usize
    }

    /// Dimension extents. Immutable; may be read without locking.
    pub fn dims(&self) -> &[i64] {
        &self.header().dims[..self.ndims()]
    }

    /// Total element count. Immutable; may be read without locking.
    pub fn nelem(&self) -> i64 {
        self.header().nelem
    }

    /// Current serial. Should be read while holding at least the read lock.
    pub fn serial(&self) -> i64 {
        self.header().serial.load(Ordering::Acquire)
    }

    /// Set the serial. Caller must hold the write lock.
    pub fn set_serial(&self, value: i64) {
        self.header().serial.store(value, Ordering::Release);
        let mut ts = self.header().timestamps;
        ts.rotate_right(1);
        ts[0] = Timestamp::now();
        unsafe {
            std::ptr::addr_of!(self.header().timestamps)
                .cast_mut()
                .write(ts);
        }
    }

    /// The five most recent write timestamps, newest first. Caller should
    /// hold at least the read lock.
    pub fn timestamps(&self) -> [Timestamp; 5] {
        self.header().timestamps
    }

    /// Acquire the read lock.
    pub fn read_lock(&self) -> TaoResult<()> {
        self.inner.read_lock()
    }

    /// Acquire the read lock against an explicit [`Deadline`], returning
    /// `false` if it elapsed before the lock was obtained.
    pub fn deadline_read_lock(&self, deadline: Deadline) -> TaoResult<bool> {
        use tao_common::error::Status;
        Ok(self.inner.deadline_read_lock(deadline)? == Status::Ok)
    }

    /// Release the read lock.
    pub fn read_unlock(&self) -> TaoResult<()> {
        self.inner.read_unlock()
    }

    /// Acquire the write lock.
    pub fn write_lock(&self) -> TaoResult<()> {
        self.inner.write_lock()
    }

    /// Acquire the write lock against an explicit [`Deadline`], returning
    /// `false` if it elapsed before the lock was obtained.
    pub fn deadline_write_lock(&self, deadline: Deadline) -> TaoResult<bool> {
        use tao_common::error::Status;
        Ok(self.inner.deadline_write_lock(deadline)? == Status::Ok)
    }

    /// Release the write lock.
    pub fn write_unlock(&self) -> TaoResult<()> {
        self.inner.write_unlock()
    }

    /// Byte offset of the payload within the segment.
    pub fn payload_offset(&self) -> usize {
        payload_offset()
    }

    /// The element payload as raw bytes, column-major. Caller must hold at
    /// least the read lock for the duration of any read.
    pub fn data(&self) -> &[u8] {
        let eltype = self.eltype().expect("validated at create/attach");
        let len = self.nelem() as usize * eltype.size();
        unsafe {
            let ptr = self.inner.base_ptr().add(payload_offset());
            std::slice::from_raw_parts(ptr, len)
        }
    }

    /// The element payload as mutable raw bytes. Caller must hold the write
    /// lock for the duration of any write.
    pub fn data_mut(&self) -> &mut [u8] {
        let eltype = self.eltype().expect("validated at create/attach");
        let len = self.nelem() as usize * eltype.size();
        unsafe {
            let ptr = self.inner.base_ptr().add(payload_offset());
            std::slice::from_raw_parts_mut(ptr, len)
        }
    }

    /// Fill every element with `value`'s byte pattern, by writing `value`
    /// repeated `nelem` times. Caller must hold the write lock.
    pub fn fill<T: Copy>(&self, value: T) -> TaoResult<()> {
        let esize = std::mem::size_of::<T>();
        if esize != self.eltype()?.size() {
            return Err(TaoError::BadType {
                expected: 0,
                actual: 0,
            });
        }
        let nelem = self.nelem() as usize;
        let slice = unsafe {
            std::slice::from_raw_parts_mut(
                self.inner.base_ptr().add(payload_offset()) as *mut T,
                nelem,
            )
        };
        slice.fill(value);
        Ok(())
    }

    /// Column-major element offset for index `idx` (`Σ_k i_k · ∏_{j<k} dims[j]`).
    pub fn element_offset(&self, idx: &[i64]) -> TaoResult<usize> {
        let dims = self.dims();
        if idx.len() != dims.len() {
            return Err(TaoError::BadRank(idx.len()));
        }
        let mut offset: i64 = 0;
        let mut stride: i64 = 1;
        for (k, &i_k) in idx.iter().enumerate() {
            if i_k < 0 || i_k >= dims[k] {
                return Err(TaoError::BadRange);
            }
            offset += i_k * stride;
            stride *= dims[k];
        }
        Ok(offset as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_zero_dim_has_one_element() {
        let arr = SharedArray::create(ElementType::F32, &[], CreateFlags::NONE).unwrap();
        assert_eq!(arr.nelem(), 1);
        assert_eq!(arr.ndims(), 0);
    }

    #[test]
    fn create_rejects_zero_extent() {
        let result = SharedArray::create(ElementType::F32, &[4, 0, 3], CreateFlags::NONE);
        assert!(matches!(result, Err(TaoError::BadRange)));
    }

    #[test]
    fn create_rejects_too_many_dims() {
        let result = SharedArray::create(ElementType::F32, &[1, 1, 1, 1, 1, 1], CreateFlags::NONE);
        assert!(matches!(result, Err(TaoError::BadRank(6))));
    }

    #[test]
    fn column_major_offset_matches_formula() {
        let arr = SharedArray::create(ElementType::F32, &[4, 3], CreateFlags::NONE).unwrap();
        assert_eq!(arr.element_offset(&[0, 0]).unwrap(), 0);
        assert_eq!(arr.element_offset(&[1, 0]).unwrap(), 1);
        assert_eq!(arr.element_offset(&[0, 1]).unwrap(), 4);
        assert_eq!(arr.element_offset(&[3, 2]).unwrap(), 11);
    }

    #[test]
    fn fill_and_serialize_under_locks() {
        let arr = SharedArray::create(ElementType::F32, &[4, 3], CreateFlags::NONE).unwrap();
        arr.write_lock().unwrap();
        arr.fill::<f32>(2.5).unwrap();
        arr.set_serial(1);
        arr.write_unlock().unwrap();

        arr.read_lock().unwrap();
        assert_eq!(arr.serial(), 1);
        let data = arr.data();
        let floats =
            unsafe { std::slice::from_raw_parts(data.as_ptr() as *const f32, arr.nelem() as usize) };
        assert!(floats.iter().all(|&v| v == 2.5));
        arr.read_unlock().unwrap();
    }

    #[test]
    fn attach_round_trips_immutable_fields() {
        let arr = SharedArray::create(ElementType::I16, &[2, 5], CreateFlags::NONE).unwrap();
        let shmid = arr.shmid();
        let attached = SharedArray::attach(shmid).unwrap();
        assert_eq!(attached.dims(), &[2, 5]);
        assert_eq!(attached.eltype().unwrap(), ElementType::I16);
    }

    #[test]
    fn element_count_overflow_is_rejected() {
        let result = SharedArray::create(ElementType::F64, &[i64::MAX, 2], CreateFlags::NONE);
        assert!(matches!(result, Err(TaoError::BadRange)));
    }
}
