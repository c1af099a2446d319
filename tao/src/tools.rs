//! Array tools (component J): rectangular region copy between any
//! two array kinds (plain in-process or shared), with element-type
//! conversion.

use crate::array::SharedArray;
use tao_common::error::{TaoError, TaoResult};
use tao_common::types::ElementType;
use tao_sync::Deadline;

/// A rectangular array a region copy can read from.
pub trait RegionSource {
    /// Dimension extents.
    fn dims(&self) -> Vec<i64>;
    /// Element type.
    fn eltype(&self) -> ElementType;
    /// Acquire whatever lock this kind requires for reading.
    fn lock_read(&self, deadline: Deadline) -> TaoResult<()>;
    /// Release the read lock.
    fn unlock_read(&self);
    /// Raw element bytes, column-major.
    fn data(&self) -> &[u8];
    /// An identity distinguishing this array from others of the same kind,
    /// used to reject `source == destination`.
    fn identity(&self) -> usize;
}

/// A rectangular array a region copy can write to.
pub trait RegionDest {
    /// Dimension extents.
    fn dims(&self) -> Vec<i64>;
    /// Element type.
    fn eltype(&self) -> ElementType;
    /// Acquire whatever lock this kind requires for writing.
    fn lock_write(&self, deadline: Deadline) -> TaoResult<()>;
    /// Release the write lock.
    fn unlock_write(&self);
    /// Raw element bytes, column-major.
    fn data_mut(&mut self) -> &mut [u8];
    /// An identity distinguishing this array from others of the same kind,
    /// used to reject `source == destination`.
    fn identity(&self) -> usize;
}

/// A plain, process-local array with no lock of its own.
pub struct PlainArray {
    dims: Vec<i64>,
    eltype: ElementType,
    bytes: Vec<u8>,
}

impl PlainArray {
    /// Construct a zero-filled plain array.
    pub fn new(eltype: ElementType, dims: Vec<i64>) -> Self {
        let nelem: i64 = dims.iter().product::<i64>().max(1);
        let bytes = vec![0u8; nelem as usize * eltype.size()];
        PlainArray { dims, eltype, bytes }
    }

    /// Raw bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Raw bytes, mutable.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl RegionSource for PlainArray {
    fn dims(&self) -> Vec<i64> {
        self.dims.clone()
    }
    fn eltype(&self) -> ElementType {
        self.eltype
    }
    fn lock_read(&self, _deadline: Deadline) -> TaoResult<()> {
        Ok(())
    }
    fn unlock_read(&self) {}
    fn data(&self) -> &[u8] {
        &self.bytes
    }
    fn identity(&self) -> usize {
        self.bytes.as_ptr() as usize
    }
}

impl RegionDest for PlainArray {
    fn dims(&self) -> Vec<i64> {
        self.dims.clone()
    }
    fn eltype(&self) -> ElementType {
        self.eltype
    }
    fn lock_write(&self, _deadline: Deadline) -> TaoResult<()> {
        Ok(())
    }
    fn unlock_write(&self) {}
    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
    fn identity(&self) -> usize {
        self.bytes.as_ptr() as usize
    }
}

impl RegionSource for SharedArray {
    fn dims(&self) -> Vec<i64> {
        SharedArray::dims(self).to_vec()
    }
    fn eltype(&self) -> ElementType {
        SharedArray::eltype(self).expect("validated at create/attach")
    }
    fn lock_read(&self, deadline: Deadline) -> TaoResult<()> {
        if SharedArray::deadline_read_lock(self, deadline)? {
            Ok(())
        } else {
            Err(TaoError::Timeout("copy_region: source read lock".into()))
        }
    }
    fn unlock_read(&self) {
        let _ = self.read_unlock();
    }
    fn data(&self) -> &[u8] {
        SharedArray::data(self)
    }
    fn identity(&self) -> usize {
        self.shmid() as usize
    }
}

impl RegionDest for SharedArray {
    fn dims(&self) -> Vec<i64> {
        SharedArray::dims(self).to_vec()
    }
    fn eltype(&self) -> ElementType {
        SharedArray::eltype(self).expect("validated at create/attach")
    }
    fn lock_write(&self, deadline: Deadline) -> TaoResult<()> {
        if SharedArray::deadline_write_lock(self, deadline)? {
            Ok(())
        } else {
            Err(TaoError::Timeout("copy_region: destination write lock".into()))
        }
    }
    fn unlock_write(&self) {
        let _ = self.write_unlock();
    }
    fn data_mut(&mut self) -> &mut [u8] {
        SharedArray::data_mut(self)
    }
    fn identity(&self) -> usize {
        self.shmid() as usize
    }
}

fn column_major_offset(dims: &[i64], idx: &[i64]) -> i64 {
    let mut offset = 0i64;
    let mut stride = 1i64;
    for (k, &i_k) in idx.iter().enumerate() {
        offset += i_k * stride;
        stride *= dims[k];
    }
    offset
}

fn read_element_as_f64(data: &[u8], eltype: ElementType, idx: usize) -> f64 {
    let esize = eltype.size();
    let bytes = &data[idx * esize..(idx + 1) * esize];
    match eltype {
        ElementType::I8 => bytes[0] as i8 as f64,
        ElementType::U8 => bytes[0] as f64,
        ElementType::I16 => i16::from_ne_bytes(bytes.try_into().unwrap()) as f64,
        ElementType::U16 => u16::from_ne_bytes(bytes.try_into().unwrap()) as f64,
        ElementType::I32 => i32::from_ne_bytes(bytes.try_into().unwrap()) as f64,
        ElementType::U32 => u32::from_ne_bytes(bytes.try_into().unwrap()) as f64,
        ElementType::I64 => i64::from_ne_bytes(bytes.try_into().unwrap()) as f64,
        ElementType::U64 => u64::from_ne_bytes(bytes.try_into().unwrap()) as f64,
        ElementType::F32 => f32::from_ne_bytes(bytes.try_into().unwrap()) as f64,
        ElementType::F64 => f64::from_ne_bytes(bytes.try_into().unwrap()),
    }
}

fn write_element_from_f64(data: &mut [u8], eltype: ElementType, idx: usize, value: f64) {
    let esize = eltype.size();
    let bytes = &mut data[idx * esize..(idx + 1) * esize];
    match eltype {
        ElementType::I8 => bytes[0] = value as i8 as u8,
        ElementType::U8 => bytes[0] = value as u8,
        ElementType::I16 => bytes.copy_from_slice(&(value as i16).to_ne_bytes()),
        ElementType::U16 => bytes.copy_from_slice(&(value as u16).to_ne_bytes()),
        ElementType::I32 => bytes.copy_from_slice(&(value as i32).to_ne_bytes()),
        ElementType::U32 => bytes.copy_from_slice(&(value as u32).to_ne_bytes()),
        ElementType::I64 => bytes.copy_from_slice(&(value as i64).to_ne_bytes()),
        ElementType::U64 => bytes.copy_from_slice(&(value as u64).to_ne_bytes()),
        ElementType::F32 => bytes.copy_from_slice(&(value as f32).to_ne_bytes()),
        ElementType::F64 => bytes.copy_from_slice(&value.to_ne_bytes()),
    }
}

/// Copy a rectangular region from `src` to `dst`, converting element-wise
/// when their element types differ.
///
/// Lock ordering is always source-before-destination; if `src` and `dst`
/// are the same underlying array, this is rejected as `ALREADY_IN_USE`
/// before any lock is taken, to avoid self-deadlock. `deadline` is applied
/// to both the source read lock and the destination write lock.
pub fn copy_region(
    dst: &mut dyn RegionDest,
    src: &dyn RegionSource,
    dstoffs: &[i64],
    srcoffs: &[i64],
    lens: &[i64],
    ndims: usize,
    deadline: Deadline,
) -> TaoResult<()> {
    if dst.identity() == src.identity() {
        return Err(TaoError::AlreadyInUse);
    }
    if dstoffs.len() != ndims || srcoffs.len() != ndims || lens.len() != ndims {
        return Err(TaoError::BadRank(ndims));
    }
    if lens.iter().any(|&l| l < 0) {
        return Err(TaoError::BadRange);
    }

    let src_dims = src.dims();
    let dst_dims = dst.dims();
    if src_dims.len() != ndims || dst_dims.len() != ndims {
        return Err(TaoError::BadRank(ndims));
    }
    for k in 0..ndims {
        if srcoffs[k] + lens[k] > src_dims[k] || dstoffs[k] + lens[k] > dst_dims[k] {
            return Err(TaoError::BadRange);
        }
    }

    src.lock_read(deadline)?;
    let result = (|| {
        dst.lock_write(deadline)?;
        let src_eltype = src.eltype();
        let dst_eltype = dst.eltype();
        let total: i64 = lens.iter().product::<i64>().max(1);

        for linear in 0..total {
            let mut idx = vec![0i64; ndims];
            let mut rem = linear;
            for k in 0..ndims {
                if lens[k] == 0 {
                    idx[k] = 0;
                    continue;
                }
                idx[k] = rem % lens[k];
                rem /= lens[k];
            }

            let src_idx: Vec<i64> = (0..ndims).map(|k| srcoffs[k] + idx[k]).collect();
            let dst_idx: Vec<i64> = (0..ndims).map(|k| dstoffs[k] + idx[k]).collect();
            let src_off = column_major_offset(&src_dims, &src_idx) as usize;
            let dst_off = column_major_offset(&dst_dims, &dst_idx) as usize;

            let value = read_element_as_f64(src.data(), src_eltype, src_off);
            write_element_from_f64(dst.data_mut(), dst_eltype, dst_off, value);
        }

        dst.unlock_write();
        Ok(())
    })();
    src.unlock_read();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_region_converts_element_types() {
        let src = PlainArray::new(ElementType::U8, vec![4, 3]);
        let mut dst = PlainArray::new(ElementType::F32, vec![4, 3]);
        copy_region(
            &mut dst,
            &src,
            &[0, 0],
            &[0, 0],
            &[4, 3],
            2,
            Deadline::Blocking,
        )
        .unwrap();
        let floats = unsafe {
            std::slice::from_raw_parts(dst.bytes().as_ptr() as *const f32, 12)
        };
        assert!(floats.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn copy_region_rejects_out_of_bounds() {
        let src = PlainArray::new(ElementType::U8, vec![4, 3]);
        let mut dst = PlainArray::new(ElementType::U8, vec![4, 3]);
        let result = copy_region(
            &mut dst,
            &src,
            &[0, 0],
            &[0, 0],
            &[5, 3],
            2,
            Deadline::Blocking,
        );
        assert!(matches!(result, Err(TaoError::BadRange)));
    }

    #[test]
    fn copy_region_rejects_negative_lens() {
        let src = PlainArray::new(ElementType::U8, vec![4, 3]);
        let mut dst = PlainArray::new(ElementType::U8, vec![4, 3]);
        let result = copy_region(
            &mut dst,
            &src,
            &[0, 0],
            &[0, 0],
            &[-1, 3],
            2,
            Deadline::Blocking,
        );
        assert!(matches!(result, Err(TaoError::BadRange)));
    }

    #[test]
    fn copy_region_preserves_subregion_values() {
        let mut src = PlainArray::new(ElementType::U8, vec![3, 1]);
        src.bytes[0] = 5;
        src.bytes[1] = 9;
        src.bytes[2] = 13;
        let mut dst = PlainArray::new(ElementType::U8, vec![3, 1]);
        copy_region(
            &mut dst,
            &src,
            &[0, 0],
            &[1, 0],
            &[2, 1],
            2,
            Deadline::Blocking,
        )
        .unwrap();
        assert_eq!(dst.bytes()[0], 9);
        assert_eq!(dst.bytes()[1], 13);
    }

    #[test]
    fn copy_region_honors_nowait_deadline_on_locked_destination() {
        use crate::segment::CreateFlags;
        use crate::array::SharedArray;

        let src = PlainArray::new(ElementType::U8, vec![2, 2]);
        let mut dst = SharedArray::create(ElementType::U8, &[2, 2], CreateFlags::NONE).unwrap();
        dst.write_lock().unwrap();

        let result = copy_region(
            &mut dst,
            &src,
            &[0, 0],
            &[0, 0],
            &[2, 2],
            2,
            Deadline::NoWait,
        );
        assert!(matches!(result, Err(TaoError::Timeout(_))));

        dst.write_unlock().unwrap();
    }
}
