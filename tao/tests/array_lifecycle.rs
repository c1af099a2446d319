//! Cross-component lifecycle: shared array create/attach, locking, and the
//! region-copy tool between a plain buffer and a shared array.

use tao::array::SharedArray;
use tao::segment::CreateFlags;
use tao::tools::{copy_region, PlainArray};
use tao_common::error::TaoError;
use tao_common::types::ElementType;
use tao_sync::Deadline;

#[test]
fn two_handles_to_the_same_segment_see_each_others_writes() {
    let writer = SharedArray::create(ElementType::F32, &[3, 2], CreateFlags::NONE).unwrap();
    let shmid = writer.shmid();

    writer.write_lock().unwrap();
    writer.fill::<f32>(7.0).unwrap();
    writer.set_serial(1);
    writer.write_unlock().unwrap();

    let reader = SharedArray::attach(shmid).unwrap();
    reader.read_lock().unwrap();
    assert_eq!(reader.serial(), 1);
    let data = reader.data();
    let floats = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const f32, 6) };
    assert!(floats.iter().all(|&v| v == 7.0));
    reader.read_unlock().unwrap();
}

#[test]
fn copy_region_moves_subregion_from_plain_into_shared_array() {
    let mut src = PlainArray::new(ElementType::U8, vec![4, 2]);
    src.bytes_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

    let mut dst = SharedArray::create(ElementType::U8, &[4, 2], CreateFlags::NONE).unwrap();
    copy_region(
        &mut dst,
        &src,
        &[0, 0],
        &[0, 0],
        &[4, 2],
        2,
        Deadline::Blocking,
    )
    .unwrap();

    dst.read_lock().unwrap();
    assert_eq!(dst.data(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    dst.read_unlock().unwrap();
}

#[test]
fn copy_region_rejects_self_copy() {
    let mut arr = SharedArray::create(ElementType::U8, &[2, 2], CreateFlags::NONE).unwrap();
    let shmid = arr.shmid();
    let alias = SharedArray::attach(shmid).unwrap();
    let result = copy_region(
        &mut arr,
        &alias,
        &[0, 0],
        &[0, 0],
        &[2, 2],
        2,
        Deadline::Blocking,
    );
    assert!(matches!(result, Err(TaoError::AlreadyInUse)));
}
