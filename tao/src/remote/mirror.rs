//! Remote deformable mirror: inline actuator-vector ring.

use super::{Command, RemoteCore, State};
use crate::segment::{CreateFlags, ShmId};
use std::sync::atomic::Ordering;
use tao_common::consts::FAMILY_REMOTE_MIRROR;
use tao_common::error::{TaoError, TaoResult};
use tao_sync::{Deadline, Timestamp};

/// Dataframe header at the start of every ring slot.
#[repr(C)]
pub struct DataframeHeader {
    /// Serial of the frame this slot currently holds.
    pub serial: std::sync::atomic::AtomicI64,
    /// User-defined tag carried through from the triggering `send`/`reset`.
    pub mark: i64,
    /// Time the slot was published.
    pub timestamp: Timestamp,
}

/// Remote-mirror header: the remote base plus actuator geometry, command
/// bounds, and the four contiguous per-slot vectors.
#[repr(C)]
pub struct MirrorHeader {
    /// Remote-object base.
    pub base: super::RemoteHeader,
    /// Number of actuators.
    pub nacts: i64,
    /// Logical actuator grid dimensions (e.g. for a 2-D DM layout).
    pub grid_dims: [i64; 2],
    /// Minimum commandable actuator value.
    pub cmin: f64,
    /// Maximum commandable actuator value.
    pub cmax: f64,
    /// Reference vector, applied as a baseline to every `send`.
    pub reference_offset: usize,
    /// Perturbation vector, applied once then cleared.
    pub perturbation_offset: usize,
    /// Most recently requested vector, pre-clamp.
    pub requested_offset: usize,
    /// Most recently published (clamped, callback-adjusted) vector.
    pub effective_offset: usize,
    /// `mark` argument of the in-flight `send`/`reset` command, written
    /// under the base mutex alongside the requested vector and consumed by
    /// [`RemoteMirror::execute_send`].
    pub pending_mark: i64,
}

fn clamp(v: f64, lo: f64, hi: f64) -> f64 {
    v.max(lo).min(hi)
}

/// An owned handle to a remote deformable-mirror object.
pub struct RemoteMirror {
    core: RemoteCore,
    nacts: usize,
}

impl RemoteMirror {
    /// Allocate a new remote mirror with `nacts` actuators and `nbufs`
    /// inline ring slots.
    pub fn create(
        owner: &str,
        nacts: usize,
        grid_dims: [i64; 2],
        cmin: f64,
        cmax: f64,
        nbufs: usize,
        flags: CreateFlags,
    ) -> TaoResult<Self> {
        if nbufs < 2 {
            return Err(TaoError::BadArgument("nbufs must be >= 2".into()));
        }
        let header_size = std::mem::size_of::<MirrorHeader>();
        let vector_bytes = nacts * std::mem::size_of::<f64>();
        let base_vectors_offset = header_size;
        let slot_header = std::mem::size_of::<DataframeHeader>();
        let slot_payload = vector_bytes;
        let stride = (slot_header + slot_payload).next_multiple_of(tao_common::consts::CACHE_LINE_SIZE);
        let ring_offset = base_vectors_offset + 4 * vector_bytes;
        let total = ring_offset + nbufs * stride;

        let core = RemoteCore::create(
            total,
            FAMILY_REMOTE_MIRROR,
            owner,
            nbufs as i64,
            ring_offset as i64,
            stride as i64,
            flags,
        )?;

        unsafe {
            let header = core.base_ptr() as *mut MirrorHeader;
            std::ptr::addr_of_mut!((*header).nacts).write(nacts as i64);
            std::ptr::addr_of_mut!((*header).grid_dims).write(grid_dims);
            std::ptr::addr_of_mut!((*header).cmin).write(cmin);
            std::ptr::addr_of_mut!((*header).cmax).write(cmax);
            std::ptr::addr_of_mut!((*header).reference_offset).write(base_vectors_offset);
            std::ptr::addr_of_mut!((*header).perturbation_offset)
                .write(base_vectors_offset + vector_bytes);
            std::ptr::addr_of_mut!((*header).requested_offset)
                .write(base_vectors_offset + 2 * vector_bytes);
            std::ptr::addr_of_mut!((*header).effective_offset)
                .write(base_vectors_offset + 3 * vector_bytes);
            std::ptr::addr_of_mut!((*header).pending_mark).write(0);
        }

        Ok(RemoteMirror { core, nacts })
    }

    /// Attach to an existing remote mirror by id.
    pub fn attach(shmid: ShmId) -> TaoResult<Self> {
        let core = RemoteCore::attach(shmid, FAMILY_REMOTE_MIRROR)?;
        let nacts = unsafe { (*(core.base_ptr() as *const MirrorHeader)).nacts as usize };
        Ok(RemoteMirror { core, nacts })
    }

    fn header(&self) -> &MirrorHeader {
        unsafe { &*(self.core.base_ptr() as *const MirrorHeader) }
    }

    fn vector_mut(&self, offset: usize) -> &mut [f64] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.core.base_ptr().add(offset) as *mut f64,
                self.nacts,
            )
        }
    }

    /// Number of actuators.
    pub fn nacts(&self) -> usize {
        self.nacts
    }

    /// Client: update the reference vector used by subsequent `send`s.
    pub fn set_reference(&self, vals: &[f64], deadline: Deadline) -> TaoResult<i64> {
        if vals.len() != self.nacts {
            return Err(TaoError::BadRank(vals.len()));
        }
        self.core.queue_command(Command::Config, deadline, || {
            self.vector_mut(self.header().reference_offset).copy_from_slice(vals);
        })
    }

    /// Client: install a one-shot perturbation applied to the next `send`.
    pub fn set_perturbation(&self, vals: &[f64], deadline: Deadline) -> TaoResult<i64> {
        if vals.len() != self.nacts {
            return Err(TaoError::BadRank(vals.len()));
        }
        self.core.queue_command(Command::Config, deadline, || {
            self.vector_mut(self.header().perturbation_offset).copy_from_slice(vals);
        })
    }

    /// Client: request `effective = clamp(reference + perturbation + vals,
    /// cmin, cmax)`, tagged with `mark`. The perturbation is cleared
    /// as part of the command.
    pub fn send(&self, vals: &[f64], mark: i64, deadline: Deadline) -> TaoResult<i64> {
        if vals.len() != self.nacts {
            return Err(TaoError::BadRank(vals.len()));
        }
        self.core.queue_command(Command::Send, deadline, || {
            self.vector_mut(self.header().requested_offset).copy_from_slice(vals);
            unsafe {
                std::ptr::addr_of!(self.header().pending_mark)
                    .cast_mut()
                    .write(mark);
            }
        })
    }

    /// Client: `reset(mark)`, equivalent to `send` with an all-zero vector.
    pub fn reset(&self, mark: i64, deadline: Deadline) -> TaoResult<i64> {
        let zeros = vec![0.0; self.nacts];
        self.send(&zeros, mark, deadline)
    }

    /// Server: run one `on_send` cycle — compute the clamped target from
    /// the currently staged reference/perturbation/requested vectors,
    /// let `on_send` further restrict it, publish into the next ring slot
    /// tagged with the pending `send`/`reset`'s `mark`, and clear the
    /// perturbation.
    pub fn execute_send(&self, on_send: impl FnOnce(&mut [f64])) -> i64 {
        let header = self.header();
        let mark = header.pending_mark;
        let reference = self.vector_mut(header.reference_offset).to_vec();
        let perturbation = self.vector_mut(header.perturbation_offset).to_vec();
        let requested = self.vector_mut(header.requested_offset).to_vec();

        let mut effective: Vec<f64> = (0..self.nacts)
            .map(|i| clamp(reference[i] + perturbation[i] + requested[i], header.cmin, header.cmax))
            .collect();
        on_send(&mut effective);

        self.vector_mut(header.effective_offset).copy_from_slice(&effective);
        self.vector_mut(header.perturbation_offset).fill(0.0);

        let nbufs = self.core.header().nbufs;
        let serial = self.core.header().serial() + 1;
        let idx = ((serial - 1).rem_euclid(nbufs)) as usize;
        let slot_ptr = unsafe {
            self.core
                .base_ptr()
                .add((self.core.header().offset + idx as i64 * self.core.header().stride) as usize)
                as *mut DataframeHeader
        };
        unsafe {
            std::ptr::addr_of_mut!((*slot_ptr).mark).write(mark);
            std::ptr::addr_of_mut!((*slot_ptr).timestamp).write(Timestamp::now());
            (*slot_ptr).serial.store(serial, Ordering::Release);
            let payload_ptr = (slot_ptr as *mut u8).add(std::mem::size_of::<DataframeHeader>()) as *mut f64;
            std::slice::from_raw_parts_mut(payload_ptr, self.nacts).copy_from_slice(&effective);
        }
        self.core.publish()
    }

    /// Client: queue a `start` command.
    pub fn start(&self, deadline: Deadline) -> TaoResult<i64> {
        self.core.queue_command(Command::Start, deadline, || {})
    }

    /// Client: queue a `stop` command.
    pub fn stop(&self, deadline: Deadline) -> TaoResult<i64> {
        self.core.queue_command(Command::Stop, deadline, || {})
    }

    /// Client: queue a `kill` command.
    pub fn kill(&self, deadline: Deadline) -> TaoResult<i64> {
        self.core.queue_command(Command::Kill, deadline, || {})
    }

    /// Wait for the server to have processed command `expected`.
    pub fn wait_command(&self, expected: i64, deadline: Deadline) -> TaoResult<()> {
        self.core.wait_command(expected, deadline)
    }

    /// Wait for output frame `s_req` (`0` for "next").
    pub fn wait_output(&self, s_req: i64, deadline: Deadline) -> i64 {
        self.core.wait_output(s_req, deadline)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.core.header().state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_attach_shares_nacts() {
        let mirror =
            RemoteMirror::create("dm0", 8, [2, 4], -1.0, 1.0, 2, CreateFlags::NONE).unwrap();
        let shmid = mirror.core.shmid();
        let attached = RemoteMirror::attach(shmid).unwrap();
        assert_eq!(attached.nacts(), 8);
    }

    #[test]
    fn execute_send_clamps_to_bounds() {
        let mirror =
            RemoteMirror::create("dm0", 2, [1, 2], -1.0, 1.0, 2, CreateFlags::NONE).unwrap();
        mirror
            .vector_mut(mirror.header().requested_offset)
            .copy_from_slice(&[5.0, -5.0]);
        let s = mirror.execute_send(|_| {});
        assert_eq!(s, 1);
        let effective = mirror.vector_mut(mirror.header().effective_offset).to_vec();
        assert_eq!(effective, vec![1.0, -1.0]);
    }

    #[test]
    fn set_reference_rejects_wrong_length() {
        let mirror =
            RemoteMirror::create("dm0", 4, [2, 2], -1.0, 1.0, 2, CreateFlags::NONE).unwrap();
        let result = mirror.set_reference(&[1.0, 2.0], Deadline::NoWait);
        assert!(matches!(result, Err(TaoError::BadRank(2))));
    }
}
