//! Remote camera: a remote object whose output ring holds external shared
//! arrays rather than inline slots.

use super::{Command, RemoteCore, State};
use crate::segment::{CreateFlags, ShmId};
use std::sync::atomic::{AtomicI32, Ordering};
use tao_common::consts::{FAMILY_REMOTE_CAMERA, MAX_ATTR_KEY, MAX_ATTR_STRING, MAX_CONFIG_ATTRS};
use tao_common::error::{TaoError, TaoResult};
use tao_common::types::ElementType;
use tao_sync::Deadline;

/// Preprocessing level applied by the pixel engine before publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PreprocessingLevel {
    /// No correction; raw conversion only.
    None = 0,
    /// `dat = (raw - b) * a`.
    Affine = 1,
    /// Affine plus `wgt = q / (max(dat, 0) + r)`.
    AffineWeights = 2,
}

/// A single key/value configuration attribute.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ConfigAttr {
    /// Attribute name, NUL-padded.
    pub key: [u8; MAX_ATTR_KEY],
    /// Whether the attribute may be read.
    pub readable: bool,
    /// Whether the attribute may be written by `configure`.
    pub writable: bool,
    /// Whether the attribute may change between frames without a full
    /// reconfigure (vs. requiring the acquisition to be stopped).
    pub variable: bool,
    /// Numeric value, when the attribute is not a string.
    pub numeric: f64,
    /// String value, NUL-padded, used when the attribute is textual.
    pub string_value: [u8; MAX_ATTR_STRING],
}

impl ConfigAttr {
    const fn empty() -> Self {
        ConfigAttr {
            key: [0; MAX_ATTR_KEY],
            readable: false,
            writable: false,
            variable: false,
            numeric: 0.0,
            string_value: [0; MAX_ATTR_STRING],
        }
    }

    /// The attribute's key as a `&str`.
    pub fn key(&self) -> &str {
        let end = self.key.iter().position(|&b| b == 0).unwrap_or(self.key.len());
        std::str::from_utf8(&self.key[..end]).unwrap_or("")
    }
}

/// Region of interest, in sensor pixel coordinates.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Roi {
    /// Horizontal binning factor.
    pub xbin: i32,
    /// Vertical binning factor.
    pub ybin: i32,
    /// Horizontal offset of the ROI within the sensor.
    pub xoffset: i32,
    /// Vertical offset of the ROI within the sensor.
    pub yoffset: i32,
    /// ROI width after binning.
    pub width: i32,
    /// ROI height after binning.
    pub height: i32,
}

/// Camera configuration record.
#[repr(C)]
pub struct CameraConfig {
    /// Full sensor width in pixels. Immutable.
    pub sensor_width: i32,
    /// Full sensor height in pixels. Immutable.
    pub sensor_height: i32,
    /// Active region of interest.
    pub roi: Roi,
    /// Target frame rate in Hz.
    pub frame_rate: f64,
    /// Exposure time in seconds.
    pub exposure_s: f64,
    /// Number of acquisition buffers the driver should use internally.
    pub nbufs: i32,
    /// Element type of the processed (post-pixel-engine) payload.
    pub processed_type: i32,
    /// Raw sensor pixel encoding.
    pub sensor_encoding: u32,
    /// Buffer (driver-delivered) pixel encoding.
    pub buffer_encoding: u32,
    /// Preprocessing level applied before publication.
    pub preprocessing: i32,
    /// Number of valid entries in `attrs`.
    pub nattrs: i32,
    /// Key/value attribute table.
    pub attrs: [ConfigAttr; MAX_CONFIG_ATTRS],
}

impl CameraConfig {
    fn zeroed() -> Self {
        CameraConfig {
            sensor_width: 0,
            sensor_height: 0,
            roi: Roi::default(),
            frame_rate: 0.0,
            exposure_s: 0.0,
            nbufs: 0,
            processed_type: ElementType::U16.to_wire(),
            sensor_encoding: 0,
            buffer_encoding: 0,
            preprocessing: PreprocessingLevel::None as i32,
            nattrs: 0,
            attrs: [ConfigAttr::empty(); MAX_CONFIG_ATTRS],
        }
    }

    /// Validate the ROI against sensor bounds and reject attribute writes
    /// targeting read-only keys.
    pub fn validate(&self, readonly_keys: &[&str]) -> TaoResult<()> {
        if self.roi.xoffset < 0
            || self.roi.yoffset < 0
            || self.roi.width <= 0
            || self.roi.height <= 0
            || self.roi.xoffset + self.roi.width > self.sensor_width
            || self.roi.yoffset + self.roi.height > self.sensor_height
        {
            return Err(TaoError::ForbiddenChange("roi out of sensor bounds".into()));
        }
        for attr in &self.attrs[..self.nattrs as usize] {
            if readonly_keys.contains(&attr.key()) && attr.writable {
                return Err(TaoError::ForbiddenChange(format!(
                    "attribute {} is read-only",
                    attr.key()
                )));
            }
        }
        Ok(())
    }

    fn preprocessing_level(&self) -> PreprocessingLevel {
        match self.preprocessing {
            1 => PreprocessingLevel::Affine,
            2 => PreprocessingLevel::AffineWeights,
            _ => PreprocessingLevel::None,
        }
    }
}

/// Remote-camera header: the remote base plus an active and staged
/// [`CameraConfig`] and the four optional preprocessing-array shmids.
#[repr(C)]
pub struct CameraHeader {
    /// Remote-object base.
    pub base: super::RemoteHeader,
    /// Currently active configuration.
    pub active: CameraConfig,
    /// Staged configuration written by a pending `configure`.
    pub staged: CameraConfig,
    /// Linear-factor correction array shmid, or `SHMID_NONE`.
    pub shmid_a: AtomicI32,
    /// Bias correction array shmid, or `SHMID_NONE`.
    pub shmid_b: AtomicI32,
    /// Weight-numerator array shmid, or `SHMID_NONE`.
    pub shmid_q: AtomicI32,
    /// Weight-denominator-offset array shmid, or `SHMID_NONE`.
    pub shmid_r: AtomicI32,
    // Ring of external shared-array shmids, one per output slot, follows
    // immediately after this header; accessed via `ring_ptr`, not a field,
    // since its length is only known at runtime (`nbufs`).
}

/// An owned handle to a remote camera object.
pub struct RemoteCamera {
    core: RemoteCore,
    nbufs: usize,
}

impl RemoteCamera {
    /// Allocate a new remote camera with `nbufs` ring slots.
    pub fn create(owner: &str, nbufs: usize, flags: CreateFlags) -> TaoResult<Self> {
        if nbufs < 2 {
            return Err(TaoError::BadArgument("nbufs must be >= 2".into()));
        }
        let header_size = std::mem::size_of::<CameraHeader>();
        let ring_bytes = nbufs * std::mem::size_of::<i32>();
        let total = header_size + ring_bytes;

        let core = RemoteCore::create(
            total,
            FAMILY_REMOTE_CAMERA,
            owner,
            nbufs as i64,
            header_size as i64,
            std::mem::size_of::<i32>() as i64,
            flags,
        )?;

        unsafe {
            let header = core.base_ptr() as *mut CameraHeader;
            std::ptr::addr_of_mut!((*header).active).write(CameraConfig::zeroed());
            std::ptr::addr_of_mut!((*header).staged).write(CameraConfig::zeroed());
            std::ptr::addr_of_mut!((*header).shmid_a)
                .write(AtomicI32::new(tao_common::consts::SHMID_NONE));
            std::ptr::addr_of_mut!((*header).shmid_b)
                .write(AtomicI32::new(tao_common::consts::SHMID_NONE));
            std::ptr::addr_of_mut!((*header).shmid_q)
                .write(AtomicI32::new(tao_common::consts::SHMID_NONE));
            std::ptr::addr_of_mut!((*header).shmid_r)
                .write(AtomicI32::new(tao_common::consts::SHMID_NONE));
            let ring_ptr = (header as *mut u8).add(header_size) as *mut AtomicI32;
            for i in 0..nbufs {
                ring_ptr.add(i).write(AtomicI32::new(tao_common::consts::SHMID_NONE));
            }
        }

        Ok(RemoteCamera { core, nbufs })
    }

    /// Attach to an existing remote camera by id.
    pub fn attach(shmid: ShmId) -> TaoResult<Self> {
        let core = RemoteCore::attach(shmid, FAMILY_REMOTE_CAMERA)?;
        let nbufs = core.header().nbufs as usize;
        Ok(RemoteCamera { core, nbufs })
    }

    fn header(&self) -> &CameraHeader {
        unsafe { &*(self.core.base_ptr() as *const CameraHeader) }
    }

    fn ring_ptr(&self) -> *const AtomicI32 {
        let header_size = std::mem::size_of::<CameraHeader>();
        unsafe { self.core.base_ptr().add(header_size) as *const AtomicI32 }
    }

    /// Returns the shmid of ring slot `((serial - 1) mod nbufs)`, or
    /// `SHMID_NONE` if that slot has never been published.
    pub fn get_image_shmid(&self, serial: i64) -> i32 {
        if serial < 1 {
            return tao_common::consts::SHMID_NONE;
        }
        let idx = ((serial - 1).rem_euclid(self.nbufs as i64)) as usize;
        unsafe { (*self.ring_ptr().add(idx)).load(Ordering::Acquire) }
    }

    /// Publish shmid `shmid` into the ring slot for the next serial and
    /// bump `remote.serial`.
    pub fn publish_image(&self, shmid: ShmId) -> i64 {
        let serial = self.header().base.serial() + 1;
        let idx = ((serial - 1).rem_euclid(self.nbufs as i64)) as usize;
        unsafe {
            (*self.ring_ptr().add(idx)).store(shmid, Ordering::Release);
        }
        self.core.publish()
    }

    /// Which correction arrays (`a`, `b`, `q`, `r` at indices `0..4`) the
    /// active preprocessing level requires.
    pub fn get_preprocessing_shmid(&self, i: u8) -> i32 {
        let level = self.header().active.preprocessing_level();
        let needed = match level {
            PreprocessingLevel::None => 0,
            PreprocessingLevel::Affine => 2,
            PreprocessingLevel::AffineWeights => 4,
        };
        if i as usize >= needed {
            return tao_common::consts::SHMID_NONE;
        }
        match i {
            0 => self.header().shmid_a.load(Ordering::Acquire),
            1 => self.header().shmid_b.load(Ordering::Acquire),
            2 => self.header().shmid_q.load(Ordering::Acquire),
            _ => self.header().shmid_r.load(Ordering::Acquire),
        }
    }

    /// Client: queue a `configure` command with a new config, validating
    /// it against sensor bounds and read-only attributes first.
    pub fn configure(
        &self,
        config: CameraConfig,
        readonly_keys: &[&str],
        deadline: Deadline,
    ) -> TaoResult<i64> {
        if let Err(e) = config.validate(readonly_keys) {
            self.core.set_state(State::Error);
            return Err(e);
        }
        self.core.queue_command(Command::Config, deadline, || unsafe {
            let header = self.core.base_ptr() as *mut CameraHeader;
            std::ptr::addr_of_mut!((*header).staged).write(config);
        })
    }

    /// Client: queue a `start` command.
    pub fn start(&self, deadline: Deadline) -> TaoResult<i64> {
        self.core.queue_command(Command::Start, deadline, || {})
    }

    /// Client: queue a `stop` command.
    pub fn stop(&self, deadline: Deadline) -> TaoResult<i64> {
        self.core.queue_command(Command::Stop, deadline, || {})
    }

    /// Client: queue an `abort` command.
    pub fn abort(&self, deadline: Deadline) -> TaoResult<i64> {
        self.core.queue_command(Command::Abort, deadline, || {})
    }

    /// Client: queue a `reset` command.
    pub fn reset(&self, deadline: Deadline) -> TaoResult<i64> {
        self.core.queue_command(Command::Reset, deadline, || {})
    }

    /// Client: queue a `kill` command.
    pub fn kill(&self, deadline: Deadline) -> TaoResult<i64> {
        self.core.queue_command(Command::Kill, deadline, || {})
    }

    /// Wait for the server to have processed command `expected`.
    pub fn wait_command(&self, expected: i64, deadline: Deadline) -> TaoResult<()> {
        self.core.wait_command(expected, deadline)
    }

    /// Wait for output frame `s_req` (`0` for "next"). Returns the target
    /// serial, or one of the negative sentinels.
    pub fn wait_output(&self, s_req: i64, deadline: Deadline) -> i64 {
        self.core.wait_output(s_req, deadline)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.core.header().state()
    }

    /// Whether the owning process appears to still be alive.
    pub fn is_alive(&self) -> bool {
        self.core.header().is_alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_attach_shares_nbufs() {
        let cam = RemoteCamera::create("acq0", 4, CreateFlags::NONE).unwrap();
        let shmid = cam.core.shmid();
        let attached = RemoteCamera::attach(shmid).unwrap();
        assert_eq!(attached.nbufs, 4);
    }

    #[test]
    fn image_shmid_defaults_to_none() {
        let cam = RemoteCamera::create("acq0", 4, CreateFlags::NONE).unwrap();
        assert_eq!(cam.get_image_shmid(1), tao_common::consts::SHMID_NONE);
    }

    #[test]
    fn publish_image_updates_ring_and_serial() {
        let cam = RemoteCamera::create("acq0", 2, CreateFlags::NONE).unwrap();
        let s = cam.publish_image(77);
        assert_eq!(s, 1);
        assert_eq!(cam.get_image_shmid(1), 77);
    }

    #[test]
    fn preprocessing_shmid_respects_level() {
        let cam = RemoteCamera::create("acq0", 2, CreateFlags::NONE).unwrap();
        for i in 0..4 {
            assert_eq!(cam.get_preprocessing_shmid(i), tao_common::consts::SHMID_NONE);
        }
    }

    #[test]
    fn configure_rejects_out_of_bounds_roi() {
        let cam = RemoteCamera::create("acq0", 2, CreateFlags::NONE).unwrap();
        let mut cfg = CameraConfig::zeroed();
        cfg.sensor_width = 640;
        cfg.sensor_height = 480;
        cfg.roi = Roi {
            xbin: 1,
            ybin: 1,
            xoffset: 600,
            yoffset: 0,
            width: 100,
            height: 100,
        };
        let result = cam.configure(cfg, &[], Deadline::NoWait);
        assert!(matches!(result, Err(TaoError::ForbiddenChange(_))));
        assert_eq!(cam.state(), State::Error);
    }
}
