//! Remote wavefront sensor: Shack-Hartmann sub-image grid.

use super::{Command, RemoteCore, State};
use crate::segment::{CreateFlags, ShmId};
use std::sync::atomic::Ordering;
use tao_common::consts::{FAMILY_REMOTE_SENSOR, OWNER_NAME_MAX};
use tao_common::error::{TaoError, TaoResult};
use tao_sync::{Deadline, Timestamp};

/// One sub-image's placement and pixel descriptor within the sensor's grid.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SubImageDescriptor {
    /// Horizontal pixel offset of the sub-image within the full frame.
    pub x: i32,
    /// Vertical pixel offset of the sub-image within the full frame.
    pub y: i32,
    /// Sub-image width in pixels.
    pub width: i32,
    /// Sub-image height in pixels.
    pub height: i32,
    /// Flux threshold below which the sub-image is treated as unilluminated.
    pub flux_threshold: f64,
}

/// Fixed scalar portion of a Shack-Hartmann sensor configuration, embedded
/// directly in the segment. The flexible layout grid and sub-image table
/// live in a trailing region reached through `offset_to_trailing`, the same
/// "header record with an offset to a trailing region" pattern used for
/// every other variable-length table in this hierarchy.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SensorConfigHeader {
    /// Owner name of the camera this sensor reads frames from.
    pub camera_owner: [u8; OWNER_NAME_MAX],
    /// shmid of the camera this sensor is currently attached to.
    pub camera_shmid: i32,
    /// Camera frame dimensions this configuration was computed for.
    pub camera_dims: [i64; 2],
    /// Sub-aperture pitch in pixels.
    pub pitch: f64,
    /// Centroiding threshold, as a fraction of peak flux.
    pub centroid_threshold: f64,
    /// Number of valid entries in the trailing `subs` table.
    pub nsubs: i32,
    /// Byte offset, from the start of the segment, to this config's
    /// trailing `[i32; layout_capacity]` then `[SubImageDescriptor;
    /// nsubs_capacity]` region. Fixed at creation; identical for every
    /// write to this slot (`active` or `staged`).
    pub offset_to_trailing: i64,
}

impl SensorConfigHeader {
    fn zeroed(offset_to_trailing: i64) -> Self {
        SensorConfigHeader {
            camera_owner: [0; OWNER_NAME_MAX],
            camera_shmid: tao_common::consts::SHMID_NONE,
            camera_dims: [0, 0],
            pitch: 0.0,
            centroid_threshold: 0.0,
            nsubs: 0,
            offset_to_trailing,
        }
    }
}

/// A sensor configuration as the client constructs and submits it. Mirrors
/// [`SensorConfigHeader`]'s scalar fields plus the flexible tables that
/// `configure` copies into the segment's trailing region.
#[derive(Debug, Clone)]
pub struct SensorConfig {
    /// Owner name of the camera this sensor reads frames from.
    pub camera_owner: [u8; OWNER_NAME_MAX],
    /// shmid of the camera this sensor is currently attached to.
    pub camera_shmid: i32,
    /// Camera frame dimensions this configuration was computed for.
    pub camera_dims: [i64; 2],
    /// Sub-aperture pitch in pixels.
    pub pitch: f64,
    /// Centroiding threshold, as a fraction of peak flux.
    pub centroid_threshold: f64,
    /// Flexible grid of sub-image indices, row-major, `-1` for unused
    /// cells; must not exceed the sensor's `layout_capacity`.
    pub layout: Vec<i32>,
    /// Per-sub-image descriptors; must not exceed the sensor's
    /// `nsubs_capacity`.
    pub subs: Vec<SubImageDescriptor>,
}

impl SensorConfig {
    /// An empty configuration with no camera attached and no sub-images.
    pub fn empty() -> Self {
        SensorConfig {
            camera_owner: [0; OWNER_NAME_MAX],
            camera_shmid: tao_common::consts::SHMID_NONE,
            camera_dims: [0, 0],
            pitch: 0.0,
            centroid_threshold: 0.0,
            layout: Vec::new(),
            subs: Vec::new(),
        }
    }
}

/// A read-only view of an in-segment [`SensorConfigHeader`] and its
/// trailing tables, handed to [`RemoteSensor::with_active_config`]'s
/// closure while the base mutex is held.
pub struct SensorConfigView<'a> {
    header: &'a SensorConfigHeader,
    layout: &'a [i32],
    subs: &'a [SubImageDescriptor],
}

impl<'a> SensorConfigView<'a> {
    /// shmid of the camera this sensor is currently attached to.
    pub fn camera_shmid(&self) -> i32 {
        self.header.camera_shmid
    }
    /// Camera frame dimensions this configuration was computed for.
    pub fn camera_dims(&self) -> [i64; 2] {
        self.header.camera_dims
    }
    /// Sub-aperture pitch in pixels.
    pub fn pitch(&self) -> f64 {
        self.header.pitch
    }
    /// Centroiding threshold, as a fraction of peak flux.
    pub fn centroid_threshold(&self) -> f64 {
        self.header.centroid_threshold
    }
    /// Number of valid entries in `subs`.
    pub fn nsubs(&self) -> usize {
        self.header.nsubs as usize
    }
    /// The full layout grid, including unused (`-1`) cells up to capacity.
    pub fn layout(&self) -> &[i32] {
        self.layout
    }
    /// The valid prefix of the sub-image table, length [`Self::nsubs`].
    pub fn subs(&self) -> &[SubImageDescriptor] {
        &self.subs[..self.nsubs()]
    }
}

/// A single Shack-Hartmann sub-image measurement, written into the ring by
/// the server after each acquisition.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ShMeasurement {
    /// Centroid x displacement from the reference position, in pixels.
    pub dx: f64,
    /// Centroid y displacement from the reference position, in pixels.
    pub dy: f64,
    /// Total flux measured in the sub-image.
    pub flux: f64,
    /// Whether flux exceeded the configured threshold.
    pub valid: bool,
}

/// Dataframe header at the start of every ring slot (shared with mirror
/// ring slots).
#[repr(C)]
pub struct DataframeHeader {
    /// Serial of the frame this slot currently holds.
    pub serial: std::sync::atomic::AtomicI64,
    /// User-defined tag.
    pub mark: i64,
    /// Time the slot was published.
    pub timestamp: Timestamp,
}

/// Remote-sensor header: the remote base plus an active and staged
/// [`SensorConfigHeader`]. Each carries its own fixed trailing region
/// (`layout_capacity` i32s then `nsubs_capacity` [`SubImageDescriptor`]s),
/// sized once at creation; the output ring follows immediately after both.
#[repr(C)]
pub struct SensorHeader {
    /// Remote-object base.
    pub base: super::RemoteHeader,
    /// Currently active configuration.
    pub active: SensorConfigHeader,
    /// Configuration staged by a pending `configure`, applied atomically
    /// when the command completes.
    pub staged: SensorConfigHeader,
}

/// An owned handle to a remote wavefront-sensor object.
///
/// The ring (dataframe header + `nsubs_capacity` measurements per slot)
/// and the active/staged configuration (scalars plus trailing layout/subs
/// tables) all live in-segment, as in the other remote subclasses.
pub struct RemoteSensor {
    core: RemoteCore,
    nsubs_capacity: usize,
    layout_capacity: usize,
}

impl RemoteSensor {
    /// Allocate a new remote sensor. `nsubs_capacity` bounds both the ring's
    /// per-slot measurement count and a configuration's `subs` table;
    /// `layout_capacity` bounds a configuration's `layout` grid.
    pub fn create(
        owner: &str,
        nsubs_capacity: usize,
        layout_capacity: usize,
        nbufs: usize,
        flags: CreateFlags,
    ) -> TaoResult<Self> {
        if nbufs < 2 {
            return Err(TaoError::BadArgument("nbufs must be >= 2".into()));
        }
        let header_size = std::mem::size_of::<SensorHeader>();
        let trailing_size = layout_capacity * std::mem::size_of::<i32>()
            + nsubs_capacity * std::mem::size_of::<SubImageDescriptor>();
        let slot_header = std::mem::size_of::<DataframeHeader>();
        let slot_payload = nsubs_capacity * std::mem::size_of::<ShMeasurement>();
        let stride =
            (slot_header + slot_payload).next_multiple_of(tao_common::consts::CACHE_LINE_SIZE);
        let ring_offset = header_size + 2 * trailing_size;
        let total = ring_offset + nbufs * stride;

        let core = RemoteCore::create(
            total,
            FAMILY_REMOTE_SENSOR,
            owner,
            nbufs as i64,
            ring_offset as i64,
            stride as i64,
            flags,
        )?;

        unsafe {
            let header = core.base_ptr() as *mut SensorHeader;
            std::ptr::addr_of_mut!((*header).active)
                .write(SensorConfigHeader::zeroed(header_size as i64));
            std::ptr::addr_of_mut!((*header).staged)
                .write(SensorConfigHeader::zeroed((header_size + trailing_size) as i64));
            let trailing_ptr = core.base_ptr().add(header_size);
            std::ptr::write_bytes(trailing_ptr, 0, 2 * trailing_size);
        }

        Ok(RemoteSensor {
            core,
            nsubs_capacity,
            layout_capacity,
        })
    }

    /// Attach to an existing remote sensor by id. `nsubs_capacity` and
    /// `layout_capacity` must be supplied out of band (e.g. from a
    /// config-discovery file), since they are only implicit in the
    /// in-segment layout's total size.
    pub fn attach(shmid: ShmId, nsubs_capacity: usize, layout_capacity: usize) -> TaoResult<Self> {
        let core = RemoteCore::attach(shmid, FAMILY_REMOTE_SENSOR)?;
        Ok(RemoteSensor {
            core,
            nsubs_capacity,
            layout_capacity,
        })
    }

    /// Number of measurement slots per ring entry, and the `subs` table
    /// capacity of a configuration.
    pub fn nsubs(&self) -> usize {
        self.nsubs_capacity
    }

    /// Capacity of a configuration's `layout` grid.
    pub fn layout_capacity(&self) -> usize {
        self.layout_capacity
    }

    fn header(&self) -> &SensorHeader {
        unsafe { &*(self.core.base_ptr() as *const SensorHeader) }
    }

    fn trailing_byte_len(&self) -> usize {
        self.layout_capacity * std::mem::size_of::<i32>()
            + self.nsubs_capacity * std::mem::size_of::<SubImageDescriptor>()
    }

    fn layout_ptr(&self, cfg: &SensorConfigHeader) -> *mut i32 {
        unsafe { self.core.base_ptr().add(cfg.offset_to_trailing as usize) as *mut i32 }
    }

    fn subs_ptr(&self, cfg: &SensorConfigHeader) -> *mut SubImageDescriptor {
        unsafe {
            self.core
                .base_ptr()
                .add(cfg.offset_to_trailing as usize)
                .add(self.layout_capacity * std::mem::size_of::<i32>())
                as *mut SubImageDescriptor
        }
    }

    /// Client: write run-time parameters (e.g. the centroiding forgetting
    /// factor) directly under the base lock, without going through the
    /// command queue.
    pub fn tune_config(&self, centroid_threshold: f64) {
        let header = self.core.header();
        header.base.mutex.lock();
        unsafe {
            let active = std::ptr::addr_of_mut!((*(self.core.base_ptr() as *mut SensorHeader)).active);
            (*active).centroid_threshold = centroid_threshold;
        }
        header.base.mutex.unlock();
    }

    /// Client: stage a new layout/geometry and queue it through the
    /// command queue, since it may change the sub-image layout. Rejected
    /// with `Exhausted` if `config`'s tables exceed this sensor's
    /// capacities.
    pub fn configure(&self, config: &SensorConfig, deadline: Deadline) -> TaoResult<i64> {
        if config.layout.len() > self.layout_capacity {
            return Err(TaoError::Exhausted);
        }
        if config.subs.len() > self.nsubs_capacity {
            return Err(TaoError::Exhausted);
        }
        self.core.queue_command(Command::Config, deadline, || unsafe {
            let sensor_header = self.core.base_ptr() as *mut SensorHeader;
            let staged = std::ptr::addr_of_mut!((*sensor_header).staged);
            (*staged).camera_owner = config.camera_owner;
            (*staged).camera_shmid = config.camera_shmid;
            (*staged).camera_dims = config.camera_dims;
            (*staged).pitch = config.pitch;
            (*staged).centroid_threshold = config.centroid_threshold;
            (*staged).nsubs = config.subs.len() as i32;

            let layout_ptr = self.layout_ptr(&*staged);
            let layout_slice = std::slice::from_raw_parts_mut(layout_ptr, self.layout_capacity);
            layout_slice.fill(-1);
            layout_slice[..config.layout.len()].copy_from_slice(&config.layout);

            let subs_ptr = self.subs_ptr(&*staged);
            let subs_slice = std::slice::from_raw_parts_mut(subs_ptr, self.nsubs_capacity);
            subs_slice.fill(SubImageDescriptor::default());
            subs_slice[..config.subs.len()].copy_from_slice(&config.subs);
        })
    }

    /// Server: apply the staged configuration as the active one. Called
    /// after `next_command` returns `Command::Config` and before
    /// `complete_command`.
    pub fn apply_staged_config(&self) {
        let header = self.core.base_ptr() as *mut SensorHeader;
        unsafe {
            let active_offset = (*header).active.offset_to_trailing;
            let staged_offset = (*header).staged.offset_to_trailing;

            (*header).active.camera_owner = (*header).staged.camera_owner;
            (*header).active.camera_shmid = (*header).staged.camera_shmid;
            (*header).active.camera_dims = (*header).staged.camera_dims;
            (*header).active.pitch = (*header).staged.pitch;
            (*header).active.centroid_threshold = (*header).staged.centroid_threshold;
            (*header).active.nsubs = (*header).staged.nsubs;
            (*header).active.offset_to_trailing = active_offset;

            let src = self.core.base_ptr().add(staged_offset as usize);
            let dst = self.core.base_ptr().add(active_offset as usize);
            std::ptr::copy_nonoverlapping(src, dst, self.trailing_byte_len());
        }
    }

    /// Read-only access to the active configuration under the base mutex.
    pub fn with_active_config<R>(&self, f: impl FnOnce(&SensorConfigView) -> R) -> R {
        let header = self.core.header();
        header.base.mutex.lock();
        let active = &self.header().active;
        let view = unsafe {
            SensorConfigView {
                header: active,
                layout: std::slice::from_raw_parts(self.layout_ptr(active), self.layout_capacity),
                subs: std::slice::from_raw_parts(self.subs_ptr(active), self.nsubs_capacity),
            }
        };
        let result = f(&view);
        header.base.mutex.unlock();
        result
    }

    fn slot_ptr(&self, serial: i64) -> *mut DataframeHeader {
        let header = self.core.header();
        let idx = (serial - 1).rem_euclid(header.nbufs);
        let offset = header.offset + idx * header.stride;
        unsafe { self.core.base_ptr().add(offset as usize) as *mut DataframeHeader }
    }

    /// Server: publish `measurements` (length must equal `nsubs_capacity`)
    /// tagged with `mark`.
    pub fn publish_measurements(&self, measurements: &[ShMeasurement], mark: i64) -> TaoResult<i64> {
        if measurements.len() != self.nsubs_capacity {
            return Err(TaoError::BadRank(measurements.len()));
        }
        let serial = self.core.header().serial() + 1;
        let slot = self.slot_ptr(serial);
        unsafe {
            std::ptr::addr_of_mut!((*slot).mark).write(mark);
            std::ptr::addr_of_mut!((*slot).timestamp).write(Timestamp::now());
            let payload_ptr =
                (slot as *mut u8).add(std::mem::size_of::<DataframeHeader>()) as *mut ShMeasurement;
            std::slice::from_raw_parts_mut(payload_ptr, self.nsubs_capacity)
                .copy_from_slice(measurements);
            (*slot).serial.store(serial, Ordering::Release);
        }
        Ok(self.core.publish())
    }

    /// Client: read out `nsubs_capacity` measurements for serial `s`, after
    /// `wait_output` has confirmed the slot is valid.
    pub fn read_measurements(&self, s: i64) -> Vec<ShMeasurement> {
        let slot = self.slot_ptr(s);
        unsafe {
            let payload_ptr =
                (slot as *const u8).add(std::mem::size_of::<DataframeHeader>()) as *const ShMeasurement;
            std::slice::from_raw_parts(payload_ptr, self.nsubs_capacity).to_vec()
        }
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
    fn create_attach_shares_capacities() {
        let sensor = RemoteSensor::create("wfs0", 16, 32, 3, CreateFlags::NONE).unwrap();
        let shmid = sensor.core.shmid();
        let attached = RemoteSensor::attach(shmid, 16, 32).unwrap();
        assert_eq!(attached.nsubs(), 16);
        assert_eq!(attached.layout_capacity(), 32);
    }

    #[test]
    fn publish_and_read_round_trip() {
        let sensor = RemoteSensor::create("wfs0", 2, 4, 2, CreateFlags::NONE).unwrap();
        let measurements = vec![
            ShMeasurement { dx: 0.1, dy: -0.2, flux: 100.0, valid: true },
            ShMeasurement { dx: 0.0, dy: 0.0, flux: 0.0, valid: false },
        ];
        let s = sensor.publish_measurements(&measurements, 7).unwrap();
        assert_eq!(s, 1);
        let read_back = sensor.read_measurements(s);
        assert_eq!(read_back.len(), 2);
        assert!((read_back[0].dx - 0.1).abs() < 1e-9);
    }

    #[test]
    fn publish_rejects_wrong_length() {
        let sensor = RemoteSensor::create("wfs0", 4, 8, 2, CreateFlags::NONE).unwrap();
        let result = sensor.publish_measurements(&[], 0);
        assert!(matches!(result, Err(TaoError::BadRank(0))));
    }

    #[test]
    fn tune_config_updates_without_command_queue() {
        let sensor = RemoteSensor::create("wfs0", 4, 8, 2, CreateFlags::NONE).unwrap();
        sensor.tune_config(0.5);
        let threshold = sensor.with_active_config(|c| c.centroid_threshold());
        assert_eq!(threshold, 0.5);
        assert_eq!(sensor.core.header().ncmds(), 0);
    }

    #[test]
    fn configure_rejects_tables_over_capacity() {
        let sensor = RemoteSensor::create("wfs0", 2, 4, 2, CreateFlags::NONE).unwrap();
        let mut config = SensorConfig::empty();
        config.subs = vec![SubImageDescriptor::default(); 3];
        let result = sensor.configure(&config, Deadline::NoWait);
        assert!(matches!(result, Err(TaoError::Exhausted)));
    }

    #[test]
    fn configure_and_apply_round_trips_through_segment() {
        let sensor = RemoteSensor::create("wfs0", 2, 4, 2, CreateFlags::NONE).unwrap();
        sensor.core.set_state(State::Waiting);

        let mut config = SensorConfig::empty();
        config.pitch = 3.5;
        config.layout = vec![0, 1, -1, -1];
        config.subs = vec![
            SubImageDescriptor { x: 0, y: 0, width: 8, height: 8, flux_threshold: 10.0 },
            SubImageDescriptor { x: 8, y: 0, width: 8, height: 8, flux_threshold: 10.0 },
        ];

        let expected = sensor.configure(&config, Deadline::relative(1.0)).unwrap();
        let next = sensor.core.next_command(Deadline::NoWait).unwrap();
        assert_eq!(next, Some(Command::Config));
        sensor.apply_staged_config();
        sensor.core.complete_command(State::Waiting);
        sensor.wait_command(expected, Deadline::relative(1.0)).unwrap();

        sensor.with_active_config(|active| {
            assert_eq!(active.pitch(), 3.5);
            assert_eq!(active.nsubs(), 2);
            assert_eq!(&active.layout()[..4], &[0, 1, -1, -1]);
            assert_eq!(active.subs()[1].x, 8);
        });
    }
}
