//! Exported devices
//!
//! A [`Device`] binds an image transport to an exported geometry and owns
//! everything commands share: the engine, the request descriptor pool, the
//! compare-and-write slot, in-flight accounting and statistics. Devices are
//! attached and detached through a [`DeviceRegistry`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::backend::ImageTransport;
use crate::caw::CompareAndWriteSlot;
use crate::config::DeviceConfig;
use crate::engine::{Engine, EngineCounters};
use crate::error::{LunError, LunResult};
use crate::geometry::Geometry;
use crate::request::RequestBuilder;

/// Device ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(u64);

impl DeviceId {
    /// Generate a new unique device ID
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Create from raw value
    pub fn from_raw(val: u64) -> Self {
        Self(val)
    }

    /// Get raw value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lun-{:08x}", self.0)
    }
}

/// Device state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Accepting commands
    Active,
    /// Removed from the registry; new commands fail
    Detached,
}

impl DeviceState {
    /// Check if the device accepts commands
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Detached => write!(f, "detached"),
        }
    }
}

/// Device statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// READ commands
    pub read_ops: u64,
    /// WRITE commands
    pub write_ops: u64,
    /// Bytes read
    pub bytes_read: u64,
    /// Bytes written
    pub bytes_written: u64,
    /// UNMAP and WRITE SAME (unmap) commands
    pub unmap_ops: u64,
    /// Blocks unmapped
    pub unmap_blocks: u64,
    /// WRITE SAME commands
    pub write_same_ops: u64,
    /// COMPARE AND WRITE commands
    pub compare_and_write_ops: u64,
    /// COMPARE AND WRITE commands that miscompared
    pub miscompares: u64,
    /// SYNCHRONIZE CACHE commands
    pub sync_cache_ops: u64,
    /// Commands that completed with a failure
    pub errors: u64,
}

impl DeviceStats {
    /// Create new empty stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a read
    pub fn record_read(&mut self, bytes: u64) {
        self.read_ops += 1;
        self.bytes_read += bytes;
    }

    /// Record a write
    pub fn record_write(&mut self, bytes: u64) {
        self.write_ops += 1;
        self.bytes_written += bytes;
    }

    /// Record an unmap
    pub fn record_unmap(&mut self, blocks: u64) {
        self.unmap_ops += 1;
        self.unmap_blocks += blocks;
    }

    /// Record a write same
    pub fn record_write_same(&mut self) {
        self.write_same_ops += 1;
    }

    /// Record a compare and write
    pub fn record_compare_and_write(&mut self, miscompared: bool) {
        self.compare_and_write_ops += 1;
        if miscompared {
            self.miscompares += 1;
        }
    }

    /// Record a cache sync
    pub fn record_sync_cache(&mut self) {
        self.sync_cache_ops += 1;
    }

    /// Record a failed command
    pub fn record_error(&mut self) {
        self.errors += 1;
    }
}

/// What the device advertises to initiators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Logical block size in bytes
    pub logical_block_size: u32,
    /// Physical block size in bytes
    pub physical_block_size: u32,
    /// Logical blocks per physical block exponent
    pub lbppbe: u8,
    /// Capacity in logical blocks
    pub capacity_blocks: u64,
    /// Largest WRITE SAME in blocks
    pub max_write_same_len: u32,
    /// Largest UNMAP in blocks; 0 when unmap is unsupported or unlimited
    pub max_unmap_lba_count: u64,
    /// UNMAP block descriptors per command
    pub max_unmap_block_desc_count: u32,
    /// Unmap granularity in blocks
    pub unmap_granularity: u64,
    /// Unmap granularity alignment in blocks
    pub unmap_granularity_alignment: u64,
    /// Whether the image can discard
    pub discard_supported: bool,
    /// Lowest aligned LBA
    pub alignment_offset_lbas: u64,
    /// Minimum I/O size in bytes
    pub io_min: u32,
    /// Optimal I/O size in bytes
    pub io_opt: u32,
    /// Queue depth
    pub queue_depth: u32,
    /// Always true: the image has no seek penalty
    pub non_rotational: bool,
    /// Always false: completed writes are on the image
    pub write_cache: bool,
}

impl DeviceCapabilities {
    /// Size of one UNMAP sub-range in blocks, `None` when unlimited.
    ///
    /// The advertised maximum is rounded down to a multiple of the
    /// granularity, but never below one granule.
    pub fn unmap_chunk_blocks(&self) -> Option<u64> {
        if self.max_unmap_lba_count == 0 {
            return None;
        }
        let granule = self.unmap_granularity.max(1);
        let chunk = self.max_unmap_lba_count / granule * granule;
        Some(chunk.max(granule))
    }
}

/// Device info (for listing/display)
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device ID
    pub id: DeviceId,
    /// Device name
    pub name: String,
    /// Image name
    pub image: String,
    /// Exported block size
    pub block_size: u32,
    /// Capacity in blocks
    pub capacity_blocks: u64,
    /// Read-only flag
    pub read_only: bool,
    /// State
    pub state: DeviceState,
    /// Commands in flight
    pub inflight: u64,
    /// Statistics
    pub stats: DeviceStats,
}

impl DeviceInfo {
    /// Capacity in bytes
    pub fn size(&self) -> u64 {
        self.capacity_blocks * u64::from(self.block_size)
    }

    /// Format size as human-readable string
    pub fn size_human(&self) -> String {
        format_bytes(self.size())
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

    let mut unit = None;
    let mut scaled = bytes as f64;
    for name in UNITS {
        if scaled < 1024.0 {
            break;
        }
        scaled /= 1024.0;
        unit = Some(name);
    }
    match unit {
        Some(name) => format!("{scaled:.2} {name}"),
        None => format!("{bytes} B"),
    }
}

/// Decrements the in-flight counter when the command finishes
#[derive(Debug)]
pub(crate) struct InFlightGuard(Arc<AtomicU64>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One exported block device
pub struct Device {
    id: DeviceId,
    config: DeviceConfig,
    geometry: Geometry,
    transport: Arc<dyn ImageTransport>,
    pub(crate) engine: Arc<Engine>,
    pub(crate) builder: Arc<RequestBuilder>,
    pub(crate) caw: CompareAndWriteSlot,
    state: RwLock<DeviceState>,
    inflight: Arc<AtomicU64>,
    pub(crate) stats: Arc<Mutex<DeviceStats>>,
}

impl Device {
    /// Bind a transport to an exported geometry
    pub fn attach(config: DeviceConfig, transport: Arc<dyn ImageTransport>) -> LunResult<Self> {
        config.validate()?;

        let info = transport.info();
        if config.image != info.name {
            return Err(LunError::Config(format!(
                "device {} configured for image {} but attached to {}",
                config.name, config.image, info.name
            )));
        }
        let geometry = Geometry::new(config.block_size, info.native_block_size, info.size);
        if geometry.capacity_blocks() == 0 {
            return Err(LunError::Config(format!(
                "image {} is smaller than one {} byte block",
                info.name, config.block_size
            )));
        }

        let device = Self {
            id: DeviceId::generate(),
            engine: Arc::new(Engine::new(Arc::clone(&transport))),
            builder: Arc::new(RequestBuilder::new(config.request_slots)),
            caw: CompareAndWriteSlot::new(),
            state: RwLock::new(DeviceState::Active),
            inflight: Arc::new(AtomicU64::new(0)),
            stats: Arc::new(Mutex::new(DeviceStats::new())),
            config,
            geometry,
            transport,
        };
        info!(
            "Attached {} ({}) to image {}: {} blocks of {} bytes{}",
            device.config.name,
            device.id,
            device.transport.info().name,
            geometry.capacity_blocks(),
            geometry.block_size(),
            if device.config.read_only { ", read-only" } else { "" }
        );
        Ok(device)
    }

    /// Device ID
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Configuration
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Geometry
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Backing transport
    pub fn transport(&self) -> &Arc<dyn ImageTransport> {
        &self.transport
    }

    /// Check if the device is read-only
    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    /// Current state
    pub fn state(&self) -> DeviceState {
        *self.state.read()
    }

    /// Mark the device detached if nothing is running on it.
    ///
    /// Holds the state lock across the check so no command can start
    /// between the check and the state change.
    fn try_detach(&self) -> LunResult<()> {
        let mut state = self.state.write();
        let inflight = self.inflight();
        let caw_held = self.is_compare_and_write_held();
        if inflight > 0 || caw_held {
            warn!(
                "Refusing to detach {} ({}): {} in flight, compare-and-write held: {}",
                self.name(),
                self.id,
                inflight,
                caw_held
            );
            return Err(LunError::DeviceBusy { inflight, caw_held });
        }
        *state = DeviceState::Detached;
        Ok(())
    }

    /// Commands accepted but not yet completed
    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::Acquire)
    }

    /// Whether a compare-and-write holds the slot
    pub fn is_compare_and_write_held(&self) -> bool {
        self.caw.is_held()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> DeviceStats {
        self.stats.lock().clone()
    }

    /// Engine counters
    pub fn engine_counters(&self) -> EngineCounters {
        self.engine.counters()
    }

    /// Count a command as in flight and return the state it runs against
    pub(crate) fn begin(&self) -> (InFlightGuard, DeviceState) {
        let state = self.state.read();
        self.inflight.fetch_add(1, Ordering::AcqRel);
        (InFlightGuard(Arc::clone(&self.inflight)), *state)
    }

    /// What the device advertises
    pub fn capabilities(&self) -> DeviceCapabilities {
        let info = self.transport.info();
        let bs = u64::from(self.geometry.block_size());

        let (max_unmap, desc_count, granularity, alignment) = match info.discard {
            Some(limits) => (
                (limits.max_discard_sectors << 9) / bs,
                1,
                (u64::from(limits.granularity) / bs).max(1),
                u64::from(limits.alignment) / bs,
            ),
            None => (0, 0, 0, 0),
        };

        DeviceCapabilities {
            logical_block_size: self.geometry.block_size(),
            physical_block_size: self.geometry.physical_block_size(),
            lbppbe: self.geometry.lbppbe(),
            capacity_blocks: self.geometry.capacity_blocks(),
            max_write_same_len: self.config.max_write_same_len,
            max_unmap_lba_count: max_unmap,
            max_unmap_block_desc_count: desc_count,
            unmap_granularity: granularity,
            unmap_granularity_alignment: alignment,
            discard_supported: info.discard.is_some(),
            alignment_offset_lbas: u64::from(info.alignment_offset) / bs,
            io_min: info.io_min,
            io_opt: info.io_opt,
            queue_depth: self.config.queue_depth.unwrap_or(info.queue_depth),
            non_rotational: true,
            write_cache: false,
        }
    }

    /// Listing info
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id,
            name: self.config.name.clone(),
            image: self.transport.info().name.clone(),
            block_size: self.geometry.block_size(),
            capacity_blocks: self.geometry.capacity_blocks(),
            read_only: self.config.read_only,
            state: self.state(),
            inflight: self.inflight(),
            stats: self.stats(),
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("geometry", &self.geometry)
            .field("inflight", &self.inflight())
            .finish_non_exhaustive()
    }
}

/// Attached devices, by id and by name
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: DashMap<DeviceId, Arc<Device>>,
    names: DashMap<String, DeviceId>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device
    pub fn attach(
        &self,
        config: DeviceConfig,
        transport: Arc<dyn ImageTransport>,
    ) -> LunResult<Arc<Device>> {
        match self.names.entry(config.name.clone()) {
            Entry::Occupied(_) => Err(LunError::DeviceExists(config.name)),
            Entry::Vacant(slot) => {
                let device = Arc::new(Device::attach(config, transport)?);
                slot.insert(device.id());
                self.devices.insert(device.id(), Arc::clone(&device));
                Ok(device)
            }
        }
    }

    /// Detach a device.
    ///
    /// Fails with [`LunError::DeviceBusy`] while commands are in flight or a
    /// compare-and-write holds the slot.
    pub fn detach(&self, id: DeviceId) -> LunResult<Arc<Device>> {
        let device = self
            .get(id)
            .ok_or_else(|| LunError::DeviceNotFound(id.to_string()))?;

        device.try_detach()?;
        self.devices.remove(&id);
        self.names.remove(device.name());
        info!("Detached {} ({})", device.name(), id);
        Ok(device)
    }

    /// Look up by id
    pub fn get(&self, id: DeviceId) -> Option<Arc<Device>> {
        self.devices.get(&id).map(|d| Arc::clone(d.value()))
    }

    /// Look up by name
    pub fn get_by_name(&self, name: &str) -> Option<Arc<Device>> {
        let id = *self.names.get(name)?;
        self.get(id)
    }

    /// List attached devices
    pub fn list(&self) -> Vec<DeviceInfo> {
        let mut infos: Vec<_> = self.devices.iter().map(|d| d.info()).collect();
        infos.sort_by_key(|i| i.id.raw());
        infos
    }

    /// Number of attached devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if no device is attached
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DiscardLimits;
    use crate::backend::memory::MemoryImage;
    use crate::geometry::BlockSize;

    const MIB: u64 = 1024 * 1024;

    fn image(name: &str) -> Arc<MemoryImage> {
        Arc::new(MemoryImage::new(name, 64 * MIB))
    }

    #[test]
    fn test_device_id() {
        let id1 = DeviceId::generate();
        let id2 = DeviceId::generate();
        assert_ne!(id1, id2);
        assert_eq!(DeviceId::from_raw(0x2a).to_string(), "lun-0000002a");
    }

    #[test]
    fn test_stats() {
        let mut stats = DeviceStats::new();
        stats.record_read(4096);
        stats.record_write(8192);
        stats.record_unmap(16);
        stats.record_compare_and_write(true);
        stats.record_compare_and_write(false);

        assert_eq!(stats.read_ops, 1);
        assert_eq!(stats.bytes_written, 8192);
        assert_eq!(stats.unmap_blocks, 16);
        assert_eq!(stats.compare_and_write_ops, 2);
        assert_eq!(stats.miscompares, 1);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(100), "100 B");
        assert_eq!(format_bytes(1536), "1.50 KiB");
        assert_eq!(format_bytes(64 * MIB), "64.00 MiB");
        assert_eq!(format_bytes(10 * 1024 * MIB), "10.00 GiB");
    }

    #[test]
    fn test_capabilities() {
        let transport = Arc::new(
            MemoryImage::new("rbd/disk0", 64 * MIB)
                .with_io_hints(4096, 4 * MIB as u32)
                .with_alignment_offset(8192),
        );
        let config = DeviceConfig::new("lun0", "rbd/disk0")
            .block_size(BlockSize::B4096)
            .thin_provisioning();
        let device = Device::attach(config, transport).unwrap();
        let caps = device.capabilities();

        assert_eq!(caps.capacity_blocks, 16384);
        assert_eq!(caps.logical_block_size, 4096);
        assert_eq!(caps.lbppbe, 0);
        assert_eq!(caps.max_write_same_len, 0xFFFF);
        // 4 MiB objects: 8192 sectors -> 1024 blocks of 4 KiB
        assert_eq!(caps.max_unmap_lba_count, 1024);
        assert_eq!(caps.max_unmap_block_desc_count, 1);
        assert_eq!(caps.unmap_granularity, 1024);
        assert!(caps.discard_supported);
        assert_eq!(caps.alignment_offset_lbas, 2);
        assert_eq!(caps.io_min, 4096);
        assert_eq!(caps.queue_depth, 128);
        assert!(caps.non_rotational);
        assert!(!caps.write_cache);
    }

    #[test]
    fn test_capabilities_without_discard() {
        let transport = Arc::new(
            MemoryImage::new("rbd/disk0", MIB)
                .with_discard(None)
                .with_native_block_size(BlockSize::B4096),
        );
        let config = DeviceConfig::new("lun0", "rbd/disk0").queue_depth(32);
        let device = Device::attach(config, transport).unwrap();
        let caps = device.capabilities();

        assert!(!caps.discard_supported);
        assert_eq!(caps.max_unmap_lba_count, 0);
        assert_eq!(caps.max_unmap_block_desc_count, 0);
        assert_eq!(caps.unmap_chunk_blocks(), None);
        assert_eq!(caps.lbppbe, 3);
        assert_eq!(caps.physical_block_size, 4096);
        assert_eq!(caps.capacity_blocks, 2048);
        assert_eq!(caps.queue_depth, 32);
    }

    #[test]
    fn test_unmap_chunk_rounding() {
        let transport = Arc::new(MemoryImage::new("rbd/disk0", MIB).with_discard(Some(
            DiscardLimits {
                max_discard_sectors: 56,
                granularity: 8192,
                alignment: 0,
            },
        )));
        let config = DeviceConfig::new("lun0", "rbd/disk0")
            .block_size(BlockSize::B4096)
            .thin_provisioning();
        let device = Device::attach(config, transport).unwrap();
        let caps = device.capabilities();

        // 56 sectors = 7 blocks, granularity 2 blocks -> chunks of 6
        assert_eq!(caps.max_unmap_lba_count, 7);
        assert_eq!(caps.unmap_granularity, 2);
        assert_eq!(caps.unmap_chunk_blocks(), Some(6));
    }

    #[test]
    fn test_attach_rejects_mismatched_image() {
        let err = Device::attach(DeviceConfig::new("lun0", "rbd/other"), image("rbd/disk0"))
            .unwrap_err();
        assert!(matches!(err, LunError::Config(_)));
    }

    #[test]
    fn test_registry() {
        let registry = DeviceRegistry::new();
        let device = registry
            .attach(DeviceConfig::new("lun0", "rbd/disk0"), image("rbd/disk0"))
            .unwrap();
        assert!(matches!(
            registry.attach(DeviceConfig::new("lun0", "rbd/disk0"), image("rbd/disk0")),
            Err(LunError::DeviceExists(_))
        ));
        registry
            .attach(DeviceConfig::new("lun1", "rbd/disk1"), image("rbd/disk1"))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_by_name("lun0").unwrap().id(), device.id());
        let names: Vec<_> = registry.list().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["lun0", "lun1"]);

        let detached = registry.detach(device.id()).unwrap();
        assert_eq!(detached.state(), DeviceState::Detached);
        assert!(registry.get_by_name("lun0").is_none());
        assert!(matches!(
            registry.detach(device.id()),
            Err(LunError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_detach_busy() {
        let registry = DeviceRegistry::new();
        let device = registry
            .attach(DeviceConfig::new("lun0", "rbd/disk0"), image("rbd/disk0"))
            .unwrap();

        let (guard, state) = device.begin();
        assert_eq!(state, DeviceState::Active);
        assert!(matches!(
            registry.detach(device.id()),
            Err(LunError::DeviceBusy {
                inflight: 1,
                caw_held: false
            })
        ));
        drop(guard);

        let permit = device.caw.try_acquire().unwrap();
        assert!(matches!(
            registry.detach(device.id()),
            Err(LunError::DeviceBusy { caw_held: true, .. })
        ));
        drop(permit);

        assert_eq!(device.state(), DeviceState::Active);

        assert!(registry.detach(device.id()).is_ok());
        assert!(registry.is_empty());

        let (guard, state) = device.begin();
        assert_eq!(state, DeviceState::Detached);
        assert!(!state.is_usable());
        drop(guard);
        assert_eq!(device.inflight(), 0);
    }
}
