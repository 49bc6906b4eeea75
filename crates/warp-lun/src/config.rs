//! Device configuration
//!
//! Configuration types for exported devices and the images behind them,
//! plus the TOML file that ties them together.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LunError, LunResult};
use crate::geometry::BlockSize;
use crate::logging::LogConfig;

/// Largest WRITE SAME the device advertises, in blocks
pub const DEFAULT_MAX_WRITE_SAME_LEN: u32 = 0xFFFF;

/// Exported device configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device name
    pub name: String,
    /// Backing image name (`pool/image`)
    pub image: String,
    /// Block size exported to initiators
    pub block_size: BlockSize,
    /// Reject write-class commands
    pub read_only: bool,
    /// Enable UNMAP (thin provisioning unmap)
    pub emulate_tpu: bool,
    /// Enable WRITE SAME with the unmap bit
    pub emulate_tpws: bool,
    /// Enable COMPARE AND WRITE
    pub emulate_caw: bool,
    /// Largest WRITE SAME, in blocks
    pub max_write_same_len: u32,
    /// Image request descriptors available to the device
    pub request_slots: usize,
    /// Queue depth override; the image's depth is used when unset
    pub queue_depth: Option<u32>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            image: String::new(),
            block_size: BlockSize::B512,
            read_only: false,
            emulate_tpu: false,
            emulate_tpws: false,
            emulate_caw: true,
            max_write_same_len: DEFAULT_MAX_WRITE_SAME_LEN,
            request_slots: 256,
            queue_depth: None,
        }
    }
}

impl DeviceConfig {
    /// Create a device configuration
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Set block size
    pub fn block_size(mut self, size: BlockSize) -> Self {
        self.block_size = size;
        self
    }

    /// Make the device read-only
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Enable UNMAP and WRITE SAME with unmap
    pub fn thin_provisioning(mut self) -> Self {
        self.emulate_tpu = true;
        self.emulate_tpws = true;
        self
    }

    /// Disable COMPARE AND WRITE
    pub fn no_compare_and_write(mut self) -> Self {
        self.emulate_caw = false;
        self
    }

    /// Set the number of request descriptors
    pub fn request_slots(mut self, slots: usize) -> Self {
        self.request_slots = slots;
        self
    }

    /// Override the queue depth
    pub fn queue_depth(mut self, depth: u32) -> Self {
        self.queue_depth = Some(depth);
        self
    }

    /// Check the configuration for values the device cannot run with
    pub fn validate(&self) -> LunResult<()> {
        if self.name.is_empty() {
            return Err(LunError::Config("device name is empty".into()));
        }
        if self.image.is_empty() {
            return Err(LunError::Config(format!(
                "device {}: no image configured",
                self.name
            )));
        }
        if self.max_write_same_len == 0 {
            return Err(LunError::Config(format!(
                "device {}: max_write_same_len must be positive",
                self.name
            )));
        }
        if self.request_slots == 0 {
            return Err(LunError::Config(format!(
                "device {}: request_slots must be positive",
                self.name
            )));
        }
        if self.queue_depth == Some(0) {
            return Err(LunError::Config(format!(
                "device {}: queue_depth must be positive",
                self.name
            )));
        }
        Ok(())
    }

    /// Apply a `key=value` parameter string such as
    /// `image=rbd/disk0,readonly=1`.
    ///
    /// Entries are separated by commas or newlines. `udev_path` is accepted
    /// as an alias of `image`, `force` is accepted and ignored, unknown keys
    /// are skipped. The image cannot change while the device is attached.
    pub fn parse_params(&mut self, params: &str, attached: bool) -> LunResult<()> {
        for entry in params.split([',', '\n']).map(str::trim) {
            if entry.is_empty() {
                continue;
            }
            let Some((key, value)) = entry.split_once('=') else {
                debug!("Ignoring device parameter without value: {}", entry);
                continue;
            };
            let value = value.trim();

            match key.trim() {
                "image" | "udev_path" => {
                    if attached && value != self.image {
                        return Err(LunError::Config(format!(
                            "device {}: image cannot change while attached",
                            self.name
                        )));
                    }
                    self.image = value.to_string();
                    debug!("Device {}: image={}", self.name, self.image);
                }
                "readonly" => {
                    let flag: u64 = value.parse().map_err(|_| {
                        LunError::Config(format!("invalid readonly value: {value}"))
                    })?;
                    self.read_only = flag != 0;
                    debug!("Device {}: readonly={}", self.name, self.read_only);
                }
                "block_size" => {
                    let bytes: u32 = value.parse().map_err(|_| {
                        LunError::Config(format!("invalid block_size value: {value}"))
                    })?;
                    self.block_size = BlockSize::try_from(bytes)?;
                }
                "force" => {}
                other => debug!("Ignoring unknown device parameter: {}", other),
            }
        }
        Ok(())
    }

    /// Render the parameters for display
    pub fn show_params(&self) -> String {
        format!(
            "image: {}  readonly: {}  block_size: {}",
            if self.image.is_empty() { "-" } else { self.image.as_str() },
            u8::from(self.read_only),
            self.block_size
        )
    }
}

/// In-memory image definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Image name (`pool/image`)
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Native block size
    pub native_block_size: BlockSize,
    /// Object size in bytes
    pub object_size: u64,
    /// Requests the image can queue
    pub queue_depth: u32,
    /// Whether the image supports discard
    pub discard: bool,
    /// Largest discard in 512-byte sectors (default: one object)
    pub max_discard_sectors: Option<u64>,
    /// Discard granularity in bytes (default: the object size)
    pub discard_granularity: Option<u32>,
    /// Artificial completion latency in microseconds
    pub latency_us: Option<u64>,
    /// Whether the image supports compare-and-write
    pub compare_and_write: bool,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            size: 0,
            native_block_size: BlockSize::B512,
            object_size: 4 * 1024 * 1024, // 4 MB
            queue_depth: 128,
            discard: true,
            max_discard_sectors: None,
            discard_granularity: None,
            latency_us: None,
            compare_and_write: true,
        }
    }
}

impl ImageConfig {
    /// Create an image definition
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            ..Default::default()
        }
    }

    /// Check the definition
    pub fn validate(&self) -> LunResult<()> {
        if self.name.is_empty() {
            return Err(LunError::Config("image name is empty".into()));
        }
        if self.size == 0 || self.size % u64::from(self.native_block_size.bytes()) != 0 {
            return Err(LunError::Config(format!(
                "image {}: size {} is not a positive multiple of {}",
                self.name, self.size, self.native_block_size
            )));
        }
        if !self.object_size.is_power_of_two() || self.object_size < 4096 {
            return Err(LunError::Config(format!(
                "image {}: object size {} must be a power of two of at least 4096",
                self.name, self.object_size
            )));
        }
        if self.queue_depth == 0 {
            return Err(LunError::Config(format!(
                "image {}: queue_depth must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LunConfig {
    /// Logging
    pub log: LogConfig,
    /// Images
    pub images: Vec<ImageConfig>,
    /// Devices
    pub devices: Vec<DeviceConfig>,
}

impl LunConfig {
    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> LunResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::load_from_str(&content)
    }

    /// Parse and validate TOML
    pub fn load_from_str(content: &str) -> LunResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| LunError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Look up an image definition
    pub fn image(&self, name: &str) -> Option<&ImageConfig> {
        self.images.iter().find(|i| i.name == name)
    }

    /// Validate every entry and the references between them
    pub fn validate(&self) -> LunResult<()> {
        let mut images = HashSet::new();
        for image in &self.images {
            image.validate()?;
            if !images.insert(image.name.as_str()) {
                return Err(LunError::Config(format!(
                    "image {} defined twice",
                    image.name
                )));
            }
        }

        let mut devices = HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !devices.insert(device.name.as_str()) {
                return Err(LunError::DeviceExists(device.name.clone()));
            }
            if !images.contains(device.image.as_str()) {
                return Err(LunError::ImageNotFound(device.image.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[log]
level = "debug"

[[images]]
name = "rbd/disk0"
size = 67108864
object_size = 1048576
latency_us = 50

[[images]]
name = "rbd/disk1"
size = 16777216
discard = false

[[devices]]
name = "lun0"
image = "rbd/disk0"
block_size = 4096
emulate_tpu = true

[[devices]]
name = "lun1"
image = "rbd/disk1"
read_only = true
"#;

    #[test]
    fn test_defaults() {
        let config = DeviceConfig::new("lun0", "rbd/disk0");
        assert_eq!(config.max_write_same_len, 0xFFFF);
        assert!(config.emulate_caw);
        assert!(!config.emulate_tpu);
        assert!(config.validate().is_ok());

        assert!(DeviceConfig::default().validate().is_err());
        assert!(
            DeviceConfig::new("lun0", "rbd/disk0")
                .request_slots(0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_parse_params() {
        let mut config = DeviceConfig::new("lun0", "");
        config
            .parse_params("udev_path=rbd/disk0,readonly=1\nforce=1,bogus=3", false)
            .unwrap();
        assert_eq!(config.image, "rbd/disk0");
        assert!(config.read_only);
        assert_eq!(
            config.show_params(),
            "image: rbd/disk0  readonly: 1  block_size: 512"
        );

        config.parse_params("readonly=0", true).unwrap();
        assert!(!config.read_only);

        assert!(config.parse_params("readonly=yes", false).is_err());
        assert!(config.parse_params("image=rbd/other", true).is_err());
        assert!(config.parse_params("image=rbd/disk0", true).is_ok());
        assert!(config.parse_params("block_size=3000", false).is_err());
    }

    #[test]
    fn test_load_from_str() {
        let config = LunConfig::load_from_str(SAMPLE).unwrap();
        assert_eq!(config.images.len(), 2);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].block_size, BlockSize::B4096);
        assert!(config.devices[1].read_only);
        assert!(!config.image("rbd/disk1").unwrap().discard);
        assert_eq!(config.image("rbd/disk0").unwrap().latency_us, Some(50));
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = LunConfig::load(file.path()).unwrap();
        assert_eq!(config.devices[0].name, "lun0");

        assert!(matches!(
            LunConfig::load("/nonexistent/warp-lun.toml"),
            Err(LunError::Io(_))
        ));
    }

    #[test]
    fn test_rejects_bad_references() {
        let bad = r#"
[[devices]]
name = "lun0"
image = "rbd/missing"
"#;
        assert!(matches!(
            LunConfig::load_from_str(bad),
            Err(LunError::ImageNotFound(_))
        ));

        let bad_size = r#"
[[images]]
name = "rbd/odd"
size = 1000
"#;
        assert!(matches!(
            LunConfig::load_from_str(bad_size),
            Err(LunError::Config(_))
        ));

        assert!(matches!(
            LunConfig::load_from_str("devices = 3"),
            Err(LunError::Parse(_))
        ));
    }
}
