//! Address and geometry translation
//!
//! The device exports one logical block size to the initiator while the
//! image is addressed in bytes and sized in native sectors (512 bytes unless
//! the image says otherwise).

use serde::{Deserialize, Serialize};

use crate::error::{Failure, LunError};

/// Native sector shift of the image store
pub const SECTOR_SHIFT: u32 = 9;

/// Native sector size of the image store
pub const SECTOR_SIZE: u32 = 1 << SECTOR_SHIFT;

/// Supported block sizes
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u32", into = "u32")]
pub enum BlockSize {
    /// 512 bytes
    #[default]
    B512,
    /// 1 KiB
    B1024,
    /// 2 KiB
    B2048,
    /// 4 KiB
    B4096,
}

impl BlockSize {
    /// All supported sizes, smallest first
    pub const ALL: [BlockSize; 4] = [Self::B512, Self::B1024, Self::B2048, Self::B4096];

    /// Size in bytes
    pub fn bytes(&self) -> u32 {
        1 << self.shift()
    }

    /// log2 of the size in bytes
    pub fn shift(&self) -> u32 {
        match self {
            Self::B512 => 9,
            Self::B1024 => 10,
            Self::B2048 => 11,
            Self::B4096 => 12,
        }
    }
}

impl TryFrom<u32> for BlockSize {
    type Error = LunError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            512 => Ok(Self::B512),
            1024 => Ok(Self::B1024),
            2048 => Ok(Self::B2048),
            4096 => Ok(Self::B4096),
            _ => Err(LunError::UnsupportedBlockSize(value)),
        }
    }
}

impl From<BlockSize> for u32 {
    fn from(size: BlockSize) -> Self {
        size.bytes()
    }
}

impl std::fmt::Display for BlockSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// Byte offset in the image of an exported LBA.
///
/// Also converts block counts into byte lengths. Callers range-check first;
/// see [`Geometry::byte_range`].
pub fn to_backend_offset(lba: u64, exported: BlockSize) -> u64 {
    lba << exported.shift()
}

/// Convert an image size in `backend`-sized blocks into exported blocks.
///
/// Scaling down (backend unit smaller than the exported block) truncates a
/// trailing partial exported block.
pub fn to_exported_block_count(backend_blocks: u64, exported: BlockSize, backend: BlockSize) -> u64 {
    if exported >= backend {
        backend_blocks >> (exported.shift() - backend.shift())
    } else {
        backend_blocks << (backend.shift() - exported.shift())
    }
}

/// Convert an image byte length into whole exported blocks
pub fn bytes_to_blocks(bytes: u64, exported: BlockSize) -> u64 {
    bytes >> exported.shift()
}

/// Geometry of one exported device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Block size advertised to the initiator
    pub exported: BlockSize,
    /// Native block size of the image
    pub native: BlockSize,
    /// Image size in bytes
    pub image_size: u64,
}

impl Geometry {
    /// Create a geometry description
    pub fn new(exported: BlockSize, native: BlockSize, image_size: u64) -> Self {
        Self {
            exported,
            native,
            image_size,
        }
    }

    /// Exported block size in bytes
    pub fn block_size(&self) -> u32 {
        self.exported.bytes()
    }

    /// Capacity in exported blocks
    pub fn capacity_blocks(&self) -> u64 {
        let native_blocks = self.image_size >> self.native.shift();
        to_exported_block_count(native_blocks, self.exported, self.native)
    }

    /// Exponent of logical blocks per physical block
    pub fn lbppbe(&self) -> u8 {
        self.native.shift().saturating_sub(self.exported.shift()) as u8
    }

    /// Physical block size in bytes
    pub fn physical_block_size(&self) -> u32 {
        self.exported.bytes().max(self.native.bytes())
    }

    /// Validate `lba + nolb` against capacity and return the byte range
    pub fn byte_range(&self, lba: u64, nolb: u64) -> Result<(u64, u64), Failure> {
        let capacity = self.capacity_blocks();
        let out_of_range = Failure::LbaOutOfRange {
            lba,
            nolb,
            capacity,
        };
        match lba.checked_add(nolb) {
            Some(end) if end <= capacity => Ok((
                to_backend_offset(lba, self.exported),
                to_backend_offset(nolb, self.exported),
            )),
            _ => Err(out_of_range),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_size_parse() {
        assert_eq!(BlockSize::try_from(4096).unwrap(), BlockSize::B4096);
        assert_eq!(BlockSize::try_from(512).unwrap().shift(), 9);
        assert!(matches!(
            BlockSize::try_from(8192),
            Err(LunError::UnsupportedBlockSize(8192))
        ));
        assert!(BlockSize::try_from(0).is_err());
    }

    #[test]
    fn test_backend_offset() {
        assert_eq!(to_backend_offset(10, BlockSize::B4096), 40960);
        assert_eq!(to_backend_offset(4, BlockSize::B4096), 16384);
        assert_eq!(to_backend_offset(3, BlockSize::B512), 1536);
        assert_eq!(to_backend_offset(3, BlockSize::B2048), 6144);
    }

    #[test]
    fn test_exported_block_count_scaling() {
        // 1 MiB image in 512-byte sectors
        let sectors = 2048;
        assert_eq!(
            to_exported_block_count(sectors, BlockSize::B4096, BlockSize::B512),
            256
        );
        assert_eq!(
            to_exported_block_count(sectors, BlockSize::B1024, BlockSize::B512),
            1024
        );
        assert_eq!(
            to_exported_block_count(sectors, BlockSize::B512, BlockSize::B512),
            2048
        );
        // native 4K, exported 512
        assert_eq!(
            to_exported_block_count(256, BlockSize::B512, BlockSize::B4096),
            2048
        );
        assert_eq!(
            to_exported_block_count(256, BlockSize::B2048, BlockSize::B4096),
            512
        );
    }

    #[test]
    fn test_geometry() {
        let geo = Geometry::new(BlockSize::B4096, BlockSize::B512, 1 << 20);
        assert_eq!(geo.capacity_blocks(), 256);
        assert_eq!(geo.lbppbe(), 0);
        assert_eq!(geo.physical_block_size(), 4096);

        let geo = Geometry::new(BlockSize::B512, BlockSize::B4096, 1 << 20);
        assert_eq!(geo.capacity_blocks(), 2048);
        assert_eq!(geo.lbppbe(), 3);
    }

    #[test]
    fn test_byte_range() {
        let geo = Geometry::new(BlockSize::B4096, BlockSize::B512, 1 << 20);
        assert_eq!(geo.byte_range(10, 4).unwrap(), (40960, 16384));
        assert_eq!(geo.byte_range(252, 4).unwrap(), (252 * 4096, 4 * 4096));
        assert!(matches!(
            geo.byte_range(253, 4),
            Err(Failure::LbaOutOfRange { capacity: 256, .. })
        ));
        assert!(geo.byte_range(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_block_size_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            size: BlockSize,
        }
        let w: Wrapper = toml::from_str("size = 2048").unwrap();
        assert_eq!(w.size, BlockSize::B2048);
        assert!(toml::from_str::<Wrapper>("size = 3000").is_err());
    }
}
