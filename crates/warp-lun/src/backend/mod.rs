//! Image transports
//!
//! The engine talks to the image store through [`ImageTransport`]. A
//! transport fills in backend state for a freshly built request, accepts it
//! for asynchronous execution and later reports the result through
//! [`InFlight::complete`]. It never sees a block command.
//!
//! [`InFlight::complete`]: crate::engine::InFlight::complete

pub mod memory;

use crate::engine::{InFlight, SubmitError};
use crate::geometry::BlockSize;
use crate::request::ImageRequest;
use crate::snapshot::ImageHeader;

/// Discard limits advertised by an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscardLimits {
    /// Largest single discard, in 512-byte sectors. 0 means no limit.
    pub max_discard_sectors: u64,
    /// Discard granularity in bytes
    pub granularity: u32,
    /// Discard alignment in bytes
    pub alignment: u32,
}

/// Static properties of an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Image name (`pool/image`)
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Native block size
    pub native_block_size: BlockSize,
    /// Size of one backing object in bytes
    pub object_size: u64,
    /// Discard support, `None` when the image cannot discard
    pub discard: Option<DiscardLimits>,
    /// Requests the transport can queue
    pub queue_depth: u32,
    /// Minimum I/O size in bytes
    pub io_min: u32,
    /// Optimal I/O size in bytes
    pub io_opt: u32,
    /// Alignment offset in bytes
    pub alignment_offset: u32,
}

impl ImageInfo {
    /// Default object size (4 MiB)
    pub const DEFAULT_OBJECT_SIZE: u64 = 4 * 1024 * 1024;

    /// Describe an image with default properties
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        let object_size = Self::DEFAULT_OBJECT_SIZE;
        Self {
            name: name.into(),
            size,
            native_block_size: BlockSize::B512,
            object_size,
            discard: Some(DiscardLimits {
                max_discard_sectors: object_size >> 9,
                granularity: object_size as u32,
                alignment: 0,
            }),
            queue_depth: 128,
            io_min: object_size as u32,
            io_opt: object_size as u32,
            alignment_offset: 0,
        }
    }

    /// Set the native block size
    pub fn with_native_block_size(mut self, size: BlockSize) -> Self {
        self.native_block_size = size;
        self
    }

    /// Set the object size. Discard limits and I/O hints follow it.
    pub fn with_object_size(mut self, object_size: u64) -> Self {
        self.object_size = object_size;
        if let Some(discard) = self.discard.as_mut() {
            discard.max_discard_sectors = object_size >> 9;
            discard.granularity = object_size as u32;
        }
        self.io_min = object_size as u32;
        self.io_opt = object_size as u32;
        self
    }

    /// Set the queue depth
    pub fn with_queue_depth(mut self, queue_depth: u32) -> Self {
        self.queue_depth = queue_depth;
        self
    }
}

/// Asynchronous, object-addressed image backend
pub trait ImageTransport: Send + Sync + 'static {
    /// Image properties
    fn info(&self) -> &ImageInfo;

    /// Image header holding the snapshot context
    fn header(&self) -> &ImageHeader;

    /// Prepare backend state for a request before submission.
    ///
    /// Returns a negative errno on failure. `-EOPNOTSUPP` means the image
    /// does not support the operation.
    fn fill(&self, _request: &mut ImageRequest) -> Result<(), i32> {
        Ok(())
    }

    /// Accept a request for asynchronous execution.
    ///
    /// On acceptance the transport must eventually call
    /// [`InFlight::complete`] exactly once. On rejection the envelope is
    /// handed back untouched inside the error.
    ///
    /// [`InFlight::complete`]: crate::engine::InFlight::complete
    fn submit(&self, io: InFlight) -> Result<(), SubmitError>;
}
