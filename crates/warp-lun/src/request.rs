//! Image requests
//!
//! An [`ImageRequest`] is one I/O against the image: an operation, a byte
//! range, an optional payload and, for write-class operations, the pinned
//! snapshot context. Requests are built by [`RequestBuilder`], which owns the
//! per-device pool of request descriptor slots.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::backend::ImageTransport;
use crate::error::Failure;
use crate::snapshot::SnapshotRef;

/// Image operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageOp {
    /// Read
    Read,
    /// Write
    Write,
    /// Discard (deallocate)
    Discard,
    /// Replicate one pattern block over the range
    WriteSame,
    /// Atomic compare then write
    CompareAndWrite,
}

impl ImageOp {
    /// Whether the operation modifies the image and pins a snapshot context
    pub fn is_write_class(&self) -> bool {
        !matches!(self, Self::Read)
    }
}

impl std::fmt::Display for ImageOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Discard => write!(f, "discard"),
            Self::WriteSame => write!(f, "writesame"),
            Self::CompareAndWrite => write!(f, "cmpext"),
        }
    }
}

/// Scatter list of data segments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScatterList {
    segments: Vec<BytesMut>,
}

impl ScatterList {
    /// Create an empty scatter list
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from segments
    pub fn from_segments(segments: Vec<BytesMut>) -> Self {
        Self { segments }
    }

    /// Create a single-segment list holding a copy of `data`
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            segments: vec![BytesMut::from(data)],
        }
    }

    /// Allocate `len` zeroed bytes split into segments of at most
    /// `segment_size` bytes.
    ///
    /// Fails with resource-exhausted when the allocation cannot be made.
    pub fn zeroed(len: usize, segment_size: usize) -> Result<Self, Failure> {
        let segment_size = segment_size.max(1);
        let mut segments = Vec::new();
        segments
            .try_reserve(len.div_ceil(segment_size))
            .map_err(|_| Failure::ResourceExhausted)?;

        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(segment_size);
            segments.push(try_zeroed(n)?);
            remaining -= n;
        }
        Ok(Self { segments })
    }

    /// Total length in bytes
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of segments
    pub fn nents(&self) -> usize {
        self.segments.len()
    }

    /// Segments
    pub fn segments(&self) -> &[BytesMut] {
        &self.segments
    }

    /// Mutable segments
    pub fn segments_mut(&mut self) -> &mut [BytesMut] {
        &mut self.segments
    }

    /// Copy out into one contiguous buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len());
        for seg in &self.segments {
            out.extend_from_slice(seg);
        }
        out.freeze()
    }

    /// Overwrite the list's contents from `src`, segment by segment.
    ///
    /// Copies `min(self.len(), src.len())` bytes and returns that count.
    pub fn copy_from_slice(&mut self, src: &[u8]) -> usize {
        let mut copied = 0;
        for seg in &mut self.segments {
            if copied == src.len() {
                break;
            }
            let n = seg.len().min(src.len() - copied);
            seg[..n].copy_from_slice(&src[copied..copied + n]);
            copied += n;
        }
        copied
    }
}

/// Buffers of a compare-and-write request
#[derive(Debug)]
pub struct CompareAndWriteBuffers {
    /// Data expected on the image
    pub compare: ScatterList,
    /// Data written when the compare succeeds
    pub write: ScatterList,
    /// Response buffer, `length + 8` bytes; on mismatch the transport
    /// stores the miscompare offset as little-endian u64 at its start
    pub response: BytesMut,
}

/// Request payload
#[derive(Debug, Default)]
pub enum RequestPayload {
    /// No data (discard)
    #[default]
    None,
    /// Data buffer: destination for reads, source for writes and write-same
    Data(ScatterList),
    /// Compare-and-write buffers
    CompareAndWrite(CompareAndWriteBuffers),
}

impl RequestPayload {
    /// Take the data buffer out, if this is a data payload
    pub fn into_data(self) -> Option<ScatterList> {
        match self {
            Self::Data(sg) => Some(sg),
            _ => None,
        }
    }
}

/// One image I/O
#[derive(Debug)]
pub struct ImageRequest {
    id: u64,
    op: ImageOp,
    offset: u64,
    length: u64,
    snapc: Option<SnapshotRef>,
    /// Request payload
    pub payload: RequestPayload,
    _slot: OwnedSemaphorePermit,
}

impl ImageRequest {
    /// Request id, unique per device
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Operation
    pub fn op(&self) -> ImageOp {
        self.op
    }

    /// Byte offset in the image
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length in bytes
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Pinned snapshot context
    pub fn snapshot(&self) -> Option<&SnapshotRef> {
        self.snapc.as_ref()
    }
}

/// Builds image requests and hands out descriptor slots
#[derive(Debug)]
pub struct RequestBuilder {
    slots: Arc<Semaphore>,
    capacity: usize,
    next_id: AtomicU64,
}

impl RequestBuilder {
    /// Create a builder with `slots` request descriptors
    pub fn new(slots: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(slots)),
            capacity: slots,
            next_id: AtomicU64::new(1),
        }
    }

    /// Descriptors currently in use
    pub fn in_use(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    /// Build and fill a request.
    ///
    /// Slot exhaustion is resource-exhausted. Fill failures are classified by
    /// [`Failure::from_fill_code`]. On failure the snapshot reference and
    /// payload are dropped here.
    pub fn build(
        &self,
        transport: &dyn ImageTransport,
        op: ImageOp,
        offset: u64,
        length: u64,
        payload: RequestPayload,
        snapc: Option<SnapshotRef>,
    ) -> Result<ImageRequest, Failure> {
        let slot = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|_| Failure::ResourceExhausted)?;

        let mut request = ImageRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            op,
            offset,
            length,
            snapc,
            payload,
            _slot: slot,
        };

        transport
            .fill(&mut request)
            .map_err(Failure::from_fill_code)?;

        trace!(
            "Built request {} {} offset={} len={} snapc={:?}",
            request.id,
            op,
            offset,
            length,
            request.snapc.as_ref().map(|s| s.seq())
        );
        Ok(request)
    }

    /// Build a compare-and-write request, allocating its response buffer
    pub fn build_compare_and_write(
        &self,
        transport: &dyn ImageTransport,
        offset: u64,
        length: u64,
        compare: ScatterList,
        write: ScatterList,
        snapc: SnapshotRef,
    ) -> Result<ImageRequest, Failure> {
        let response = alloc_response(length)?;
        let payload = RequestPayload::CompareAndWrite(CompareAndWriteBuffers {
            compare,
            write,
            response,
        });
        self.build(
            transport,
            ImageOp::CompareAndWrite,
            offset,
            length,
            payload,
            Some(snapc),
        )
    }
}

fn alloc_response(length: u64) -> Result<BytesMut, Failure> {
    let len = usize::try_from(length)
        .ok()
        .and_then(|l| l.checked_add(size_of::<u64>()))
        .ok_or(Failure::ResourceExhausted)?;
    try_zeroed(len)
}

/// Zeroed buffer of `len` bytes; allocation failure is resource-exhausted.
///
/// The reserved vector becomes the buffer without a copy.
fn try_zeroed(len: usize) -> Result<BytesMut, Failure> {
    let mut raw = Vec::new();
    raw.try_reserve_exact(len)
        .map_err(|_| Failure::ResourceExhausted)?;
    raw.resize(len, 0);
    Ok(BytesMut::from(Bytes::from(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryImage;
    use crate::snapshot::ImageHeader;

    #[test]
    fn test_scatter_list() {
        let mut sg = ScatterList::zeroed(10_000, 4096).unwrap();
        assert_eq!(sg.len(), 10_000);
        assert_eq!(sg.nents(), 3);

        let src: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        assert_eq!(sg.copy_from_slice(&src), 10_000);
        assert_eq!(&sg.to_bytes()[..], &src[..]);

        let empty = ScatterList::zeroed(0, 4096).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.nents(), 0);
    }

    #[test]
    fn test_allocation_failure_is_resource_exhausted() {
        assert_eq!(
            ScatterList::zeroed(usize::MAX, usize::MAX),
            Err(Failure::ResourceExhausted)
        );
        assert_eq!(
            alloc_response(isize::MAX as u64).unwrap_err(),
            Failure::ResourceExhausted
        );
        assert_eq!(
            alloc_response(u64::MAX).unwrap_err(),
            Failure::ResourceExhausted
        );

        let buf = try_zeroed(4096).unwrap();
        assert_eq!(buf.len(), 4096);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_write_class() {
        assert!(!ImageOp::Read.is_write_class());
        assert!(ImageOp::Write.is_write_class());
        assert!(ImageOp::Discard.is_write_class());
        assert!(ImageOp::CompareAndWrite.is_write_class());
    }

    #[test]
    fn test_slot_exhaustion() {
        let image = MemoryImage::new("img", 1 << 20);
        let builder = RequestBuilder::new(2);

        let a = builder
            .build(&image, ImageOp::Read, 0, 512, RequestPayload::None, None)
            .unwrap();
        let _b = builder
            .build(&image, ImageOp::Read, 512, 512, RequestPayload::None, None)
            .unwrap();
        assert_eq!(builder.in_use(), 2);

        let err = builder
            .build(&image, ImageOp::Read, 0, 512, RequestPayload::None, None)
            .unwrap_err();
        assert_eq!(err, Failure::ResourceExhausted);

        drop(a);
        assert_eq!(builder.in_use(), 1);
        assert!(
            builder
                .build(&image, ImageOp::Read, 0, 512, RequestPayload::None, None)
                .is_ok()
        );
    }

    #[test]
    fn test_failed_build_releases_snapshot() {
        let header = ImageHeader::new();
        let image = MemoryImage::new("img", 1 << 20);
        let builder = RequestBuilder::new(0);

        let probe = header.acquire();
        let snapc = header.acquire();
        assert_eq!(probe.refcount(), 3);

        let err = builder
            .build(
                &image,
                ImageOp::Write,
                0,
                512,
                RequestPayload::None,
                Some(snapc),
            )
            .unwrap_err();
        assert_eq!(err, Failure::ResourceExhausted);
        assert_eq!(probe.refcount(), 2);
    }

    #[test]
    fn test_compare_and_write_response_buffer() {
        let image = MemoryImage::new("img", 1 << 20);
        let header = ImageHeader::new();
        let builder = RequestBuilder::new(4);

        let request = builder
            .build_compare_and_write(
                &image,
                0,
                4096,
                ScatterList::from_slice(&[0u8; 4096]),
                ScatterList::from_slice(&[1u8; 4096]),
                header.acquire(),
            )
            .unwrap();

        match &request.payload {
            RequestPayload::CompareAndWrite(bufs) => {
                assert_eq!(bufs.response.len(), 4096 + 8);
                assert_eq!(bufs.compare.len(), 4096);
                assert_eq!(bufs.write.len(), 4096);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
        assert_eq!(request.snapshot().map(|s| s.seq()), Some(0));
    }

    #[test]
    fn test_fill_rejects_unsupported_compare_and_write() {
        let image = MemoryImage::new("img", 1 << 20).without_compare_and_write();
        let header = ImageHeader::new();
        let builder = RequestBuilder::new(4);

        let err = builder
            .build_compare_and_write(
                &image,
                0,
                512,
                ScatterList::from_slice(&[0u8; 512]),
                ScatterList::from_slice(&[0u8; 512]),
                header.acquire(),
            )
            .unwrap_err();
        assert!(matches!(err, Failure::InvalidParameter(_)));
        assert_eq!(builder.in_use(), 0);
    }
}
