//! In-memory object image
//!
//! An object-addressed image held in memory. The image is split into
//! fixed-size objects that are allocated on first write; a discard that
//! covers an object completely frees it. Requests execute on a spawned tokio
//! task so completions arrive on a different context than submission, the
//! same way a networked image behaves.
//!
//! The image records every accepted submission and can inject faults, which
//! is what the engine's tests lean on.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::backend::{DiscardLimits, ImageInfo, ImageTransport};
use crate::config::ImageConfig;
use crate::engine::{InFlight, SubmitError};
use crate::error::{LunResult, errno};
use crate::geometry::BlockSize;
use crate::request::{ImageOp, ImageRequest, RequestPayload};
use crate::snapshot::ImageHeader;

/// One accepted submission
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    /// Request id
    pub id: u64,
    /// Operation
    pub op: ImageOp,
    /// Byte offset
    pub offset: u64,
    /// Byte length
    pub length: u64,
    /// Sequence of the pinned snapshot context (write-class only)
    pub snap_seq: Option<u64>,
    /// When the transport accepted the request
    pub submitted_at: Instant,
    /// When the result was reported
    pub completed_at: Option<Instant>,
    /// Reported result
    pub result: Option<i32>,
}

#[derive(Debug, Clone, Copy)]
struct NthFailure {
    op: ImageOp,
    n: u64,
    code: i32,
}

#[derive(Debug, Default)]
struct Faults {
    reject: Option<(Option<ImageOp>, i32)>,
    fail_nth: Vec<NthFailure>,
    seen: HashMap<ImageOp, u64>,
}

impl Faults {
    fn reject_code(&self, op: ImageOp) -> Option<i32> {
        match self.reject {
            Some((None, code)) => Some(code),
            Some((Some(target), code)) if target == op => Some(code),
            _ => None,
        }
    }

    /// Count an accepted request and return the injected result, if any
    fn next_failure(&mut self, op: ImageOp) -> Option<i32> {
        let seen = self.seen.entry(op).or_insert(0);
        *seen += 1;
        let n = *seen;
        self.fail_nth
            .iter()
            .find(|f| f.op == op && f.n == n)
            .map(|f| f.code)
    }
}

/// Object storage behind a [`MemoryImage`]
#[derive(Debug)]
struct ObjectStore {
    size: u64,
    object_size: u64,
    objects: DashMap<u64, Vec<u8>>,
    /// Makes compare plus write atomic against other compare-and-writes
    cmpext: Mutex<()>,
}

impl ObjectStore {
    fn new(size: u64, object_size: u64) -> Self {
        Self {
            size,
            object_size: object_size.max(1),
            objects: DashMap::new(),
            cmpext: Mutex::new(()),
        }
    }

    /// Split `[offset, offset + len)` into per-object pieces of
    /// `(object number, offset in object, offset in range, length)`
    fn pieces(&self, offset: u64, len: u64) -> Vec<(u64, usize, usize, usize)> {
        let mut out = Vec::new();
        let mut pos = 0u64;
        while pos < len {
            let abs = offset + pos;
            let objno = abs / self.object_size;
            let in_obj = abs % self.object_size;
            let n = (self.object_size - in_obj).min(len - pos);
            out.push((objno, in_obj as usize, pos as usize, n as usize));
            pos += n;
        }
        out
    }

    fn read(&self, offset: u64, buf: &mut [u8]) {
        for (objno, in_obj, at, n) in self.pieces(offset, buf.len() as u64) {
            match self.objects.get(&objno) {
                Some(obj) => buf[at..at + n].copy_from_slice(&obj[in_obj..in_obj + n]),
                None => buf[at..at + n].fill(0),
            }
        }
    }

    fn write(&self, offset: u64, data: &[u8]) {
        let object_size = self.object_size as usize;
        for (objno, in_obj, at, n) in self.pieces(offset, data.len() as u64) {
            let mut obj = self
                .objects
                .entry(objno)
                .or_insert_with(|| vec![0; object_size]);
            obj[in_obj..in_obj + n].copy_from_slice(&data[at..at + n]);
        }
    }

    fn write_same(&self, offset: u64, len: u64, pattern: &[u8]) {
        let object_size = self.object_size as usize;
        for (objno, in_obj, at, n) in self.pieces(offset, len) {
            let mut obj = self
                .objects
                .entry(objno)
                .or_insert_with(|| vec![0; object_size]);
            for (i, byte) in obj[in_obj..in_obj + n].iter_mut().enumerate() {
                *byte = pattern[(at + i) % pattern.len()];
            }
        }
    }

    fn discard(&self, offset: u64, len: u64) {
        let object_size = self.object_size as usize;
        for (objno, in_obj, _, n) in self.pieces(offset, len) {
            if n == object_size {
                self.objects.remove(&objno);
            } else if let Some(mut obj) = self.objects.get_mut(&objno) {
                obj[in_obj..in_obj + n].fill(0);
            }
        }
    }

    /// Run one request against the store and return its result code
    fn execute(&self, request: &mut ImageRequest) -> i32 {
        let offset = request.offset();
        let length = request.length();
        let in_bounds = offset
            .checked_add(length)
            .is_some_and(|end| end <= self.size);
        let Some(len) = usize::try_from(length).ok().filter(|_| in_bounds) else {
            return -errno::EINVAL;
        };

        match (request.op(), &mut request.payload) {
            (ImageOp::Read, RequestPayload::Data(sg)) if sg.len() == len => {
                let mut buf = vec![0u8; len];
                self.read(offset, &mut buf);
                sg.copy_from_slice(&buf);
                0
            }
            (ImageOp::Write, RequestPayload::Data(sg)) if sg.len() == len => {
                self.write(offset, &sg.to_bytes());
                0
            }
            (ImageOp::Discard, _) => {
                self.discard(offset, length);
                0
            }
            (ImageOp::WriteSame, RequestPayload::Data(sg)) => {
                let pattern = sg.to_bytes();
                if pattern.is_empty() || len % pattern.len() != 0 {
                    return -errno::EINVAL;
                }
                self.write_same(offset, length, &pattern);
                0
            }
            (ImageOp::CompareAndWrite, RequestPayload::CompareAndWrite(bufs))
                if bufs.compare.len() == len && bufs.write.len() == len =>
            {
                let _guard = self.cmpext.lock();
                let mut current = vec![0u8; len];
                self.read(offset, &mut current);
                let expected = bufs.compare.to_bytes();
                match current.iter().zip(expected.iter()).position(|(a, b)| a != b) {
                    Some(mismatch) => {
                        bufs.response[..8].copy_from_slice(&(mismatch as u64).to_le_bytes());
                        -errno::EILSEQ
                    }
                    None => {
                        self.write(offset, &bufs.write.to_bytes());
                        0
                    }
                }
            }
            _ => -errno::EINVAL,
        }
    }
}

/// In-memory image implementing [`ImageTransport`]
#[derive(Debug)]
pub struct MemoryImage {
    info: ImageInfo,
    header: ImageHeader,
    store: Arc<ObjectStore>,
    log: Arc<Mutex<Vec<SubmissionRecord>>>,
    faults: Mutex<Faults>,
    latency: Mutex<Option<Duration>>,
    compare_and_write: AtomicBool,
    rejected: AtomicU64,
}

impl MemoryImage {
    /// Create an image of `size` bytes with default properties
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self::from_info(ImageInfo::new(name, size))
    }

    /// Create an image from explicit properties
    pub fn from_info(info: ImageInfo) -> Self {
        let store = ObjectStore::new(info.size, info.object_size);
        Self {
            info,
            header: ImageHeader::new(),
            store: Arc::new(store),
            log: Arc::new(Mutex::new(Vec::new())),
            faults: Mutex::new(Faults::default()),
            latency: Mutex::new(None),
            compare_and_write: AtomicBool::new(true),
            rejected: AtomicU64::new(0),
        }
    }

    /// Create an image from its configuration entry
    pub fn from_config(config: &ImageConfig) -> LunResult<Self> {
        config.validate()?;
        let mut info = ImageInfo::new(config.name.clone(), config.size)
            .with_native_block_size(config.native_block_size)
            .with_object_size(config.object_size)
            .with_queue_depth(config.queue_depth);
        info.discard = config.discard.then(|| DiscardLimits {
            max_discard_sectors: config
                .max_discard_sectors
                .unwrap_or(config.object_size >> 9),
            granularity: config
                .discard_granularity
                .unwrap_or(config.object_size as u32),
            alignment: 0,
        });

        let image = Self::from_info(info);
        if let Some(us) = config.latency_us {
            image.set_latency(Some(Duration::from_micros(us)));
        }
        if !config.compare_and_write {
            image.compare_and_write.store(false, Ordering::Relaxed);
        }
        debug!(
            "Created memory image {} ({} bytes, {} byte objects)",
            config.name, config.size, config.object_size
        );
        Ok(image)
    }

    /// Set discard support
    pub fn with_discard(mut self, discard: Option<DiscardLimits>) -> Self {
        self.info.discard = discard;
        self
    }

    /// Set the native block size
    pub fn with_native_block_size(mut self, size: BlockSize) -> Self {
        self.info.native_block_size = size;
        self
    }

    /// Set the minimum and optimal I/O sizes
    pub fn with_io_hints(mut self, io_min: u32, io_opt: u32) -> Self {
        self.info.io_min = io_min;
        self.info.io_opt = io_opt;
        self
    }

    /// Set the alignment offset in bytes
    pub fn with_alignment_offset(mut self, offset: u32) -> Self {
        self.info.alignment_offset = offset;
        self
    }

    /// Set the completion latency
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(Some(latency));
        self
    }

    /// Refuse compare-and-write requests at fill time
    pub fn without_compare_and_write(self) -> Self {
        self.compare_and_write.store(false, Ordering::Relaxed);
        self
    }

    /// Change the completion latency
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Reject every submission (of `op`, or all ops when `None`) with `code`
    pub fn fail_submissions(&self, op: Option<ImageOp>, code: i32) {
        self.faults.lock().reject = Some((op, code));
    }

    /// Complete the `n`-th accepted request of `op` (1-based) with `code`
    /// instead of executing it
    pub fn fail_nth(&self, op: ImageOp, n: u64, code: i32) {
        self.faults.lock().fail_nth.push(NthFailure { op, n, code });
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        let mut faults = self.faults.lock();
        faults.reject = None;
        faults.fail_nth.clear();
    }

    /// Accepted submissions, in submission order
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.log.lock().clone()
    }

    /// Accepted submissions of one operation
    pub fn submissions_of(&self, op: ImageOp) -> Vec<SubmissionRecord> {
        self.log
            .lock()
            .iter()
            .filter(|r| r.op == op)
            .cloned()
            .collect()
    }

    /// Number of refused submissions
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Number of allocated objects
    pub fn allocated_objects(&self) -> usize {
        self.store.objects.len()
    }

    /// Read image contents directly, bypassing the request path
    pub fn read_at(&self, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.store.read(offset, &mut buf);
        buf
    }

    /// Write image contents directly, bypassing the request path
    pub fn write_at(&self, offset: u64, data: &[u8]) {
        self.store.write(offset, data);
    }
}

impl ImageTransport for MemoryImage {
    fn info(&self) -> &ImageInfo {
        &self.info
    }

    fn header(&self) -> &ImageHeader {
        &self.header
    }

    fn fill(&self, request: &mut ImageRequest) -> Result<(), i32> {
        if request.op() == ImageOp::CompareAndWrite && !self.compare_and_write.load(Ordering::Relaxed)
        {
            return Err(-errno::EOPNOTSUPP);
        }
        Ok(())
    }

    fn submit(&self, mut io: InFlight) -> Result<(), SubmitError> {
        let op = io.request().op();

        let injected = {
            let mut faults = self.faults.lock();
            if let Some(code) = faults.reject_code(op) {
                drop(faults);
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(SubmitError::new(code, io));
            }
            faults.next_failure(op)
        };

        let Ok(handle) = Handle::try_current() else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(SubmitError::new(-errno::ENOTCONN, io));
        };

        let index = {
            let request = io.request();
            let mut log = self.log.lock();
            log.push(SubmissionRecord {
                id: request.id(),
                op,
                offset: request.offset(),
                length: request.length(),
                snap_seq: request.snapshot().map(|s| s.seq()),
                submitted_at: Instant::now(),
                completed_at: None,
                result: None,
            });
            log.len() - 1
        };

        let store = Arc::clone(&self.store);
        let log = Arc::clone(&self.log);
        let latency = *self.latency.lock();

        handle.spawn(async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            let result = match injected {
                Some(code) => code,
                None => store.execute(io.request_mut()),
            };
            trace!("Image request {} ({}) -> {}", io.request().id(), op, result);
            if let Some(record) = log.lock().get_mut(index) {
                record.completed_at = Some(Instant::now());
                record.result = Some(result);
            }
            io.complete(result);
        });
        Ok(())
    }
}
