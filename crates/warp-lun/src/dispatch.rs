//! Command dispatch
//!
//! [`Device::execute`] routes a command to its execution path. Read, write
//! and write-same go to the engine with a continuation and return without
//! waiting. Unmap and compare-and-write wait for their image requests, but
//! the command, the compare-and-write slot and the in-flight count are held
//! by the request completions, not by the `execute` future.
//!
//! Every path ends in exactly one completion of the command. Failures found
//! before anything was submitted are also returned to the caller.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::backend::ImageTransport;
use crate::caw::AcquireOutcome;
use crate::command::{Command, CommandKind, UnmapDescriptor};
use crate::device::{Device, DeviceStats, InFlightGuard};
use crate::engine::{CompletionSink, Engine, RequestCompletion};
use crate::error::Failure;
use crate::geometry::Geometry;
use crate::request::{ImageOp, ImageRequest, RequestBuilder, RequestPayload, ScatterList};
use crate::snapshot::SnapshotRef;

/// Segment size used for read buffers
const READ_SEGMENT_SIZE: usize = 64 * 1024;

impl Device {
    /// Execute a command.
    ///
    /// The command is completed exactly once through its sink. `Ok(())`
    /// means it either completed successfully or was handed to the engine
    /// and will complete later; `Err` repeats a failure already delivered to
    /// the sink.
    pub async fn execute(&self, cmd: Command) -> Result<(), Failure> {
        let (guard, state) = self.begin();
        trace!(
            "{}: {} tag={} lba={} nolb={}",
            self.name(),
            cmd.kind(),
            cmd.tag(),
            cmd.lba(),
            cmd.nolb()
        );

        if !state.is_usable() {
            return self.finish(cmd, guard, Err(Failure::CommunicationFailure));
        }

        let carries_data = matches!(
            cmd.kind(),
            CommandKind::Read
                | CommandKind::Write
                | CommandKind::WriteSame
                | CommandKind::CompareAndWrite
        );
        if carries_data && cmd.has_protection() {
            return self.finish(
                cmd,
                guard,
                Err(Failure::invalid("protection information not supported")),
            );
        }

        match cmd.kind() {
            CommandKind::Read | CommandKind::Write => self.execute_rw(cmd, guard),
            CommandKind::Unmap => self.execute_unmap(cmd, guard).await,
            CommandKind::WriteSame => self.execute_write_same(cmd, guard),
            CommandKind::WriteSameUnmap => self.execute_write_same_unmap(cmd, guard).await,
            CommandKind::CompareAndWrite => self.execute_compare_and_write(cmd, guard).await,
            CommandKind::SyncCache => {
                // Completed image writes are already on the image
                self.stats.lock().record_sync_cache();
                self.finish(cmd, guard, Ok(()))
            }
        }
    }

    fn execute_rw(&self, mut cmd: Command, guard: InFlightGuard) -> Result<(), Failure> {
        let is_write = cmd.kind() == CommandKind::Write;
        if cmd.nolb() == 0 {
            return self.finish(cmd, guard, Ok(()));
        }
        if is_write && self.is_read_only() {
            return self.finish(cmd, guard, Err(Failure::WriteProtected));
        }

        let (offset, length) = match self.geometry().byte_range(cmd.lba(), cmd.nolb()) {
            Ok(range) => range,
            Err(failure) => return self.finish(cmd, guard, Err(failure)),
        };
        let Ok(len) = usize::try_from(length) else {
            return self.finish(cmd, guard, Err(Failure::ResourceExhausted));
        };

        let (op, payload, snapc) = if is_write {
            match cmd.take_data() {
                Some(data) if data.len() == len => (
                    ImageOp::Write,
                    RequestPayload::Data(data),
                    Some(self.transport().header().acquire()),
                ),
                Some(data) => {
                    let failure = Failure::invalid(format!(
                        "write data is {} bytes, range is {}",
                        data.len(),
                        len
                    ));
                    return self.finish(cmd, guard, Err(failure));
                }
                None => {
                    return self.finish(cmd, guard, Err(Failure::invalid("write without data")));
                }
            }
        } else {
            match ScatterList::zeroed(len, READ_SEGMENT_SIZE) {
                Ok(buf) => (ImageOp::Read, RequestPayload::Data(buf), None),
                Err(failure) => return self.finish(cmd, guard, Err(failure)),
            }
        };

        let request = match self.build(op, offset, length, payload, snapc) {
            Ok(request) => request,
            Err(failure) => return self.finish(cmd, guard, Err(failure)),
        };
        let record: fn(&mut DeviceStats, u64) = if is_write {
            DeviceStats::record_write
        } else {
            DeviceStats::record_read
        };
        let sink = self.continuation(cmd, guard, record);
        self.engine.submit(request, sink)
    }

    async fn execute_unmap(&self, cmd: Command, guard: InFlightGuard) -> Result<(), Failure> {
        if !self.config().emulate_tpu {
            return self.finish(cmd, guard, Err(Failure::invalid("unmap not enabled")));
        }
        // Without a descriptor list the command's own range is unmapped
        let descriptors = match cmd.descriptors() {
            [] if cmd.nolb() > 0 => vec![UnmapDescriptor::new(cmd.lba(), cmd.nolb())],
            list => list.to_vec(),
        };
        self.unmap(cmd, guard, descriptors).await
    }

    fn execute_write_same(&self, mut cmd: Command, guard: InFlightGuard) -> Result<(), Failure> {
        if self.is_read_only() {
            return self.finish(cmd, guard, Err(Failure::WriteProtected));
        }

        let block_size = self.geometry().block_size() as usize;
        let pattern = match cmd.take_data() {
            Some(pattern) if pattern.nents() == 1 && pattern.len() == block_size => pattern,
            other => {
                let failure = Failure::invalid(format!(
                    "write same pattern must be one {} byte segment, got {} bytes in {} segments",
                    block_size,
                    other.as_ref().map_or(0, ScatterList::len),
                    other.as_ref().map_or(0, ScatterList::nents)
                ));
                return self.finish(cmd, guard, Err(failure));
            }
        };

        let nolb = match self.write_same_blocks(&cmd) {
            Ok(nolb) => nolb,
            Err(failure) => return self.finish(cmd, guard, Err(failure)),
        };
        let (offset, length) = match self.geometry().byte_range(cmd.lba(), nolb) {
            Ok(range) => range,
            Err(failure) => return self.finish(cmd, guard, Err(failure)),
        };

        let snapc = self.transport().header().acquire();
        let request = match self.build(
            ImageOp::WriteSame,
            offset,
            length,
            RequestPayload::Data(pattern),
            Some(snapc),
        ) {
            Ok(request) => request,
            Err(failure) => return self.finish(cmd, guard, Err(failure)),
        };
        let sink = self.continuation(cmd, guard, |stats, _| stats.record_write_same());
        self.engine.submit(request, sink)
    }

    async fn execute_write_same_unmap(
        &self,
        cmd: Command,
        guard: InFlightGuard,
    ) -> Result<(), Failure> {
        if !self.config().emulate_tpws {
            return self.finish(
                cmd,
                guard,
                Err(Failure::invalid("write same with unmap not enabled")),
            );
        }
        let range = match self.write_same_blocks(&cmd) {
            Ok(nolb) => UnmapDescriptor::new(cmd.lba(), nolb),
            Err(failure) => return self.finish(cmd, guard, Err(failure)),
        };
        self.unmap(cmd, guard, vec![range]).await
    }

    async fn execute_compare_and_write(
        &self,
        mut cmd: Command,
        guard: InFlightGuard,
    ) -> Result<(), Failure> {
        if !self.config().emulate_caw {
            return self.finish(cmd, guard, Err(Failure::invalid("compare and write not enabled")));
        }
        if self.is_read_only() {
            return self.finish(cmd, guard, Err(Failure::WriteProtected));
        }
        if cmd.nolb() == 0 {
            return self.finish(cmd, guard, Ok(()));
        }

        let (offset, length) = match self.geometry().byte_range(cmd.lba(), cmd.nolb()) {
            Ok(range) => range,
            Err(failure) => return self.finish(cmd, guard, Err(failure)),
        };
        let (compare, write) = match (cmd.take_compare(), cmd.take_data()) {
            (Some(compare), Some(write))
                if compare.len() as u64 == length && write.len() as u64 == length =>
            {
                (compare, write)
            }
            _ => {
                let failure =
                    Failure::invalid(format!("compare and write needs two {length} byte buffers"));
                return self.finish(cmd, guard, Err(failure));
            }
        };

        let interrupt = cmd.interrupt().cloned();
        let permit = match self.caw.acquire(interrupt.as_ref()).await {
            AcquireOutcome::Acquired(permit) => permit,
            AcquireOutcome::Interrupted => {
                debug!("{}: tag {} interrupted waiting for compare and write", self.name(), cmd.tag());
                return self.finish(cmd, guard, Err(Failure::CommunicationFailure));
            }
        };

        let snapc = self.transport().header().acquire();
        let request = match self.builder.build_compare_and_write(
            self.transport().as_ref(),
            offset,
            length,
            compare,
            write,
            snapc,
        ) {
            Ok(request) => request,
            Err(failure) => {
                drop(permit);
                self.stats.lock().record_compare_and_write(false);
                return self.finish(cmd, guard, Err(failure));
            }
        };

        // The completion owns the slot and the command from here on
        let (done, rx) = oneshot::channel();
        let stats = Arc::clone(&self.stats);
        let sink = CompletionSink::callback(move |completion: RequestCompletion| {
            drop(completion.payload);
            drop(permit);
            drop(guard);
            let status = completion.status;
            {
                let mut stats = stats.lock();
                stats.record_compare_and_write(matches!(status, Err(Failure::Miscompare { .. })));
                if status.is_err() {
                    stats.record_error();
                }
            }
            if let Err(failure) = &status {
                debug!("{} tag {} failed: {}", cmd.kind(), cmd.tag(), failure);
            }
            cmd.complete(status.clone());
            let _ = done.send(status);
        });
        // A refused submission reaches the sink as well
        let _ = self.engine.submit(request, sink);
        rx.await.unwrap_or(Err(Failure::CommunicationFailure))
    }

    /// Validate the descriptors and issue their discards one after another
    /// from completion context. Returns the status the command completed
    /// with.
    async fn unmap(
        &self,
        cmd: Command,
        guard: InFlightGuard,
        descriptors: Vec<UnmapDescriptor>,
    ) -> Result<(), Failure> {
        let chunk = match self.check_unmap(&descriptors) {
            Ok(chunk) => chunk,
            Err(failure) => return self.finish(cmd, guard, Err(failure)),
        };

        let (done, rx) = oneshot::channel();
        UnmapJob {
            engine: Arc::clone(&self.engine),
            builder: Arc::clone(&self.builder),
            transport: Arc::clone(self.transport()),
            geometry: *self.geometry(),
            chunk,
            descriptors,
            index: 0,
            issued: 0,
            stats: Arc::clone(&self.stats),
            cmd,
            guard,
            done,
        }
        .issue();
        rx.await.unwrap_or(Err(Failure::CommunicationFailure))
    }

    /// Check an unmap before anything is issued and return the sub-range
    /// size in blocks (`None` when unlimited)
    fn check_unmap(&self, descriptors: &[UnmapDescriptor]) -> Result<Option<u64>, Failure> {
        if self.is_read_only() {
            return Err(Failure::WriteProtected);
        }
        let caps = self.capabilities();
        if !caps.discard_supported {
            return Err(Failure::invalid("image does not support discard"));
        }
        for desc in descriptors {
            self.geometry().byte_range(desc.lba, desc.nolb)?;
        }
        Ok(caps.unmap_chunk_blocks())
    }

    /// Block count of a write same; 0 means through the end of the device
    fn write_same_blocks(&self, cmd: &Command) -> Result<u64, Failure> {
        let capacity = self.geometry().capacity_blocks();
        let nolb = match cmd.nolb() {
            0 => capacity.saturating_sub(cmd.lba()),
            n => n,
        };
        if nolb == 0 {
            return Err(Failure::LbaOutOfRange {
                lba: cmd.lba(),
                nolb,
                capacity,
            });
        }
        let max = u64::from(self.config().max_write_same_len);
        if nolb > max {
            return Err(Failure::invalid(format!(
                "write same of {nolb} blocks exceeds {max}"
            )));
        }
        Ok(nolb)
    }

    fn build(
        &self,
        op: ImageOp,
        offset: u64,
        length: u64,
        payload: RequestPayload,
        snapc: Option<SnapshotRef>,
    ) -> Result<ImageRequest, Failure> {
        self.builder
            .build(self.transport().as_ref(), op, offset, length, payload, snapc)
    }

    /// Continuation for commands that complete from the engine's context
    fn continuation(
        &self,
        cmd: Command,
        guard: InFlightGuard,
        record: fn(&mut DeviceStats, u64),
    ) -> CompletionSink<RequestCompletion> {
        let stats = Arc::clone(&self.stats);
        CompletionSink::callback(move |completion: RequestCompletion| {
            drop(guard);
            match completion.status {
                Ok(()) => {
                    record(&mut stats.lock(), completion.length);
                    match completion.payload {
                        RequestPayload::Data(data) if cmd.kind() == CommandKind::Read => {
                            cmd.complete_with_data(data)
                        }
                        _ => cmd.complete(Ok(())),
                    }
                }
                Err(failure) => {
                    debug!(
                        "{} tag {} failed: {} (result {})",
                        cmd.kind(),
                        cmd.tag(),
                        failure,
                        completion.result
                    );
                    stats.lock().record_error();
                    cmd.complete(Err(failure));
                }
            }
        })
    }

    /// Complete a command that never reached the engine, or whose image
    /// requests already finished
    fn finish(
        &self,
        cmd: Command,
        guard: InFlightGuard,
        status: Result<(), Failure>,
    ) -> Result<(), Failure> {
        drop(guard);
        if let Err(failure) = &status {
            debug!(
                "{}: {} tag {} failed: {}",
                self.name(),
                cmd.kind(),
                cmd.tag(),
                failure
            );
            self.stats.lock().record_error();
        }
        cmd.complete(status.clone());
        status
    }
}

/// Discards of one unmap command.
///
/// Each discard is issued from the completion of the previous one, and the
/// last completion finishes the command. The first failure stops the chain.
struct UnmapJob {
    engine: Arc<Engine>,
    builder: Arc<RequestBuilder>,
    transport: Arc<dyn ImageTransport>,
    geometry: Geometry,
    chunk: Option<u64>,
    descriptors: Vec<UnmapDescriptor>,
    /// Descriptor being worked on
    index: usize,
    /// Blocks of that descriptor already issued
    issued: u64,
    stats: Arc<Mutex<DeviceStats>>,
    cmd: Command,
    guard: InFlightGuard,
    done: oneshot::Sender<Result<(), Failure>>,
}

impl UnmapJob {
    /// Next sub-range as `(lba, nolb)`
    fn next_range(&mut self) -> Option<(u64, u64)> {
        while let Some(desc) = self.descriptors.get(self.index).copied() {
            let remaining = desc.nolb - self.issued;
            if remaining == 0 {
                self.index += 1;
                self.issued = 0;
                continue;
            }
            let nolb = self.chunk.map_or(remaining, |c| c.min(remaining));
            let lba = desc.lba + self.issued;
            self.issued += nolb;
            return Some((lba, nolb));
        }
        None
    }

    fn issue(mut self) {
        let Some((lba, nolb)) = self.next_range() else {
            return self.finish(Ok(()));
        };
        let built = self.geometry.byte_range(lba, nolb).and_then(|(offset, length)| {
            trace!("tag {}: discard offset={} len={}", self.cmd.tag(), offset, length);
            let snapc = self.transport.header().acquire();
            self.builder.build(
                self.transport.as_ref(),
                ImageOp::Discard,
                offset,
                length,
                RequestPayload::None,
                Some(snapc),
            )
        });
        let request = match built {
            Ok(request) => request,
            Err(failure) => return self.finish(Err(failure)),
        };

        let engine = Arc::clone(&self.engine);
        let sink = CompletionSink::callback(move |completion: RequestCompletion| {
            match completion.status {
                Ok(()) => self.issue(),
                Err(failure) => self.finish(Err(failure)),
            }
        });
        // A refused submission reaches the sink as well
        let _ = engine.submit(request, sink);
    }

    fn finish(self, status: Result<(), Failure>) {
        let Self {
            descriptors,
            stats,
            cmd,
            guard,
            done,
            ..
        } = self;
        drop(guard);
        match &status {
            Ok(()) => stats
                .lock()
                .record_unmap(descriptors.iter().map(|d| d.nolb).sum()),
            Err(failure) => {
                debug!("{} tag {} failed: {}", cmd.kind(), cmd.tag(), failure);
                stats.lock().record_error();
            }
        }
        cmd.complete(status.clone());
        let _ = done.send(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryImage;
    use crate::command::CommandReceiver;
    use crate::config::DeviceConfig;
    use crate::geometry::BlockSize;

    const MIB: u64 = 1024 * 1024;

    fn device(config: DeviceConfig) -> (Device, Arc<MemoryImage>) {
        let image = Arc::new(MemoryImage::new("rbd/disk0", 4 * MIB));
        let device = Device::attach(config, image.clone()).unwrap();
        (device, image)
    }

    fn config() -> DeviceConfig {
        DeviceConfig::new("lun0", "rbd/disk0").block_size(BlockSize::B4096)
    }

    async fn outcome(rx: CommandReceiver) -> crate::command::CommandOutcome {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (device, image) = device(config());
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 253) as u8).collect();

        let (cmd, rx) = Command::channel(CommandKind::Write, 3, 2);
        device
            .execute(cmd.with_data(ScatterList::from_slice(&data)))
            .await
            .unwrap();
        assert!(outcome(rx).await.is_good());
        assert_eq!(image.read_at(3 * 4096, 8192), data);

        let (cmd, rx) = Command::channel(CommandKind::Read, 3, 2);
        device.execute(cmd).await.unwrap();
        let result = outcome(rx).await;
        assert!(result.is_good());
        assert_eq!(&result.data.unwrap().to_bytes()[..], &data[..]);

        let stats = device.stats();
        assert_eq!(stats.write_ops, 1);
        assert_eq!(stats.bytes_read, 8192);
        assert_eq!(device.inflight(), 0);
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let (device, image) = device(config().read_only());

        let (cmd, rx) = Command::channel(CommandKind::Write, 0, 1);
        let err = device
            .execute(cmd.with_data(ScatterList::from_slice(&[0; 4096])))
            .await
            .unwrap_err();
        assert_eq!(err, Failure::WriteProtected);
        assert_eq!(outcome(rx).await.status, Err(Failure::WriteProtected));
        assert!(image.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range() {
        let (device, image) = device(config());
        let (cmd, rx) = Command::channel(CommandKind::Read, 1023, 2);
        assert!(matches!(
            device.execute(cmd).await,
            Err(Failure::LbaOutOfRange { capacity: 1024, .. })
        ));
        assert!(!outcome(rx).await.is_good());
        assert!(image.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_protection_rejected() {
        let (device, image) = device(config());
        let (cmd, rx) = Command::channel(CommandKind::Write, 0, 1);
        let cmd = cmd
            .with_data(ScatterList::from_slice(&[0; 4096]))
            .with_protection(true);
        assert!(matches!(
            device.execute(cmd).await,
            Err(Failure::InvalidParameter(_))
        ));
        assert!(matches!(
            outcome(rx).await.status,
            Err(Failure::InvalidParameter(_))
        ));
        assert!(image.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_write_length_mismatch() {
        let (device, _image) = device(config());
        let (cmd, rx) = Command::channel(CommandKind::Write, 0, 2);
        assert!(
            device
                .execute(cmd.with_data(ScatterList::from_slice(&[0; 4096])))
                .await
                .is_err()
        );
        assert!(matches!(
            outcome(rx).await.status,
            Err(Failure::InvalidParameter(_))
        ));
    }

    #[tokio::test]
    async fn test_sync_cache() {
        let (device, image) = device(config());
        let (cmd, rx) = Command::channel(CommandKind::SyncCache, 0, 0);
        device.execute(cmd).await.unwrap();
        assert!(outcome(rx).await.is_good());
        assert!(image.submissions().is_empty());
        assert_eq!(device.stats().sync_cache_ops, 1);
    }

    #[tokio::test]
    async fn test_unmap_requires_enable() {
        let (device, image) = device(config());
        let (cmd, rx) = Command::channel(CommandKind::Unmap, 0, 0);
        let cmd = cmd.with_descriptors(vec![UnmapDescriptor::new(0, 8)]);
        assert!(device.execute(cmd).await.is_err());
        assert!(matches!(
            outcome(rx).await.status,
            Err(Failure::InvalidParameter(_))
        ));
        assert!(image.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_unmap_without_descriptors_uses_command_range() {
        let (device, image) = device(config().thin_provisioning());

        let (cmd, rx) = Command::channel(CommandKind::Unmap, 10, 4);
        device.execute(cmd).await.unwrap();
        assert!(outcome(rx).await.is_good());

        let discards = image.submissions_of(ImageOp::Discard);
        assert_eq!(discards.len(), 1);
        assert_eq!(discards[0].offset, 40960);
        assert_eq!(discards[0].length, 16384);
        assert_eq!(device.stats().unmap_blocks, 4);

        // Nothing to unmap at all
        let (cmd, rx) = Command::channel(CommandKind::Unmap, 0, 0);
        device.execute(cmd).await.unwrap();
        assert!(outcome(rx).await.is_good());
        assert_eq!(image.submissions_of(ImageOp::Discard).len(), 1);
    }

    #[tokio::test]
    async fn test_write_same_to_end_of_device() {
        let (device, image) = device(config());
        let (cmd, rx) = Command::channel(CommandKind::WriteSame, 1000, 0);
        let cmd = cmd.with_data(ScatterList::from_slice(&[0xee; 4096]));
        device.execute(cmd).await.unwrap();
        assert!(outcome(rx).await.is_good());

        let records = image.submissions_of(ImageOp::WriteSame);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset, 1000 * 4096);
        assert_eq!(records[0].length, 24 * 4096);
        assert_eq!(image.read_at(1023 * 4096, 4096), vec![0xee; 4096]);
    }

    #[tokio::test]
    async fn test_write_same_over_limit() {
        let mut config = config();
        config.max_write_same_len = 16;
        let (device, image) = device(config);
        let (cmd, rx) = Command::channel(CommandKind::WriteSame, 0, 17);
        let cmd = cmd.with_data(ScatterList::from_slice(&[0; 4096]));
        assert!(device.execute(cmd).await.is_err());
        assert!(!outcome(rx).await.is_good());
        assert!(image.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_compare_and_write_disabled() {
        let (device, _image) = device(config().no_compare_and_write());
        let (cmd, rx) = Command::channel(CommandKind::CompareAndWrite, 0, 1);
        let cmd = cmd
            .with_compare(ScatterList::from_slice(&[0; 4096]))
            .with_data(ScatterList::from_slice(&[1; 4096]));
        assert!(device.execute(cmd).await.is_err());
        assert!(matches!(
            outcome(rx).await.status,
            Err(Failure::InvalidParameter(_))
        ));
        assert!(!device.is_compare_and_write_held());
    }

    #[tokio::test]
    async fn test_compare_and_write_unsupported_by_image() {
        let image = Arc::new(MemoryImage::new("rbd/disk0", 4 * MIB).without_compare_and_write());
        let device = Device::attach(config(), image.clone()).unwrap();
        let (cmd, rx) = Command::channel(CommandKind::CompareAndWrite, 0, 1);
        let cmd = cmd
            .with_compare(ScatterList::from_slice(&[0; 4096]))
            .with_data(ScatterList::from_slice(&[1; 4096]));
        assert!(matches!(
            device.execute(cmd).await,
            Err(Failure::InvalidParameter(_))
        ));
        assert!(matches!(
            outcome(rx).await.status,
            Err(Failure::InvalidParameter(_))
        ));
        assert!(!device.is_compare_and_write_held());
        assert!(image.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_detached_device_fails_commands() {
        let registry = crate::device::DeviceRegistry::new();
        let image = Arc::new(MemoryImage::new("rbd/disk0", 4 * MIB));
        let device = registry.attach(config(), image).unwrap();
        registry.detach(device.id()).unwrap();

        let (cmd, rx) = Command::channel(CommandKind::Read, 0, 1);
        assert_eq!(
            device.execute(cmd).await,
            Err(Failure::CommunicationFailure)
        );
        assert!(!outcome(rx).await.is_good());
    }
}
