//! Block commands
//!
//! A [`Command`] is one operation already decoded by the front end. It owns
//! its completion sink and is terminated exactly once: either explicitly
//! through [`Command::complete`] or, if it is dropped on some path that
//! forgot to complete it, by its `Drop` impl with a communication failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Notify, oneshot};
use tracing::error;

use crate::engine::CompletionSink;
use crate::error::{Failure, ScsiStatus, SenseData};
use crate::request::ScatterList;

/// Command kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// READ
    Read,
    /// WRITE
    Write,
    /// UNMAP
    Unmap,
    /// WRITE SAME
    WriteSame,
    /// WRITE SAME with the unmap bit
    WriteSameUnmap,
    /// COMPARE AND WRITE
    CompareAndWrite,
    /// SYNCHRONIZE CACHE
    SyncCache,
}

impl CommandKind {
    /// Whether the command modifies the device
    pub fn is_write_class(&self) -> bool {
        !matches!(self, Self::Read | Self::SyncCache)
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "READ"),
            Self::Write => write!(f, "WRITE"),
            Self::Unmap => write!(f, "UNMAP"),
            Self::WriteSame => write!(f, "WRITE SAME"),
            Self::WriteSameUnmap => write!(f, "WRITE SAME (UNMAP)"),
            Self::CompareAndWrite => write!(f, "COMPARE AND WRITE"),
            Self::SyncCache => write!(f, "SYNCHRONIZE CACHE"),
        }
    }
}

/// One UNMAP block descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnmapDescriptor {
    /// Starting LBA
    pub lba: u64,
    /// Number of blocks
    pub nolb: u64,
}

impl UnmapDescriptor {
    /// Create a descriptor
    pub fn new(lba: u64, nolb: u64) -> Self {
        Self { lba, nolb }
    }
}

#[derive(Debug, Default)]
struct InterruptInner {
    raised: AtomicBool,
    notify: Notify,
}

/// Interrupt handle for a command waiting on the compare-and-write slot.
///
/// Clones share state; raising any clone interrupts every waiter.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    inner: Arc<InterruptInner>,
}

impl Interrupt {
    /// Create an interrupt handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the interrupt
    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check whether the interrupt was raised
    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Wait until the interrupt is raised
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

/// Final outcome of a command
#[derive(Debug)]
pub struct CommandOutcome {
    /// Command tag
    pub tag: u64,
    /// Command kind
    pub kind: CommandKind,
    /// Success or the failure reported to the initiator
    pub status: Result<(), Failure>,
    /// Data read (READ only)
    pub data: Option<ScatterList>,
}

impl CommandOutcome {
    /// Check whether the command succeeded
    pub fn is_good(&self) -> bool {
        self.status.is_ok()
    }

    /// SCSI status byte
    pub fn scsi_status(&self) -> ScsiStatus {
        match &self.status {
            Ok(()) => ScsiStatus::Good,
            Err(failure) => failure.status(),
        }
    }

    /// Sense data, if the status carries any
    pub fn sense(&self) -> Option<SenseData> {
        self.status.as_ref().err().and_then(Failure::sense)
    }
}

/// Receiving half of a command created with [`Command::channel`]
pub type CommandReceiver = oneshot::Receiver<CommandOutcome>;

/// One inbound block command
#[derive(Debug)]
pub struct Command {
    tag: u64,
    kind: CommandKind,
    lba: u64,
    nolb: u64,
    data: Option<ScatterList>,
    compare: Option<ScatterList>,
    descriptors: Vec<UnmapDescriptor>,
    protection: bool,
    interrupt: Option<Interrupt>,
    sink: Option<CompletionSink<CommandOutcome>>,
}

impl Command {
    /// Create a command completing into `sink`
    pub fn new(kind: CommandKind, lba: u64, nolb: u64, sink: CompletionSink<CommandOutcome>) -> Self {
        static TAGS: AtomicU64 = AtomicU64::new(1);
        Self {
            tag: TAGS.fetch_add(1, Ordering::Relaxed),
            kind,
            lba,
            nolb,
            data: None,
            compare: None,
            descriptors: Vec::new(),
            protection: false,
            interrupt: None,
            sink: Some(sink),
        }
    }

    /// Create a command together with a receiver for its outcome
    pub fn channel(kind: CommandKind, lba: u64, nolb: u64) -> (Self, CommandReceiver) {
        let (sink, rx) = CompletionSink::channel();
        (Self::new(kind, lba, nolb, sink), rx)
    }

    /// Set the tag
    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    /// Attach the data-out buffer (write data, write-same pattern)
    pub fn with_data(mut self, data: ScatterList) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach the compare buffer of a compare-and-write
    pub fn with_compare(mut self, compare: ScatterList) -> Self {
        self.compare = Some(compare);
        self
    }

    /// Attach UNMAP block descriptors
    pub fn with_descriptors(mut self, descriptors: Vec<UnmapDescriptor>) -> Self {
        self.descriptors = descriptors;
        self
    }

    /// Mark the command as carrying protection information
    pub fn with_protection(mut self, protection: bool) -> Self {
        self.protection = protection;
        self
    }

    /// Attach an interrupt handle
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Tag
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Kind
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Starting LBA
    pub fn lba(&self) -> u64 {
        self.lba
    }

    /// Block count
    pub fn nolb(&self) -> u64 {
        self.nolb
    }

    /// Data-out buffer
    pub fn data(&self) -> Option<&ScatterList> {
        self.data.as_ref()
    }

    /// Take the data-out buffer
    pub fn take_data(&mut self) -> Option<ScatterList> {
        self.data.take()
    }

    /// Take the compare buffer
    pub fn take_compare(&mut self) -> Option<ScatterList> {
        self.compare.take()
    }

    /// UNMAP descriptors
    pub fn descriptors(&self) -> &[UnmapDescriptor] {
        &self.descriptors
    }

    /// Whether protection information accompanies the data
    pub fn has_protection(&self) -> bool {
        self.protection
    }

    /// Interrupt handle
    pub fn interrupt(&self) -> Option<&Interrupt> {
        self.interrupt.as_ref()
    }

    /// Complete the command
    pub fn complete(mut self, status: Result<(), Failure>) {
        self.finish(status, None);
    }

    /// Complete a READ with the data read
    pub fn complete_with_data(mut self, data: ScatterList) {
        self.finish(Ok(()), Some(data));
    }

    fn finish(&mut self, status: Result<(), Failure>, data: Option<ScatterList>) {
        if let Some(sink) = self.sink.take() {
            sink.complete(CommandOutcome {
                tag: self.tag,
                kind: self.kind,
                status,
                data,
            });
        }
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        if self.sink.is_some() {
            error!(
                "Command {} ({}) dropped without completion",
                self.tag, self.kind
            );
            self.finish(Err(Failure::CommunicationFailure), None);
        }
    }
}
