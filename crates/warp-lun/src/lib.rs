#![allow(clippy::collapsible_if)]

//! Block Command Execution Engine for WARP Images
//!
//! This crate executes SCSI-style block commands against an asynchronous,
//! object-addressed image backend and reports every command back to its
//! issuer exactly once.
//!
//! # Features
//!
//! - READ, WRITE, UNMAP, WRITE SAME, WRITE SAME with UNMAP,
//!   COMPARE AND WRITE and SYNCHRONIZE CACHE
//! - Block size translation between the exported and native sizes
//! - Per-device compare-and-write serialization with interruptible waits
//! - Snapshot context pinning for every write-class request
//! - Bounded request slots per device
//! - Failure mapping onto SCSI status and sense data
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │   Command    │  issuer (fabric, CLI, tests)
//! └──────┬───────┘
//!        │ Device::execute
//! ┌──────▼───────┐     ┌───────────────────┐
//! │   dispatch   │────►│ CompareAndWriteSlot│
//! │  - geometry  │     └───────────────────┘
//! │  - unmap     │
//! └──────┬───────┘
//!        │ RequestBuilder (slot + SnapshotRef)
//! ┌──────▼───────┐
//! │    Engine    │  submit / complete exactly once
//! └──────┬───────┘
//!        │ ImageTransport
//! ┌──────▼───────┐
//! │ MemoryImage  │  or any other object store
//! └──────────────┘
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod caw;
pub mod command;
pub mod config;
pub mod device;
mod dispatch;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod logging;
pub mod request;
pub mod snapshot;

pub use backend::memory::{MemoryImage, SubmissionRecord};
pub use backend::{DiscardLimits, ImageInfo, ImageTransport};
pub use caw::{AcquireOutcome, CompareAndWriteSlot};
pub use command::{
    Command, CommandKind, CommandOutcome, CommandReceiver, Interrupt, UnmapDescriptor,
};
pub use config::{DeviceConfig, ImageConfig, LunConfig};
pub use device::{
    Device, DeviceCapabilities, DeviceId, DeviceInfo, DeviceRegistry, DeviceState, DeviceStats,
};
pub use engine::{CompletionSink, Engine, EngineCounters, InFlight, RequestCompletion, SubmitError};
pub use error::{Failure, LunError, LunResult, ScsiStatus, SenseData, SenseKey};
pub use geometry::{BlockSize, Geometry};
pub use logging::{LogConfig, LogFormat, LogLevel, init_logging};
pub use request::{ImageOp, ImageRequest, RequestBuilder, RequestPayload, ScatterList};
pub use snapshot::{ImageHeader, SnapContext, SnapshotRef};
