//! Error types
//!
//! Two layers of errors live here:
//!
//! - [`LunError`] covers the management plane (configuration, attach,
//!   detach, registry lookups).
//! - [`Failure`] is the outcome vocabulary of a single block command. Backend
//!   errno values are classified into a `Failure` at the engine boundary and
//!   never travel further up.

use std::io;

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Management-plane result type
pub type LunResult<T> = Result<T, LunError>;

/// Management-plane errors
#[derive(Debug, Error)]
pub enum LunError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Exported or native block size is not one of 512/1024/2048/4096
    #[error("Unsupported block size: {0}")]
    UnsupportedBlockSize(u32),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device name already registered
    #[error("Device already exists: {0}")]
    DeviceExists(String),

    /// Image not found
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// Device still has outstanding work
    #[error("Device is busy ({inflight} commands in flight, compare-and-write held: {caw_held})")]
    DeviceBusy {
        /// Commands not yet completed
        inflight: u64,
        /// Whether the compare-and-write slot is held
        caw_held: bool,
    },

    /// Logging could not be initialized
    #[error("Logging error: {0}")]
    Logging(String),
}

/// Backend errno values understood by the engine.
///
/// Transports report results as a non-negative success value or one of
/// these, negated.
pub mod errno {
    /// Operation not permitted
    pub const EPERM: i32 = 1;
    /// I/O error
    pub const EIO: i32 = 5;
    /// Try again
    pub const EAGAIN: i32 = 11;
    /// Out of memory
    pub const ENOMEM: i32 = 12;
    /// Device or resource busy
    pub const EBUSY: i32 = 16;
    /// Invalid argument
    pub const EINVAL: i32 = 22;
    /// Illegal byte sequence (compare-and-write mismatch)
    pub const EILSEQ: i32 = 84;
    /// Operation not supported
    pub const EOPNOTSUPP: i32 = 95;
    /// Transport endpoint is not connected
    pub const ENOTCONN: i32 = 107;
    /// Connection timed out
    pub const ETIMEDOUT: i32 = 110;
    /// Operation canceled
    pub const ECANCELED: i32 = 125;
}

/// Outcome of a failed block command
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    /// Transient shortage of memory, descriptor slots or transport queue
    /// space. The caller may retry.
    #[error("Resource exhausted")]
    ResourceExhausted,

    /// Backend or network fault
    #[error("Logical unit communication failure")]
    CommunicationFailure,

    /// Caller supplied something the device cannot execute
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Compare step of a compare-and-write found different data
    #[error("Miscompare at byte offset {offset}")]
    Miscompare {
        /// Byte offset of the first differing byte, relative to the start
        /// of the compared range
        offset: u64,
    },

    /// Range extends past the end of the device
    #[error("LBA out of range: lba {lba} + {nolb} blocks exceeds capacity {capacity}")]
    LbaOutOfRange {
        /// Starting LBA
        lba: u64,
        /// Block count
        nolb: u64,
        /// Device capacity in blocks
        capacity: u64,
    },

    /// Write-class command on a read-only device
    #[error("Device is write protected")]
    WriteProtected,
}

impl Failure {
    /// Shorthand for an invalid-parameter failure
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidParameter(reason.into())
    }

    /// Classify a code returned when the transport refused a submission
    pub fn from_submit_code(code: i32) -> Self {
        match -code {
            errno::ENOMEM | errno::EAGAIN | errno::EBUSY => Self::ResourceExhausted,
            _ => Self::CommunicationFailure,
        }
    }

    /// Classify a code returned by the transport's fill step
    pub fn from_fill_code(code: i32) -> Self {
        match -code {
            errno::EOPNOTSUPP => Self::invalid("operation not supported by image"),
            _ => Self::ResourceExhausted,
        }
    }

    /// Classify a completion result code.
    ///
    /// `None` means success. Miscompare is not produced here because it needs
    /// the response buffer; the engine handles `EILSEQ` itself.
    pub fn from_completion_code(code: i32) -> Option<Self> {
        if code >= 0 {
            return None;
        }
        Some(match -code {
            errno::ENOMEM => Self::ResourceExhausted,
            errno::EOPNOTSUPP => Self::invalid("operation not supported by image"),
            _ => Self::CommunicationFailure,
        })
    }

    /// Whether the caller may usefully retry the command
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ResourceExhausted)
    }

    /// SCSI status byte reported for this failure
    pub fn status(&self) -> ScsiStatus {
        match self {
            Self::ResourceExhausted => ScsiStatus::TaskSetFull,
            _ => ScsiStatus::CheckCondition,
        }
    }

    /// Sense data reported with CHECK CONDITION
    pub fn sense(&self) -> Option<SenseData> {
        let sense = match self {
            Self::ResourceExhausted => return None,
            Self::CommunicationFailure => SenseData::new(SenseKey::NotReady, 0x08, 0x00),
            Self::InvalidParameter(_) => SenseData::new(SenseKey::IllegalRequest, 0x24, 0x00),
            Self::Miscompare { offset } => {
                SenseData::new(SenseKey::Miscompare, 0x1d, 0x00).with_information(*offset)
            }
            Self::LbaOutOfRange { .. } => SenseData::new(SenseKey::IllegalRequest, 0x21, 0x00),
            Self::WriteProtected => SenseData::new(SenseKey::DataProtect, 0x27, 0x00),
        };
        Some(sense)
    }
}

/// SCSI status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScsiStatus {
    /// Good
    Good = 0x00,
    /// Check condition (sense data attached)
    CheckCondition = 0x02,
    /// Task set full
    TaskSetFull = 0x28,
}

impl ScsiStatus {
    /// Get the status byte
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Check if this is GOOD
    pub fn is_good(&self) -> bool {
        matches!(self, ScsiStatus::Good)
    }
}

impl std::fmt::Display for ScsiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScsiStatus::Good => write!(f, "GOOD"),
            ScsiStatus::CheckCondition => write!(f, "CHECK CONDITION"),
            ScsiStatus::TaskSetFull => write!(f, "TASK SET FULL"),
        }
    }
}

/// SCSI sense keys used by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SenseKey {
    /// Not ready
    NotReady = 0x02,
    /// Illegal request
    IllegalRequest = 0x05,
    /// Data protect
    DataProtect = 0x07,
    /// Miscompare
    Miscompare = 0x0e,
}

/// Fixed-format sense data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    /// Sense key
    pub key: SenseKey,
    /// Additional sense code
    pub asc: u8,
    /// Additional sense code qualifier
    pub ascq: u8,
    /// Information field
    pub information: Option<u64>,
}

impl SenseData {
    /// Fixed-format response code, current errors
    pub const RESPONSE_CODE: u8 = 0x70;
    /// Encoded size
    pub const SIZE: usize = 18;

    /// Create sense data without an information field
    pub fn new(key: SenseKey, asc: u8, ascq: u8) -> Self {
        Self {
            key,
            asc,
            ascq,
            information: None,
        }
    }

    /// Attach an information field value
    pub fn with_information(mut self, information: u64) -> Self {
        self.information = Some(information);
        self
    }

    /// Encode as fixed-format sense data.
    ///
    /// The information field is four bytes wide; larger values are
    /// truncated to the low 32 bits.
    pub fn encode(&self, buf: &mut BytesMut) {
        let valid = if self.information.is_some() { 0x80 } else { 0x00 };
        buf.put_u8(valid | Self::RESPONSE_CODE);
        buf.put_u8(0);
        buf.put_u8(self.key as u8);
        buf.put_u32(self.information.unwrap_or(0) as u32);
        buf.put_u8((Self::SIZE - 8) as u8);
        buf.put_u32(0);
        buf.put_u8(self.asc);
        buf.put_u8(self.ascq);
        buf.put_u8(0);
        buf.put_bytes(0, 3);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_code_mapping() {
        assert_eq!(
            Failure::from_submit_code(-errno::ENOMEM),
            Failure::ResourceExhausted
        );
        assert_eq!(
            Failure::from_submit_code(-errno::EBUSY),
            Failure::ResourceExhausted
        );
        assert_eq!(
            Failure::from_submit_code(-errno::EIO),
            Failure::CommunicationFailure
        );
        assert_eq!(
            Failure::from_submit_code(-errno::ENOTCONN),
            Failure::CommunicationFailure
        );
    }

    #[test]
    fn test_fill_code_mapping() {
        assert!(matches!(
            Failure::from_fill_code(-errno::EOPNOTSUPP),
            Failure::InvalidParameter(_)
        ));
        assert_eq!(
            Failure::from_fill_code(-errno::ENOMEM),
            Failure::ResourceExhausted
        );
    }

    #[test]
    fn test_completion_code_mapping() {
        assert_eq!(Failure::from_completion_code(0), None);
        assert_eq!(Failure::from_completion_code(4096), None);
        assert_eq!(
            Failure::from_completion_code(-errno::EIO),
            Some(Failure::CommunicationFailure)
        );
        assert_eq!(
            Failure::from_completion_code(-errno::ETIMEDOUT),
            Some(Failure::CommunicationFailure)
        );
    }

    #[test]
    fn test_status() {
        assert_eq!(Failure::ResourceExhausted.status(), ScsiStatus::TaskSetFull);
        assert_eq!(
            Failure::CommunicationFailure.status(),
            ScsiStatus::CheckCondition
        );
        assert!(Failure::ResourceExhausted.is_retryable());
        assert!(!Failure::Miscompare { offset: 3 }.is_retryable());
        assert!(ScsiStatus::Good.is_good());
        assert_eq!(ScsiStatus::TaskSetFull.code(), 0x28);
    }

    #[test]
    fn test_miscompare_sense() {
        let sense = Failure::Miscompare { offset: 513 }.sense().unwrap();
        assert_eq!(sense.key, SenseKey::Miscompare);
        assert_eq!((sense.asc, sense.ascq), (0x1d, 0x00));

        let mut buf = BytesMut::new();
        sense.encode(&mut buf);
        assert_eq!(buf.len(), SenseData::SIZE);
        assert_eq!(buf[0], 0xf0);
        assert_eq!(buf[2], 0x0e);
        assert_eq!(&buf[3..7], &513u32.to_be_bytes());
        assert_eq!(buf[7], 10);
        assert_eq!(buf[12], 0x1d);
    }

    #[test]
    fn test_sense_without_information() {
        let sense = Failure::WriteProtected.sense().unwrap();
        let mut buf = BytesMut::new();
        sense.encode(&mut buf);
        assert_eq!(buf[0], 0x70);
        assert_eq!(buf[2], SenseKey::DataProtect as u8);
        assert!(Failure::ResourceExhausted.sense().is_none());
    }
}
