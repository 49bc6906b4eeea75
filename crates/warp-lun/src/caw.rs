//! Compare-and-write serialization
//!
//! The compare and the write of a COMPARE AND WRITE cross the network as
//! one request, but nothing stops two of them racing on the same device.
//! Each device therefore owns a single [`CompareAndWriteSlot`]; a command
//! holds it from before the request is built until just before the command
//! completes.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::command::Interrupt;

/// Holding the compare-and-write slot. Dropping releases it.
#[derive(Debug)]
pub struct CompareAndWritePermit {
    _permit: OwnedSemaphorePermit,
}

/// Result of waiting for the slot
#[derive(Debug)]
pub enum AcquireOutcome {
    /// The slot is held
    Acquired(CompareAndWritePermit),
    /// The wait was interrupted; the slot is not held
    Interrupted,
}

/// Per-device binary gate for compare-and-write
#[derive(Debug)]
pub struct CompareAndWriteSlot {
    sem: Arc<Semaphore>,
}

impl Default for CompareAndWriteSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl CompareAndWriteSlot {
    /// Create a free slot
    pub fn new() -> Self {
        Self {
            sem: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait for the slot.
    ///
    /// With an interrupt handle the wait ends early once it is raised. An
    /// interrupt raised while the slot was being granted wins: the slot is
    /// released again and `Interrupted` returned.
    pub async fn acquire(&self, interrupt: Option<&Interrupt>) -> AcquireOutcome {
        let Some(interrupt) = interrupt else {
            return match Arc::clone(&self.sem).acquire_owned().await {
                Ok(permit) => AcquireOutcome::Acquired(CompareAndWritePermit { _permit: permit }),
                Err(_) => AcquireOutcome::Interrupted,
            };
        };

        if interrupt.is_raised() {
            return AcquireOutcome::Interrupted;
        }

        tokio::select! {
            biased;
            _ = interrupt.wait() => {
                debug!("Compare-and-write slot wait interrupted");
                AcquireOutcome::Interrupted
            }
            permit = Arc::clone(&self.sem).acquire_owned() => match permit {
                Ok(permit) if !interrupt.is_raised() => {
                    AcquireOutcome::Acquired(CompareAndWritePermit { _permit: permit })
                }
                _ => AcquireOutcome::Interrupted,
            },
        }
    }

    /// Take the slot if it is free
    pub fn try_acquire(&self) -> Option<CompareAndWritePermit> {
        Arc::clone(&self.sem)
            .try_acquire_owned()
            .ok()
            .map(|permit| CompareAndWritePermit { _permit: permit })
    }

    /// Check whether some command holds the slot
    pub fn is_held(&self) -> bool {
        self.sem.available_permits() == 0
    }
}

/// Read the miscompare offset a transport stored at the start of a
/// compare-and-write response buffer.
///
/// Returns `None` when the buffer is too short or the offset does not fall
/// inside the `length` compared bytes.
pub fn extract_miscompare_offset(response: &[u8], length: u64) -> Option<u64> {
    let raw: [u8; 8] = response.get(..8)?.try_into().ok()?;
    let offset = u64::from_le_bytes(raw);
    (offset < length).then_some(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_single_holder() {
        let slot = Arc::new(CompareAndWriteSlot::new());
        assert!(!slot.is_held());

        let first = match slot.acquire(None).await {
            AcquireOutcome::Acquired(p) => p,
            AcquireOutcome::Interrupted => panic!("uncontended acquire interrupted"),
        };
        assert!(slot.is_held());
        assert!(slot.try_acquire().is_none());

        let waiter = Arc::clone(&slot);
        let handle = tokio::spawn(async move {
            matches!(waiter.acquire(None).await, AcquireOutcome::Acquired(_))
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        drop(first);
        assert!(handle.await.unwrap());
        assert!(!slot.is_held());
    }

    #[tokio::test]
    async fn test_interrupted_wait_leaves_slot_free() {
        let slot = Arc::new(CompareAndWriteSlot::new());
        let held = slot.try_acquire().unwrap();

        let interrupt = Interrupt::new();
        let waiter = Arc::clone(&slot);
        let waiter_interrupt = interrupt.clone();
        let handle = tokio::spawn(async move {
            matches!(
                waiter.acquire(Some(&waiter_interrupt)).await,
                AcquireOutcome::Interrupted
            )
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        interrupt.raise();
        assert!(handle.await.unwrap());

        drop(held);
        assert!(!slot.is_held());
    }

    #[tokio::test]
    async fn test_already_interrupted() {
        let slot = CompareAndWriteSlot::new();
        let interrupt = Interrupt::new();
        interrupt.raise();
        assert!(matches!(
            slot.acquire(Some(&interrupt)).await,
            AcquireOutcome::Interrupted
        ));
        assert!(!slot.is_held());
    }

    #[test]
    fn test_extract_miscompare_offset() {
        let mut response = vec![0u8; 512 + 8];
        response[..8].copy_from_slice(&17u64.to_le_bytes());
        assert_eq!(extract_miscompare_offset(&response, 512), Some(17));
        assert_eq!(extract_miscompare_offset(&response, 17), None);
        assert_eq!(extract_miscompare_offset(&response[..4], 512), None);
    }
}
