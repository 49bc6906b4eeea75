//! Submission and completion engine
//!
//! The engine hands built requests to the transport and turns backend result
//! codes into [`Failure`]s. Each submitted request travels inside an
//! [`InFlight`] envelope that owns both the request and its continuation.
//! Completing the envelope consumes it, so the result is recorded and the
//! continuation invoked exactly once. An envelope dropped without completion
//! reports a cancelled request.
//!
//! Completion order:
//!
//! 1. translate the result code (compare-and-write mismatches carry the
//!    miscompare offset from the response buffer)
//! 2. move the payload out and release the request, which drops its
//!    snapshot reference and descriptor slot
//! 3. invoke the continuation with a [`RequestCompletion`]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::backend::ImageTransport;
use crate::caw::extract_miscompare_offset;
use crate::error::{Failure, errno};
use crate::request::{ImageOp, ImageRequest, RequestPayload};

/// Where a completion is delivered
pub enum CompletionSink<T> {
    /// A waiter blocked on the receiving half
    Sync(oneshot::Sender<T>),
    /// A continuation run on the completing context
    Async(Box<dyn FnOnce(T) + Send + 'static>),
}

impl<T> CompletionSink<T> {
    /// Create a synchronous sink and its receiver
    pub fn channel() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self::Sync(tx), rx)
    }

    /// Create an asynchronous sink from a continuation
    pub fn callback(f: impl FnOnce(T) + Send + 'static) -> Self {
        Self::Async(Box::new(f))
    }

    /// Deliver the value, consuming the sink
    pub fn complete(self, value: T) {
        match self {
            Self::Sync(tx) => {
                if tx.send(value).is_err() {
                    trace!("Completion waiter went away");
                }
            }
            Self::Async(f) => f(value),
        }
    }
}

impl<T> std::fmt::Debug for CompletionSink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync(_) => write!(f, "CompletionSink::Sync"),
            Self::Async(_) => write!(f, "CompletionSink::Async"),
        }
    }
}

/// Result of one image request
#[derive(Debug)]
pub struct RequestCompletion {
    /// Request id
    pub id: u64,
    /// Operation
    pub op: ImageOp,
    /// Byte offset
    pub offset: u64,
    /// Byte length
    pub length: u64,
    /// Raw result code reported by the transport
    pub result: i32,
    /// Translated outcome
    pub status: Result<(), Failure>,
    /// Payload handed back to the caller (read data lives here)
    pub payload: RequestPayload,
}

/// Engine counters
#[derive(Debug, Default)]
pub struct EngineStats {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCounters {
    /// Requests accepted by the transport
    pub submitted: u64,
    /// Requests the transport refused
    pub rejected: u64,
    /// Requests completed, successfully or not
    pub completed: u64,
    /// Completed requests with a failure status
    pub failed: u64,
    /// Requests dropped by the transport without a result
    pub cancelled: u64,
}

impl EngineStats {
    fn snapshot(&self) -> EngineCounters {
        EngineCounters {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Continuation half of an [`InFlight`]; reports a cancellation if dropped
/// while still armed
struct Completer {
    id: u64,
    op: ImageOp,
    offset: u64,
    length: u64,
    sink: Option<CompletionSink<RequestCompletion>>,
    stats: Arc<EngineStats>,
}

impl Completer {
    fn finish(&mut self, result: i32, status: Result<(), Failure>, payload: RequestPayload) {
        let Some(sink) = self.sink.take() else {
            return;
        };
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        if status.is_err() {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        sink.complete(RequestCompletion {
            id: self.id,
            op: self.op,
            offset: self.offset,
            length: self.length,
            result,
            status,
            payload,
        });
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if self.sink.is_some() {
            warn!(
                "Request {} ({} offset={} len={}) dropped without completion",
                self.id, self.op, self.offset, self.length
            );
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            self.finish(
                -errno::ECANCELED,
                Err(Failure::CommunicationFailure),
                RequestPayload::None,
            );
        }
    }
}

/// A request handed to the transport, together with its continuation
pub struct InFlight {
    request: ImageRequest,
    completer: Completer,
}

impl InFlight {
    fn new(
        request: ImageRequest,
        sink: CompletionSink<RequestCompletion>,
        stats: Arc<EngineStats>,
    ) -> Self {
        let completer = Completer {
            id: request.id(),
            op: request.op(),
            offset: request.offset(),
            length: request.length(),
            sink: Some(sink),
            stats,
        };
        Self { request, completer }
    }

    /// The request
    pub fn request(&self) -> &ImageRequest {
        &self.request
    }

    /// The request, mutably (transports write read data and responses here)
    pub fn request_mut(&mut self) -> &mut ImageRequest {
        &mut self.request
    }

    /// Report the result and run the continuation.
    ///
    /// `result` is non-negative on success, a negative errno on failure.
    pub fn complete(self, result: i32) {
        let status = translate(&self.request, result);
        self.finish(result, status);
    }

    fn finish(self, result: i32, status: Result<(), Failure>) {
        let Self {
            mut request,
            mut completer,
        } = self;
        let payload = std::mem::take(&mut request.payload);
        drop(request);
        completer.finish(result, status, payload);
    }
}

impl std::fmt::Debug for InFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

/// Transport refused a submission; the envelope comes back untouched
#[derive(Debug)]
pub struct SubmitError {
    /// Negative errno
    pub code: i32,
    /// The refused envelope
    pub io: InFlight,
}

impl SubmitError {
    /// Create a rejection
    pub fn new(code: i32, io: InFlight) -> Self {
        Self { code, io }
    }
}

fn translate(request: &ImageRequest, result: i32) -> Result<(), Failure> {
    if result >= 0 {
        return Ok(());
    }

    if request.op() == ImageOp::CompareAndWrite && result == -errno::EILSEQ {
        if let RequestPayload::CompareAndWrite(bufs) = &request.payload {
            return match extract_miscompare_offset(&bufs.response, request.length()) {
                Some(offset) => Err(Failure::Miscompare { offset }),
                None => {
                    warn!(
                        "Request {}: miscompare offset outside compared range of {} bytes",
                        request.id(),
                        request.length()
                    );
                    Err(Failure::CommunicationFailure)
                }
            };
        }
    }

    match Failure::from_completion_code(result) {
        Some(failure) => Err(failure),
        None => Ok(()),
    }
}

/// Submits requests to one transport
pub struct Engine {
    transport: Arc<dyn ImageTransport>,
    stats: Arc<EngineStats>,
}

impl Engine {
    /// Create an engine over a transport
    pub fn new(transport: Arc<dyn ImageTransport>) -> Self {
        Self {
            transport,
            stats: Arc::new(EngineStats::default()),
        }
    }

    /// Counters
    pub fn counters(&self) -> EngineCounters {
        self.stats.snapshot()
    }

    /// Submit a request.
    ///
    /// The sink is invoked exactly once. When the transport refuses the
    /// request, the failure is delivered to the sink, the request released
    /// and the same failure returned here.
    pub fn submit(
        &self,
        request: ImageRequest,
        sink: CompletionSink<RequestCompletion>,
    ) -> Result<(), Failure> {
        let id = request.id();
        let op = request.op();
        let io = InFlight::new(request, sink, Arc::clone(&self.stats));

        match self.transport.submit(io) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                trace!("Submitted request {} ({})", id, op);
                Ok(())
            }
            Err(SubmitError { code, io }) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                let failure = Failure::from_submit_code(code);
                debug!("Transport rejected request {} ({}): {}", id, op, code);
                io.finish(code, Err(failure.clone()));
                Err(failure)
            }
        }
    }

    /// Submit and wait for the completion
    pub async fn submit_and_wait(&self, request: ImageRequest) -> RequestCompletion {
        let (id, op, offset, length) = (
            request.id(),
            request.op(),
            request.offset(),
            request.length(),
        );
        let (sink, rx) = CompletionSink::channel();
        // A refusal is delivered through the sink as well
        let _ = self.submit(request, sink);
        rx.await.unwrap_or_else(|_| RequestCompletion {
            id,
            op,
            offset,
            length,
            result: -errno::ECANCELED,
            status: Err(Failure::CommunicationFailure),
            payload: RequestPayload::None,
        })
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("image", &self.transport.info().name)
            .field("counters", &self.counters())
            .finish()
    }
}
