use std::fmt;

use bytes::Bytes;

use crate::Sector;

/// Completion status of an I/O request, surfaced to its issuer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Ok,
    /// Teardown has begun; the device no longer admits requests.
    Deleting,
    /// The baseline reference is released and the drain is in progress.
    Busy,
    /// No backing target is bound.
    NoTarget,
    /// The forwarded clone could not be constructed.
    CloneFailed,
    /// The backing device failed the forwarded request.
    Io,
}

impl IoStatus {
    #[must_use]
    pub fn is_ok(self) -> bool {
        matches!(self, IoStatus::Ok)
    }
}

/// One read or write, addressed in sectors.
#[derive(Debug)]
pub enum IoOp {
    /// Read `len` bytes starting at the request offset; the data arrives in
    /// the completion outcome.
    Read { len: usize },
    /// Write the payload. Forwarding shares the payload without copying.
    Write { data: Bytes },
}

/// What the completion callback receives: the read data on success (empty for
/// writes), or the failure status.
pub type IoOutcome = Result<Bytes, IoStatus>;

type OnComplete = Box<dyn FnOnce(IoOutcome) + Send + 'static>;

/// An inbound request handed to [`Device::forward`](crate::Device::forward).
///
/// The completion callback runs exactly once, possibly on a different thread
/// than the issuer's, and possibly after `forward` has already returned.
pub struct IoRequest {
    pub(crate) start: Sector,
    pub(crate) op: IoOp,
    pub(crate) complete: Completion,
}

impl fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoRequest")
            .field("start", &self.start)
            .field("op", &self.op)
            .finish_non_exhaustive()
    }
}

impl IoRequest {
    pub fn read(
        start: Sector,
        len: usize,
        complete: impl FnOnce(IoOutcome) + Send + 'static,
    ) -> Self {
        Self {
            start,
            op: IoOp::Read { len },
            complete: Completion::new(complete),
        }
    }

    pub fn write(
        start: Sector,
        data: Bytes,
        complete: impl FnOnce(IoOutcome) + Send + 'static,
    ) -> Self {
        Self {
            start,
            op: IoOp::Write { data },
            complete: Completion::new(complete),
        }
    }

    #[must_use]
    pub fn start(&self) -> Sector {
        self.start
    }

    /// Complete the request with a failure and hand the status back.
    pub(crate) fn fail(self, status: IoStatus) -> IoStatus {
        self.complete.complete(Err(status));
        status
    }
}

/// Exactly-once completion. Dropping it unfired fails the request with
/// [`IoStatus::Io`], so the issuer is never left hanging.
pub(crate) struct Completion(Option<OnComplete>);

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

impl Completion {
    fn new(f: impl FnOnce(IoOutcome) + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub(crate) fn complete(mut self, outcome: IoOutcome) {
        if let Some(f) = self.0.take() {
            f(outcome);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f(Err(IoStatus::Io));
        }
    }
}
