use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rustix::fs::FlockOperation;
use rustix::io::Errno;
use thiserror::Error;
use tokio::sync::OwnedSemaphorePermit;

use crate::request::{Completion, IoOp, IoStatus};
use crate::Sector;

/// Why a bind attempt was rejected. The device is left with no target bound
/// in every case.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("target path is empty")]
    InvalidPath,
    #[error("failed to open target: {0}")]
    Open(#[source] io::Error),
    #[error("failed to claim target holder lock: {0}")]
    HolderLink(#[source] Errno),
    #[error("target reports zero capacity")]
    ZeroCapacity,
    #[error("device is deleting")]
    Deleting,
}

/// Exclusive holder claim on the backing device. While held, no other holder
/// may claim the same device; released on drop.
#[derive(Debug)]
struct HolderLink(Arc<File>);

impl HolderLink {
    fn claim(handle: &Arc<File>) -> Result<Self, Errno> {
        rustix::fs::flock(&**handle, FlockOperation::NonBlockingLockExclusive)?;
        Ok(Self(Arc::clone(handle)))
    }
}

impl Drop for HolderLink {
    fn drop(&mut self) {
        if let Err(err) = rustix::fs::flock(&*self.0, FlockOperation::Unlock) {
            tracing::warn!(%err, "failed to release target holder lock");
        }
    }
}

/// A fully validated backing device.
///
/// Construction acquires the handle, the holder link and the capacity in that
/// order; every failure path releases exactly what it acquired, through drop.
/// Dropping a `BoundTarget` releases the holder link and closes the handle
/// once the last forwarded clone is done with it.
#[derive(Debug)]
pub(crate) struct BoundTarget {
    path: String,
    handle: Arc<File>,
    _holder: HolderLink,
    capacity: Sector,
}

impl BoundTarget {
    pub(crate) fn open(raw_path: &str) -> Result<Self, BindError> {
        let path = raw_path.trim();
        if path.is_empty() {
            return Err(BindError::InvalidPath);
        }

        let handle = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(BindError::Open)?;
        let handle = Arc::new(handle);
        let holder = HolderLink::claim(&handle).map_err(BindError::HolderLink)?;

        // Size query via seek covers both regular files and block nodes.
        // Capacity is whole sectors, the granularity the host publishes.
        let bytes = rustix::fs::seek(&*handle, rustix::fs::SeekFrom::End(0))
            .map_err(|errno| BindError::Open(errno.into()))?;
        let capacity = Sector(bytes >> Sector::SHIFT);
        if capacity == Sector(0) {
            return Err(BindError::ZeroCapacity);
        }

        Ok(Self {
            path: path.to_owned(),
            handle,
            _holder: holder,
            capacity,
        })
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn capacity(&self) -> Sector {
        self.capacity
    }

    /// Build the forwarded clone of `(start, op, complete)`, re-addressed to
    /// this target. Shallow: the write payload is shared, not copied.
    pub(crate) fn clone_request(
        &self,
        start: Sector,
        op: IoOp,
        complete: Completion,
        permit: OwnedSemaphorePermit,
    ) -> ForwardedIo {
        ForwardedIo {
            handle: Arc::clone(&self.handle),
            start,
            op,
            complete,
            _permit: permit,
        }
    }
}

/// A re-addressed copy of an inbound request. Executing it drives the
/// original request's completion; the pool permit is returned when the clone
/// is done.
pub(crate) struct ForwardedIo {
    handle: Arc<File>,
    start: Sector,
    op: IoOp,
    complete: Completion,
    _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for ForwardedIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardedIo")
            .field("start", &self.start)
            .field("op", &self.op)
            .finish_non_exhaustive()
    }
}

impl ForwardedIo {
    /// Runs on the submission pool's blocking context, concurrently with
    /// other completions and with binder/teardown activity.
    pub(crate) fn execute(self) {
        let Self {
            handle,
            start,
            op,
            complete,
            _permit,
        } = self;
        let off = start.bytes();
        let outcome = match op {
            IoOp::Read { len } => {
                let mut buf = BytesMut::zeroed(len);
                match handle.read_exact_at(&mut buf, off) {
                    Ok(()) => Ok(buf.freeze()),
                    Err(err) => {
                        tracing::error!(%err, %start, len, "forwarded read failed");
                        Err(IoStatus::Io)
                    }
                }
            }
            IoOp::Write { data } => match handle.write_all_at(&data, off) {
                Ok(()) => Ok(Bytes::new()),
                Err(err) => {
                    tracing::error!(%err, %start, len = data.len(), "forwarded write failed");
                    Err(IoStatus::Io)
                }
            },
        };
        complete.complete(outcome);
    }
}
