use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::host::{DiskSpec, Host};
use crate::request::{IoRequest, IoStatus};
use crate::target::{BindError, BoundTarget};
use crate::{Config, Sector};

/// Lifecycle state shared between concurrent forwarders and the single
/// control-plane context.
///
/// The original single reference count (one baseline reference plus one per
/// admitted request) is split into two explicit pieces: `admitting` is the
/// baseline reference, closed exactly once by teardown, and `in_flight`
/// counts requests between admission and submission.
#[derive(Debug)]
struct Shared {
    /// Monotonic: set when teardown begins, never cleared.
    deleting: AtomicBool,
    /// Admission gate: while true, new requests may enter.
    admitting: AtomicBool,
    /// Requests admitted but not yet past submission. Never underflows.
    in_flight: AtomicUsize,
    drain_lock: Mutex<()>,
    drained: Condvar,
    /// Current binding. Swapped wholesale under the write lock; readers never
    /// observe a half-built target.
    target: RwLock<Option<BoundTarget>>,
}

// The gate store in `close_gate` must not reorder after the counter read in
// `wait_drained`, nor the counter increment in `acquire` after the gate read.
// Everything on the admission/drain protocol therefore uses SeqCst.
impl Shared {
    fn new() -> Self {
        Self {
            deleting: AtomicBool::new(false),
            admitting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            drain_lock: Mutex::new(()),
            drained: Condvar::new(),
            target: RwLock::new(None),
        }
    }

    /// Count ourselves in, then re-check the gate. Teardown closes the gate
    /// before waiting, so either it observes our increment or we observe the
    /// closed gate and bail out.
    fn acquire(&self) -> bool {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.admitting.load(Ordering::SeqCst) {
            true
        } else {
            self.release();
            false
        }
    }

    fn release(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "in-flight reference count underflow");
        if prev == 1 {
            // Empty critical section pairs with the re-check loop in
            // `wait_drained`; without it the notify could be lost between the
            // waiter's check and its sleep.
            drop(self.drain_lock.lock());
            self.drained.notify_all();
        }
    }

    /// Release the baseline reference. Returns whether this call was the one
    /// that closed the gate.
    fn close_gate(&self) -> bool {
        self.admitting.swap(false, Ordering::SeqCst)
    }

    /// Block until every admitted request has released its reference.
    /// Unbounded by design: a stuck submission stalls teardown indefinitely.
    fn wait_drained(&self) {
        let mut guard = self.drain_lock.lock();
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            self.drained.wait(&mut guard);
        }
    }
}

/// The virtual block device: forwards every request to the bound target.
///
/// Created by [`Device::create`], shared with the host (typically behind an
/// [`Arc`]), and shut down by [`Device::teardown`]. Dropping the device runs
/// the same teardown if it has not happened yet.
pub struct Device<H: Host> {
    host: H,
    name: String,
    state: Shared,
    /// Serializes bind/unbind/teardown-unbind against each other. Never held
    /// by forwarders.
    ctl_lock: Mutex<()>,
    /// Bounded pool of forwarded clones, the admission side of clone
    /// construction.
    pub(crate) pool: Arc<Semaphore>,
    rt: Handle,
}

impl<H: Host> fmt::Debug for Device<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<H: Host> Device<H> {
    /// Register the named disk with the host and bind the startup target if
    /// one is configured.
    ///
    /// A failed startup bind aborts creation; everything built up to that
    /// point (the host registration included) is torn down before returning
    /// the error. `rt` is where forwarded clones are submitted.
    pub fn create(config: &Config, host: H, rt: Handle) -> Result<Self> {
        config.validate().context("invalid device config")?;
        host.register(&DiskSpec::new(&config.name))
            .context("failed to register device with host")?;

        let dev = Self {
            host,
            name: config.name.clone(),
            state: Shared::new(),
            ctl_lock: Mutex::new(()),
            pool: Arc::new(Semaphore::new(config.submit_pool.get())),
            rt,
        };

        if let Some(path) = &config.target {
            // Dropping `dev` on the error path runs the full teardown of
            // whatever was built so far.
            dev.bind(path)
                .with_context(|| format!("failed to bind startup target {path:?}"))?;
        }
        tracing::info!(name = %dev.name, "device created");
        Ok(dev)
    }

    /// Forward one request to the bound target.
    ///
    /// The request is always completed: either right here with the admission
    /// failure, or later from the forwarded clone's completion. The returned
    /// status is the admission outcome; [`IoStatus::Ok`] means the clone was
    /// submitted.
    pub fn forward(&self, req: IoRequest) -> IoStatus {
        if self.state.deleting.load(Ordering::SeqCst) {
            tracing::error!("request rejected: device is deleting");
            return req.fail(IoStatus::Deleting);
        }
        if !self.state.acquire() {
            tracing::error!("request rejected: device is draining");
            return req.fail(IoStatus::Busy);
        }
        // The reference is held from admission to submission only; it
        // protects the binding lookup and clone construction, not the
        // clone's own lifetime. Guarded so a panicking completion callback
        // cannot stall the drain.
        let _release = scopeguard::guard((), |()| self.state.release());
        self.submit_clone(req)
    }

    fn submit_clone(&self, req: IoRequest) -> IoStatus {
        let slot = self.state.target.read();
        let Some(target) = slot.as_ref() else {
            // Defensive: a zero-capacity device normally has its I/O rejected
            // by the host before it ever reaches the forwarder.
            tracing::warn!("no target device bound");
            return req.fail(IoStatus::NoTarget);
        };

        let Ok(permit) = Arc::clone(&self.pool).try_acquire_owned() else {
            tracing::error!("submission pool exhausted, failed to clone request");
            return req.fail(IoStatus::CloneFailed);
        };
        let IoRequest {
            start,
            op,
            complete,
        } = req;
        let clone = target.clone_request(start, op, complete, permit);
        drop(slot);

        // Fire and forget; the clone completes the original from whatever
        // thread runs it.
        self.rt.spawn_blocking(move || clone.execute());
        IoStatus::Ok
    }

    /// Bind a backing target to an unbound device.
    fn bind(&self, raw_path: &str) -> Result<(), BindError> {
        let _ctl = self.ctl_lock.lock();
        self.bind_locked(raw_path)
    }

    fn bind_locked(&self, raw_path: &str) -> Result<(), BindError> {
        if self.state.deleting.load(Ordering::SeqCst) {
            return Err(BindError::Deleting);
        }
        let target = BoundTarget::open(raw_path)?;
        let capacity = target.capacity();
        tracing::info!(path = target.path(), %capacity, "target bound");
        {
            let mut slot = self.state.target.write();
            debug_assert!(slot.is_none(), "previous target must be released first");
            *slot = Some(target);
        }
        self.host.set_capacity(capacity);
        Ok(())
    }

    /// Release the bound target, if any. The device keeps running with zero
    /// capacity.
    pub fn unbind(&self) {
        let _ctl = self.ctl_lock.lock();
        self.unbind_locked();
    }

    fn unbind_locked(&self) {
        let prev = self.state.target.write().take();
        if let Some(target) = prev {
            self.host.set_capacity(Sector(0));
            tracing::info!(path = target.path(), "target released");
            // Drop unregisters the holder link and closes the handle.
        }
    }

    /// Control surface `SET target`: release the current target, then bind
    /// `path`. On failure the device is left with no target bound.
    pub fn set_target(&self, path: &str) -> Result<(), BindError> {
        let _ctl = self.ctl_lock.lock();
        self.unbind_locked();
        self.bind_locked(path)
            .inspect_err(|err| tracing::error!(%err, "failed to set target"))
    }

    /// Control surface `GET target`: the bound path, or `None` as the "no
    /// target" sentinel.
    #[must_use]
    pub fn target_path(&self) -> Option<String> {
        let slot = self.state.target.read();
        slot.as_ref().map(|target| target.path().to_owned())
    }

    /// Externally visible size in sectors; 0 while no target is bound.
    #[must_use]
    pub fn capacity(&self) -> Sector {
        let slot = self.state.target.read();
        slot.as_ref().map_or(Sector(0), BoundTarget::capacity)
    }

    /// Orderly shutdown: stop admitting requests, wait for every admitted
    /// request to release its reference, then release the target and the
    /// host registration.
    ///
    /// Safe to call more than once and concurrently with forwarders; exactly
    /// one caller performs the shutdown, the rest return immediately. The
    /// drain wait has no timeout.
    pub fn teardown(&self) {
        self.state.deleting.store(true, Ordering::SeqCst);
        if !self.state.close_gate() {
            return;
        }
        self.state.wait_drained();

        let _ctl = self.ctl_lock.lock();
        self.unbind_locked();
        if let Err(err) = self.host.unregister() {
            tracing::error!(%err, "failed to unregister device from host");
        }
        tracing::info!(name = %self.name, "device torn down");
    }
}

impl<H: Host> Drop for Device<H> {
    fn drop(&mut self) {
        self.teardown();
    }
}
