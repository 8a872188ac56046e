//! Forwarding virtual block device core.
//!
//! A [`Device`] owns no storage of its own: every I/O request handed to
//! [`Device::forward`] is re-addressed to the currently bound backing target
//! and resubmitted there, and the target's completion drives the original
//! request's completion. The interesting part is not the data path but the
//! lifecycle discipline around it:
//!
//! - requests are never forwarded once teardown has begun;
//! - the backing target is never released while a forwarder still holds a
//!   reference to the binding;
//! - [`Device::teardown`] deterministically waits for all admitted requests
//!   to release their references before touching shared resources.
//!
//! The host storage stack (device naming, capacity publication, routing of
//! application I/O) is the embedder's concern, consumed through the [`Host`]
//! trait. The operator-facing target attribute maps to
//! [`Device::target_path`] and [`Device::set_target`].

pub mod config;
mod device;
mod host;
mod request;
mod target;


use std::fmt;

pub use config::Config;
pub use device::Device;
pub use host::{DiskSpec, Host};
pub use request::{IoOp, IoOutcome, IoRequest, IoStatus};
pub use target::BindError;

/// Size or offset in unit of sectors (512bytes).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sector(pub u64);

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)?;
        "s".fmt(f)
    }
}

impl Sector {
    pub const SHIFT: u32 = 9;
    pub const SIZE: u32 = 1 << Self::SHIFT;

    #[must_use]
    pub const fn try_from_bytes(bytes: u64) -> Option<Self> {
        if bytes % Self::SIZE as u64 == 0 {
            Some(Self(bytes >> Self::SHIFT))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self.0.checked_mul(Self::SIZE as u64) {
            Some(bytes) => bytes,
            None => panic!("overflow"),
        }
    }
}
