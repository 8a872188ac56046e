use std::io;

use crate::Sector;

/// Registration info for the virtual disk: a single-minor device with
/// 512-byte logical sectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    pub name: String,
    pub minors: u16,
    pub logical_block_size: u32,
}

impl DiskSpec {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            minors: 1,
            logical_block_size: Sector::SIZE,
        }
    }
}

/// The block-storage host this device registers with.
///
/// The host names the device, publishes its capacity, and routes application
/// I/O into [`Device::forward`](crate::Device::forward). Capacity updates
/// arrive whenever a target is bound or released; a host should reject I/O
/// against a zero-capacity device before it ever reaches the forwarder.
pub trait Host: Send + Sync + 'static {
    fn register(&self, spec: &DiskSpec) -> io::Result<()>;

    fn set_capacity(&self, sectors: Sector);

    /// Best-effort; failures are logged by the caller, never propagated.
    fn unregister(&self) -> io::Result<()>;
}
