//! Provider contract for the block-device UUID index (`blkid` on most hosts).

use std::error::Error;
use std::path::{Path, PathBuf};

/// Lookup in both directions between filesystem/container UUIDs and device nodes.
pub trait BlockDeviceIndex {
    type Error: Error + Send + Sync + 'static;

    /// Return the device node carrying `uuid`, or `None` when no device matches.
    fn device_by_uuid(&self, uuid: &str) -> Result<Option<PathBuf>, Self::Error>;

    /// Return the UUID recorded for `device`, or `None` when the index has none.
    fn device_uuid(&self, device: &Path) -> Result<Option<String>, Self::Error>;

    /// Whether `device` refers to a block-special file.
    fn is_block_device(&self, device: &Path) -> bool;
}
