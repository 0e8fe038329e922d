//! Provider contract for the early-boot tooling: initramfs builder and boot loader.

use std::error::Error;

pub trait BootProvider {
    type Error: Error + Send + Sync + 'static;

    /// Rebuild the initramfs image for the running kernel from current config.
    fn rebuild_initramfs(&self) -> Result<(), Self::Error>;

    /// Return the content listing of the current initramfs image.
    fn initramfs_listing(&self) -> Result<String, Self::Error>;

    /// Regenerate the boot loader menu configuration.
    fn regenerate_boot_config(&self) -> Result<(), Self::Error>;
}
