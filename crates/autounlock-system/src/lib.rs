#![forbid(unsafe_code)]

//! Host-backed providers for luks-autounlock.
//!
//! Integrates with the host via:
//! - `blkid` (UUID to device resolution, UUID read-back)
//! - `cryptsetup` (isLuks, luksUUID, luksAddKey, luksRemoveKey)
//! - `dracut` + `lsinitrd` (initramfs rebuild and audit)
//! - `grub2-mkconfig` (boot loader configuration)

mod block;
mod boot;
mod command;
mod luks;

pub use block::SystemBlockIndex;
pub use boot::SystemBootProvider;
pub use luks::SystemLuksProvider;
