#![forbid(unsafe_code)]

//! Provider contracts for the host tooling luks-autounlock drives.
//!
//! The workflow stages only ever talk to these traits, so they can be exercised
//! against in-memory doubles while the `autounlock-system` crate supplies the
//! implementations that shell out to the real utilities.

pub mod block;
pub mod boot;
pub mod luks;

pub use block::BlockDeviceIndex;
pub use boot::BootProvider;
pub use luks::{ExistingKey, LuksProvider};
