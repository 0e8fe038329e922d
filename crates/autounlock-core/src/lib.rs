//! Core building blocks for configuring keyfile-based LUKS auto-unlock.
//!
//! Configuration, the crypttab model, key material handling, and the
//! transactional workflow live here so the binary only has to wire host
//! providers to an operator surface.

pub mod config;
pub mod crypttab;
pub mod dracut;
pub mod error;
pub mod journal;
pub mod keyfile;
pub mod logging;
pub mod persist;
pub mod workflow;

pub use autounlock_provider::{BlockDeviceIndex, BootProvider, ExistingKey, LuksProvider};
pub use config::{AutounlockConfig, ConfigFormat, Tool, ToolPaths};
pub use crypttab::{Crypttab, CrypttabEntry};
pub use error::{AutounlockError, AutounlockResult};
pub use journal::{Journal, Mutation};
pub use workflow::{
    check_volumes, collect_volumes, configure_autounlock, DeviceBinding, Providers,
    VolumeRequest, WorkflowEvent, WorkflowLevel, WorkflowReport,
};
