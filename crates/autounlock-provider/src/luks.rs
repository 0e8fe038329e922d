//! Provider contract for LUKS container introspection and key-slot management.
//!
//! Enrolling a new key always requires proof of an existing one, either a
//! passphrase typed by the operator or a key file that is already enrolled.

use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Credential used to authorise a key-slot change on an existing container.
pub enum ExistingKey {
    /// Passphrase bytes, handed to the tool over stdin.
    Passphrase(Zeroizing<Vec<u8>>),
    /// Path to a key file already enrolled in one of the container's slots.
    KeyFile(PathBuf),
}

impl ExistingKey {
    pub fn passphrase(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Passphrase(Zeroizing::new(bytes.into()))
    }

    /// True when the credential carries no material at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Passphrase(bytes) => bytes.is_empty(),
            Self::KeyFile(path) => path.as_os_str().is_empty(),
        }
    }
}

impl fmt::Debug for ExistingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passphrase(_) => f.write_str("Passphrase(<redacted>)"),
            Self::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
        }
    }
}

/// Abstraction over LUKS header inspection and key-slot commands.
pub trait LuksProvider {
    type Error: Error + Send + Sync + 'static;

    /// Whether the header on `device` is recognised as a LUKS container.
    fn is_luks(&self, device: &Path) -> Result<bool, Self::Error>;

    /// UUID embedded in the container header.
    fn luks_uuid(&self, device: &Path) -> Result<String, Self::Error>;

    /// Enroll the contents of `keyfile` into a free key slot on `device`,
    /// authenticating with `existing`.
    fn add_key(&self, device: &Path, existing: &ExistingKey, keyfile: &Path)
        -> Result<(), Self::Error>;

    /// Remove the key slot unlocked by the contents of `keyfile`.
    fn remove_key(&self, device: &Path, keyfile: &Path) -> Result<(), Self::Error>;
}
