//! Record of completed mutations and their compensating actions.
//!
//! Each stage records what it changed right after the change succeeds. When a
//! later stage fails, [`Journal::rollback`] undoes the records newest-first.
//! An initramfs rebuild cannot be undone in place; it is redone once, after
//! the configuration it was built from has been restored.

use crate::dracut::DROPIN_MODE;
use crate::error::AutounlockError;
use crate::keyfile::write_raw_key_file;
use crate::persist::{remove_if_exists, write_atomic};
use autounlock_provider::{BootProvider, LuksProvider};
use log::{error, info};
use std::path::PathBuf;
use zeroize::Zeroizing;

/// One completed mutation.
pub enum Mutation {
    /// The crypttab was rewritten; `original` is `None` when it did not exist.
    CrypttabRewritten {
        path: PathBuf,
        original: Option<Vec<u8>>,
    },
    KeyFileWritten {
        path: PathBuf,
        previous: Option<Zeroizing<Vec<u8>>>,
    },
    KeySlotAdded {
        device: PathBuf,
        keyfile: PathBuf,
    },
    DropinWritten {
        path: PathBuf,
        previous: Option<Vec<u8>>,
    },
    InitramfsRebuilt,
}

impl Mutation {
    pub fn describe(&self) -> String {
        match self {
            Mutation::CrypttabRewritten { path, .. } => format!("rewrote {}", path.display()),
            Mutation::KeyFileWritten { path, previous } => match previous {
                Some(_) => format!("replaced key file {}", path.display()),
                None => format!("created key file {}", path.display()),
            },
            Mutation::KeySlotAdded { device, keyfile } => format!(
                "enrolled {} into a key slot on {}",
                keyfile.display(),
                device.display()
            ),
            Mutation::DropinWritten { path, .. } => format!("rewrote {}", path.display()),
            Mutation::InitramfsRebuilt => "rebuilt the initramfs".to_string(),
        }
    }
}

#[derive(Default)]
pub struct Journal {
    records: Vec<Mutation>,
}

impl Journal {
    pub fn record(&mut self, mutation: Mutation) {
        self.records.push(mutation);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Undo every record newest-first. Returns the compensations that failed.
    pub fn rollback<L, B>(self, luks: &L, boot: &B) -> Vec<String>
    where
        L: LuksProvider<Error = AutounlockError>,
        B: BootProvider<Error = AutounlockError>,
    {
        let mut failures = Vec::new();
        let mut rebuild = false;

        for mutation in self.records.into_iter().rev() {
            let summary = mutation.describe();
            let outcome = match mutation {
                Mutation::InitramfsRebuilt => {
                    rebuild = true;
                    continue;
                }
                Mutation::CrypttabRewritten { path, original } => match original {
                    Some(bytes) => write_atomic(&path, &bytes, 0o600),
                    None => remove_if_exists(&path),
                },
                Mutation::KeyFileWritten { path, previous } => match previous {
                    Some(bytes) => write_raw_key_file(&path, &bytes),
                    None => remove_if_exists(&path),
                },
                Mutation::KeySlotAdded { device, keyfile } => luks.remove_key(&device, &keyfile),
                Mutation::DropinWritten { path, previous } => match previous {
                    Some(bytes) => write_atomic(&path, &bytes, DROPIN_MODE),
                    None => remove_if_exists(&path),
                },
            };

            match outcome {
                Ok(()) => info!("rolled back: {summary}"),
                Err(err) => {
                    error!("rollback failed ({summary}): {err}");
                    failures.push(format!("could not undo `{summary}`: {err}"));
                }
            }
        }

        if rebuild {
            match boot.rebuild_initramfs() {
                Ok(()) => info!("rolled back: rebuilt the initramfs from restored configuration"),
                Err(err) => {
                    error!("rollback failed (initramfs rebuild): {err}");
                    failures.push(format!("could not rebuild the initramfs: {err}"));
                }
            }
        }

        failures
    }
}
