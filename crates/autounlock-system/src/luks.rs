//! `cryptsetup`-backed [`LuksProvider`].

use crate::command::{mentions, ToolCommand, PERMISSION_HINTS};
use autounlock_core::config::{AutounlockConfig, ToolPaths};
use autounlock_core::error::{AutounlockError, AutounlockResult};
use autounlock_provider::{ExistingKey, LuksProvider};
use std::path::{Path, PathBuf};
use std::time::Duration;

const WRONG_KEY_HINTS: &[&str] = &[
    "no key available",
    "wrong key",
    "passphrase is incorrect",
    "invalid passphrase",
];

const NO_FREE_SLOT_HINTS: &[&str] = &[
    "no remaining keyslot",
    "no free key slot",
    "no free keyslot",
    "all key slots full",
];

const MISSING_DEVICE_HINTS: &[&str] = &[
    "no such file",
    "does not exist",
    "not found",
    "cannot open device",
];

/// Manages key slots through the host `cryptsetup` binary.
#[derive(Debug, Clone)]
pub struct SystemLuksProvider {
    cryptsetup: ToolCommand,
}

impl SystemLuksProvider {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self {
            cryptsetup: ToolCommand::new(binary, timeout),
        }
    }

    pub fn from_config(tools: &ToolPaths, config: &AutounlockConfig) -> Self {
        Self::new(tools.cryptsetup.clone(), config.command_timeout())
    }
}

impl LuksProvider for SystemLuksProvider {
    type Error = AutounlockError;

    fn is_luks(&self, device: &Path) -> AutounlockResult<bool> {
        let dev = device.to_string_lossy();
        let out = self.cryptsetup.run(&["isLuks", dev.as_ref()], None)?;
        Ok(out.status == 0)
    }

    fn luks_uuid(&self, device: &Path) -> AutounlockResult<String> {
        let dev = device.to_string_lossy();
        let out = self.cryptsetup.run_checked(&["luksUUID", dev.as_ref()])?;
        let uuid = out.stdout.trim();
        if uuid.is_empty() {
            return Err(AutounlockError::Provider(format!(
                "cryptsetup luksUUID printed nothing for {}",
                device.display()
            )));
        }
        Ok(uuid.to_string())
    }

    fn add_key(
        &self,
        device: &Path,
        existing: &ExistingKey,
        keyfile: &Path,
    ) -> AutounlockResult<()> {
        if existing.is_empty() {
            return Err(AutounlockError::Usage(
                "existing LUKS passphrase cannot be empty".into(),
            ));
        }

        let dev = device.to_string_lossy();
        let new_key = keyfile.to_string_lossy();
        let out = match existing {
            ExistingKey::Passphrase(secret) => self.cryptsetup.run(
                &[
                    "luksAddKey",
                    "--batch-mode",
                    "--key-file",
                    "-",
                    dev.as_ref(),
                    new_key.as_ref(),
                ],
                Some(secret.as_slice()),
            )?,
            ExistingKey::KeyFile(path) => {
                let existing_path = path.to_string_lossy();
                self.cryptsetup.run(
                    &[
                        "luksAddKey",
                        "--batch-mode",
                        "--key-file",
                        existing_path.as_ref(),
                        dev.as_ref(),
                        new_key.as_ref(),
                    ],
                    None,
                )?
            }
        };
        if out.status == 0 {
            return Ok(());
        }

        let message = classify_addkey_failure(device, keyfile, &out.diagnostic());
        Err(AutounlockError::Provider(format!(
            "{message} (exit code {})",
            out.status
        )))
    }

    fn remove_key(&self, device: &Path, keyfile: &Path) -> AutounlockResult<()> {
        let dev = device.to_string_lossy();
        let key = keyfile.to_string_lossy();
        let out = self
            .cryptsetup
            .run(&["luksRemoveKey", "--batch-mode", dev.as_ref(), key.as_ref()], None)?;
        if out.status == 0 {
            return Ok(());
        }

        let diagnostic = out.diagnostic();
        let hint = if mentions(&diagnostic, WRONG_KEY_HINTS) {
            ". The key file no longer matches any slot; remove the slot by number with `cryptsetup luksKillSlot`"
        } else {
            ""
        };
        Err(AutounlockError::Provider(format!(
            "cryptsetup could not remove the slot for {} from {}: {diagnostic}{hint} (exit code {})",
            keyfile.display(),
            device.display(),
            out.status
        )))
    }
}

fn classify_addkey_failure(device: &Path, keyfile: &Path, diagnostic: &str) -> String {
    let device = device.display();
    let keyfile = keyfile.display();

    if mentions(diagnostic, WRONG_KEY_HINTS) {
        return format!(
            "cryptsetup rejected the existing key while enrolling {keyfile} on {device}: {diagnostic}. Re-enter the current LUKS passphrase and retry"
        );
    }

    if mentions(diagnostic, &["not a valid luks device", "is not a luks device"]) {
        return format!(
            "cryptsetup refused to enroll {keyfile} because {device} is not a LUKS device: {diagnostic}"
        );
    }

    if mentions(diagnostic, NO_FREE_SLOT_HINTS) {
        return format!(
            "cryptsetup could not enroll {keyfile} because {device} has no free key slots: {diagnostic}. Remove an unused key slot before retrying"
        );
    }

    if mentions(diagnostic, PERMISSION_HINTS) {
        return format!(
            "cryptsetup could not enroll {keyfile} on {device}: {diagnostic}. This requires root"
        );
    }

    if mentions(diagnostic, MISSING_DEVICE_HINTS) {
        return format!(
            "cryptsetup could not access {device} while enrolling {keyfile}: {diagnostic}. Confirm the device is present"
        );
    }

    format!("cryptsetup failed to enroll {keyfile} on {device}: {diagnostic}")
}
