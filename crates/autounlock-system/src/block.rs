//! `blkid`-backed [`BlockDeviceIndex`].

use crate::command::ToolCommand;
use autounlock_core::config::{AutounlockConfig, ToolPaths};
use autounlock_core::error::{AutounlockError, AutounlockResult};
use autounlock_provider::BlockDeviceIndex;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// `blkid` exits with 2 when nothing matched the query.
const BLKID_NOT_FOUND: i32 = 2;

#[derive(Debug, Clone)]
pub struct SystemBlockIndex {
    blkid: ToolCommand,
}

impl SystemBlockIndex {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self {
            blkid: ToolCommand::new(binary, timeout),
        }
    }

    pub fn from_config(tools: &ToolPaths, config: &AutounlockConfig) -> Self {
        Self::new(tools.blkid.clone(), config.command_timeout())
    }

    fn query(&self, args: &[&str]) -> AutounlockResult<Option<String>> {
        let out = self.blkid.run(args, None)?;
        match out.status {
            0 => {
                let value = out.stdout.lines().next().unwrap_or_default().trim();
                Ok((!value.is_empty()).then(|| value.to_string()))
            }
            BLKID_NOT_FOUND => Ok(None),
            status => Err(AutounlockError::Provider(format!(
                "{} {} failed: {} (exit code {status})",
                self.blkid.binary().display(),
                args.join(" "),
                out.diagnostic()
            ))),
        }
    }
}

impl BlockDeviceIndex for SystemBlockIndex {
    type Error = AutounlockError;

    fn device_by_uuid(&self, uuid: &str) -> AutounlockResult<Option<PathBuf>> {
        Ok(self.query(&["-U", uuid])?.map(PathBuf::from))
    }

    fn device_uuid(&self, device: &Path) -> AutounlockResult<Option<String>> {
        let dev = device.to_string_lossy();
        self.query(&["-s", "UUID", "-o", "value", dev.as_ref()])
    }

    fn is_block_device(&self, device: &Path) -> bool {
        fs::metadata(device)
            .map(|meta| meta.file_type().is_block_device())
            .unwrap_or(false)
    }
}
