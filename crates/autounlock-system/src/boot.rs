//! Initramfs and boot loader regeneration via `dracut`, `lsinitrd`, and `grub2-mkconfig`.

use crate::command::ToolCommand;
use autounlock_core::config::{AutounlockConfig, ToolPaths};
use autounlock_core::error::{AutounlockError, AutounlockResult};
use autounlock_provider::BootProvider;
use log::debug;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct SystemBootProvider {
    dracut: ToolCommand,
    lsinitrd: ToolCommand,
    grub_mkconfig: ToolCommand,
    grub_config: PathBuf,
}

impl SystemBootProvider {
    /// `dracut` and `grub2-mkconfig` get the long initramfs timeout; `lsinitrd`
    /// gets the ordinary command timeout.
    pub fn from_config(tools: &ToolPaths, config: &AutounlockConfig) -> Self {
        let slow = config.initramfs_timeout();
        Self {
            dracut: ToolCommand::new(tools.dracut.clone(), slow),
            lsinitrd: ToolCommand::new(tools.lsinitrd.clone(), config.command_timeout()),
            grub_mkconfig: ToolCommand::new(tools.grub_mkconfig.clone(), slow),
            grub_config: config.paths.grub_config.clone(),
        }
    }
}

impl BootProvider for SystemBootProvider {
    type Error = AutounlockError;

    fn rebuild_initramfs(&self) -> AutounlockResult<()> {
        let out = self.dracut.run_checked(&["--force"])?;
        debug!("dracut: {}", out.stderr.trim());
        Ok(())
    }

    fn initramfs_listing(&self) -> AutounlockResult<String> {
        Ok(self.lsinitrd.run_checked(&[])?.stdout)
    }

    fn regenerate_boot_config(&self) -> AutounlockResult<()> {
        let target = self.grub_config.to_string_lossy();
        self.grub_mkconfig.run_checked(&["-o", target.as_ref()])?;
        Ok(())
    }
}
