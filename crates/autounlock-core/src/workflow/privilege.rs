use crate::config::{AutounlockConfig, ToolPaths};
use crate::error::{AutounlockError, AutounlockResult};
use log::debug;

/// Fail unless the process runs with an effective UID of 0.
pub fn ensure_privilege() -> AutounlockResult<()> {
    if running_as_root() {
        Ok(())
    } else {
        Err(AutounlockError::Privilege(
            "must be run as root: key files, /etc/crypttab, the initramfs, and the boot loader configuration are all root-owned"
                .into(),
        ))
    }
}

/// Resolve every external tool before anything is touched, `cryptsetup` first.
pub fn ensure_dependencies(config: &AutounlockConfig) -> AutounlockResult<ToolPaths> {
    let tools = config.resolve_tools()?;
    debug!("tool paths: {tools:?}");
    Ok(tools)
}

#[cfg(unix)]
fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}
