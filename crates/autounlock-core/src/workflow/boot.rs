use super::{event, DeviceBinding, WorkflowEvent, WorkflowLevel};
use crate::config::AutounlockConfig;
use crate::dracut::{missing_from_listing, render_dropin, DROPIN_MODE};
use crate::error::{AutounlockError, AutounlockResult};
use crate::journal::{Journal, Mutation};
use crate::persist::{read_optional, write_atomic};
use autounlock_provider::BootProvider;
use log::info;
use std::path::PathBuf;

/// Rewrite the dracut drop-in, rebuild the initramfs, and confirm every key
/// file made it into the image.
pub(crate) fn update_boot_image<T>(
    config: &AutounlockConfig,
    boot: &T,
    bindings: &[DeviceBinding],
    journal: &mut Journal,
    events: &mut Vec<WorkflowEvent>,
) -> AutounlockResult<()>
where
    T: BootProvider<Error = AutounlockError>,
{
    let path = &config.paths.dracut_conf;
    let keyfiles: Vec<PathBuf> = bindings
        .iter()
        .map(|binding| binding.request.key_file.clone())
        .collect();

    let previous = read_optional(path)?;
    journal.record(Mutation::DropinWritten {
        path: path.clone(),
        previous,
    });
    write_atomic(path, render_dropin(&keyfiles).as_bytes(), DROPIN_MODE)?;
    events.push(event(
        WorkflowLevel::Success,
        format!("Wrote {} with {} key file(s)", path.display(), keyfiles.len()),
    ));

    info!("rebuilding the initramfs; this can take a while");
    journal.record(Mutation::InitramfsRebuilt);
    boot.rebuild_initramfs()?;
    events.push(event(WorkflowLevel::Success, "Rebuilt the initramfs"));

    let listing = boot.initramfs_listing()?;
    let missing = missing_from_listing(&listing, &keyfiles);
    if !missing.is_empty() {
        return Err(AutounlockError::Provider(format!(
            "initramfs is missing key file(s): {}",
            missing.join(", ")
        )));
    }
    events.push(event(
        WorkflowLevel::Success,
        format!("Initramfs contains all {} key file(s)", keyfiles.len()),
    ));
    Ok(())
}

pub(crate) fn update_boot_loader<T>(
    config: &AutounlockConfig,
    boot: &T,
    events: &mut Vec<WorkflowEvent>,
) -> AutounlockResult<()>
where
    T: BootProvider<Error = AutounlockError>,
{
    boot.regenerate_boot_config()?;
    events.push(event(
        WorkflowLevel::Success,
        format!("Regenerated {}", config.paths.grub_config.display()),
    ));
    Ok(())
}
