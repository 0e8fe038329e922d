//! Workflow orchestration: collect, guard, resolve, validate, then mutate.
//!
//! Nothing is written before every requested volume has resolved and
//! validated. From the first write onwards every mutation is journalled, and a
//! failure in any later stage rolls the journal back before the error is
//! returned.

mod boot;
mod privilege;
mod provisioning;
mod request;
mod resolve;

#[cfg(test)]
mod tests;

use crate::config::AutounlockConfig;
use crate::error::{AutounlockError, AutounlockResult};
use crate::journal::Journal;
use crate::keyfile::read_existing;
use autounlock_provider::{BlockDeviceIndex, BootProvider, ExistingKey, LuksProvider};
use log::{debug, error, warn};
use std::fs;
use std::path::{Path, PathBuf};

pub use privilege::{ensure_dependencies, ensure_privilege};
pub use request::collect_volumes;
pub use resolve::resolve_and_validate;

/// Severity levels used when reporting workflow events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowLevel {
    Info,
    Success,
    Warn,
    Error,
    Security,
}

/// Single line of output produced by a workflow step.
#[derive(Debug, Clone)]
pub struct WorkflowEvent {
    pub level: WorkflowLevel,
    pub message: String,
}

/// Aggregated report returned by any workflow entry point.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub title: String,
    pub events: Vec<WorkflowEvent>,
}

/// A volume the operator asked for, before it has been matched to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRequest {
    /// Mapping name as given, e.g. `luks-0b1d...`.
    pub name: String,
    /// Name with the `luks-` prefix stripped.
    pub uuid: String,
    pub key_file: PathBuf,
}

/// A request matched to a validated LUKS device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBinding {
    pub request: VolumeRequest,
    pub device: PathBuf,
    /// UUID read back from the LUKS header.
    pub uuid: String,
}

/// The host integrations a run needs.
pub struct Providers<'a, B, L, T> {
    pub block: &'a B,
    pub luks: &'a L,
    pub boot: &'a T,
}

/// Convenience constructor that wraps the repeated boilerplate.
pub(crate) fn event(level: WorkflowLevel, message: impl Into<String>) -> WorkflowEvent {
    WorkflowEvent {
        level,
        message: message.into(),
    }
}

/// Resolve and validate without touching anything; report what a run would do.
pub fn check_volumes<B, L, T>(
    config: &AutounlockConfig,
    providers: &Providers<'_, B, L, T>,
    requests: &[VolumeRequest],
) -> AutounlockResult<WorkflowReport>
where
    B: BlockDeviceIndex<Error = AutounlockError>,
    L: LuksProvider<Error = AutounlockError>,
    T: BootProvider<Error = AutounlockError>,
{
    let mut events = Vec::new();
    let bindings = resolve_and_validate(requests, providers.block, providers.luks, &mut events)?;

    for binding in &bindings {
        let request = &binding.request;
        events.push(event(
            WorkflowLevel::Info,
            format!(
                "Would write {} ({} bytes) and enroll it on {}",
                request.key_file.display(),
                config.keys.size_bytes,
                binding.device.display()
            ),
        ));
        events.push(event(
            WorkflowLevel::Info,
            format!(
                "Would record `{} UUID={} {} {}` in {}",
                request.name,
                binding.uuid,
                request.key_file.display(),
                config.keys.crypttab_options,
                config.paths.crypttab.display()
            ),
        ));
    }
    events.push(event(
        WorkflowLevel::Info,
        format!(
            "Would rewrite {}, rebuild the initramfs, and regenerate {}",
            config.paths.dracut_conf.display(),
            config.paths.grub_config.display()
        ),
    ));

    Ok(WorkflowReport {
        title: format!("Checked {} volume(s); no changes made", bindings.len()),
        events,
    })
}

/// Configure keyfile-based unlocking for every request, or leave the host as it was.
///
/// `credentials` is asked once per validated volume, before the first write,
/// for an existing key that authorises enrolling the new one.
pub fn configure_autounlock<B, L, T, F>(
    config: &AutounlockConfig,
    providers: &Providers<'_, B, L, T>,
    requests: &[VolumeRequest],
    mut credentials: F,
) -> AutounlockResult<WorkflowReport>
where
    B: BlockDeviceIndex<Error = AutounlockError>,
    L: LuksProvider<Error = AutounlockError>,
    T: BootProvider<Error = AutounlockError>,
    F: FnMut(&DeviceBinding) -> AutounlockResult<ExistingKey>,
{
    let mut events = Vec::new();
    let bindings = resolve_and_validate(requests, providers.block, providers.luks, &mut events)?;

    let mut existing_keys = Vec::with_capacity(bindings.len());
    for binding in &bindings {
        let key = detach_from_targets(credentials(binding)?, &bindings)?;
        if key.is_empty() {
            return Err(AutounlockError::Usage(format!(
                "existing key for `{}` cannot be empty",
                binding.request.name
            )));
        }
        existing_keys.push(key);
    }

    let mut journal = Journal::default();
    let outcome = apply(
        config,
        providers,
        &bindings,
        &existing_keys,
        &mut journal,
        &mut events,
    );

    if let Err(err) = outcome {
        if journal.is_empty() {
            return Err(err);
        }
        error!("{err}");
        warn!("rolling back {} completed change(s)", journal.len());
        events.push(event(WorkflowLevel::Error, err.to_string()));
        let failures = journal.rollback(providers.luks, providers.boot);
        if failures.is_empty() {
            events.push(event(
                WorkflowLevel::Warn,
                "Rolled back every completed change; the host is as it was.",
            ));
        }
        for failure in &failures {
            events.push(event(
                WorkflowLevel::Error,
                format!("Rollback step failed: {failure}"),
            ));
        }
        return Err(AutounlockError::RolledBack {
            source: Box::new(err),
            failures,
            events,
        });
    }

    events.push(event(
        WorkflowLevel::Info,
        "Reboot to confirm the volumes unlock without a passphrase.",
    ));
    Ok(WorkflowReport {
        title: format!("Configured automatic unlock for {} volume(s)", bindings.len()),
        events,
    })
}

/// An existing key file that is also a target of this run would be overwritten
/// with the new key before it authorises enrollment, so its bytes are read now
/// and supplied as a passphrase instead.
fn detach_from_targets(
    key: ExistingKey,
    bindings: &[DeviceBinding],
) -> AutounlockResult<ExistingKey> {
    if let ExistingKey::KeyFile(path) = &key {
        if bindings
            .iter()
            .any(|binding| same_file(path, &binding.request.key_file))
        {
            let bytes = read_existing(path)?.ok_or_else(|| {
                AutounlockError::Usage(format!(
                    "existing key file {} does not exist",
                    path.display()
                ))
            })?;
            debug!(
                "{} is replaced during this run; using its current contents",
                path.display()
            );
            return Ok(ExistingKey::Passphrase(bytes));
        }
    }
    Ok(key)
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    matches!(
        (fs::canonicalize(a), fs::canonicalize(b)),
        (Ok(left), Ok(right)) if left == right
    )
}

fn apply<B, L, T>(
    config: &AutounlockConfig,
    providers: &Providers<'_, B, L, T>,
    bindings: &[DeviceBinding],
    existing_keys: &[ExistingKey],
    journal: &mut Journal,
    events: &mut Vec<WorkflowEvent>,
) -> AutounlockResult<()>
where
    B: BlockDeviceIndex<Error = AutounlockError>,
    L: LuksProvider<Error = AutounlockError>,
    T: BootProvider<Error = AutounlockError>,
{
    let mut crypttab = provisioning::prepare_crypttab(config, bindings, journal, events)?;
    provisioning::provision_keys(
        config,
        providers.block,
        providers.luks,
        bindings,
        existing_keys,
        &mut crypttab,
        journal,
        events,
    )?;
    boot::update_boot_image(config, providers.boot, bindings, journal, events)?;
    boot::update_boot_loader(config, providers.boot, events)
}
