//! Crypttab preparation and per-volume key provisioning.

use super::{event, DeviceBinding, WorkflowEvent, WorkflowLevel};
use crate::config::AutounlockConfig;
use crate::crypttab::{backup_crypttab, read_crypttab, Crypttab, CrypttabEntry};
use crate::error::{AutounlockError, AutounlockResult};
use crate::journal::{Journal, Mutation};
use crate::keyfile::{
    fingerprint, generate_key, read_existing, restrict_key_file, write_raw_key_file,
};
use crate::persist::write_atomic;
use autounlock_provider::{BlockDeviceIndex, ExistingKey, LuksProvider};
use log::info;
use std::path::PathBuf;

const CRYPTTAB_NEW_MODE: u32 = 0o600;

/// The live crypttab plus where it is persisted.
pub(crate) struct CrypttabSession {
    path: PathBuf,
    table: Crypttab,
}

impl CrypttabSession {
    fn persist(&self) -> AutounlockResult<()> {
        write_atomic(&self.path, self.table.render().as_bytes(), CRYPTTAB_NEW_MODE)
    }
}

/// Back up the crypttab, then drop every entry named like a requested volume.
pub(crate) fn prepare_crypttab(
    config: &AutounlockConfig,
    bindings: &[DeviceBinding],
    journal: &mut Journal,
    events: &mut Vec<WorkflowEvent>,
) -> AutounlockResult<CrypttabSession> {
    let path = config.paths.crypttab.clone();
    let original = read_crypttab(&path)?;

    let mut table = match &original {
        Some(contents) => {
            let table = Crypttab::parse(&path, contents)?;
            let backup = backup_crypttab(&path)?;
            events.push(event(
                WorkflowLevel::Info,
                format!("Backed up {} to {}", path.display(), backup.display()),
            ));
            table
        }
        None => {
            events.push(event(
                WorkflowLevel::Warn,
                format!("{} does not exist; starting an empty table", path.display()),
            ));
            Crypttab::default()
        }
    };

    for binding in bindings {
        let name = &binding.request.name;
        let removed = table.remove_named(name);
        if removed > 0 {
            events.push(event(
                WorkflowLevel::Info,
                format!("Removed {removed} existing crypttab entr{} for {name}", plural(removed)),
            ));
        }
    }

    journal.record(Mutation::CrypttabRewritten {
        path: path.clone(),
        original: original.map(String::into_bytes),
    });
    let session = CrypttabSession { path, table };
    session.persist()?;
    Ok(session)
}

/// Generate, restrict, enroll, and record a key file for every binding, in order.
#[allow(clippy::too_many_arguments)]
pub(crate) fn provision_keys<B, L>(
    config: &AutounlockConfig,
    block: &B,
    luks: &L,
    bindings: &[DeviceBinding],
    existing_keys: &[ExistingKey],
    crypttab: &mut CrypttabSession,
    journal: &mut Journal,
    events: &mut Vec<WorkflowEvent>,
) -> AutounlockResult<()>
where
    B: BlockDeviceIndex<Error = AutounlockError>,
    L: LuksProvider<Error = AutounlockError>,
{
    let size = config.keys.size_bytes;

    for (binding, existing) in bindings.iter().zip(existing_keys) {
        let name = &binding.request.name;
        let key_path = &binding.request.key_file;

        let previous = read_existing(key_path)?;
        if previous.is_some() {
            events.push(event(
                WorkflowLevel::Warn,
                format!(
                    "{} already exists and will be replaced; the key slot enrolled with the old key stays on {}",
                    key_path.display(),
                    binding.device.display()
                ),
            ));
        }

        let key = generate_key(size);
        write_raw_key_file(key_path, &key)?;
        journal.record(Mutation::KeyFileWritten {
            path: key_path.clone(),
            previous,
        });
        restrict_key_file(key_path, size)?;
        events.push(event(
            WorkflowLevel::Security,
            format!(
                "Wrote {size}-byte key file {} (SHA-256 {})",
                key_path.display(),
                fingerprint(&key)
            ),
        ));

        luks.add_key(&binding.device, existing, key_path)?;
        journal.record(Mutation::KeySlotAdded {
            device: binding.device.clone(),
            keyfile: key_path.clone(),
        });
        events.push(event(
            WorkflowLevel::Success,
            format!("Enrolled {} on {}", key_path.display(), binding.device.display()),
        ));

        let uuid = block.device_uuid(&binding.device)?.ok_or_else(|| {
            AutounlockError::Provider(format!(
                "block-device index has no UUID for {}",
                binding.device.display()
            ))
        })?;
        if !uuid.eq_ignore_ascii_case(&binding.uuid) {
            return Err(AutounlockError::Provider(format!(
                "{} reports UUID {uuid} but its LUKS header carries {}",
                binding.device.display(),
                binding.uuid
            )));
        }

        let entry = CrypttabEntry::with_keyfile(name, &uuid, key_path, &config.keys.crypttab_options);
        info!("appending crypttab entry: {entry}");
        crypttab.table.push(entry);
        crypttab.persist()?;
        events.push(event(
            WorkflowLevel::Success,
            format!("Recorded {name} in {}", crypttab.path.display()),
        ));
    }

    Ok(())
}

fn plural(count: usize) -> &'static str {
    if count == 1 {
        "y"
    } else {
        "ies"
    }
}
