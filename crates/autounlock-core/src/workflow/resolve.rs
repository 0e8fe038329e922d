use super::{event, DeviceBinding, VolumeRequest, WorkflowEvent, WorkflowLevel};
use crate::error::{AutounlockError, AutounlockResult};
use autounlock_provider::{BlockDeviceIndex, LuksProvider};
use log::{debug, warn};

/// Resolve each request to a device and validate it, without side effects.
///
/// Every request is checked even after a failure, so the operator sees all
/// problems at once. Any failure aborts with [`AutounlockError::Validation`].
pub fn resolve_and_validate<B, L>(
    requests: &[VolumeRequest],
    block: &B,
    luks: &L,
    events: &mut Vec<WorkflowEvent>,
) -> AutounlockResult<Vec<DeviceBinding>>
where
    B: BlockDeviceIndex<Error = AutounlockError>,
    L: LuksProvider<Error = AutounlockError>,
{
    let mut bindings = Vec::with_capacity(requests.len());
    let mut issues = Vec::new();

    for request in requests {
        match check_one(request, block, luks) {
            Ok(binding) => {
                events.push(event(
                    WorkflowLevel::Success,
                    format!(
                        "{} resolved to {} (LUKS UUID {})",
                        request.name,
                        binding.device.display(),
                        binding.uuid
                    ),
                ));
                bindings.push(binding);
            }
            Err(issue) => {
                warn!("{issue}");
                issues.push(issue);
            }
        }
    }

    if !issues.is_empty() {
        return Err(AutounlockError::Validation(issues));
    }
    Ok(bindings)
}

fn check_one<B, L>(request: &VolumeRequest, block: &B, luks: &L) -> Result<DeviceBinding, String>
where
    B: BlockDeviceIndex<Error = AutounlockError>,
    L: LuksProvider<Error = AutounlockError>,
{
    let name = &request.name;
    let device = match block.device_by_uuid(&request.uuid) {
        Ok(Some(device)) => device,
        Ok(None) => {
            return Err(AutounlockError::Resolution {
                volume: name.clone(),
                uuid: request.uuid.clone(),
            }
            .to_string())
        }
        Err(err) => return Err(format!("`{name}`: device lookup failed: {err}")),
    };
    debug!("{name}: UUID {} -> {}", request.uuid, device.display());

    if !block.is_block_device(&device) {
        return Err(format!(
            "`{name}`: {} is not a block device",
            device.display()
        ));
    }

    match luks.is_luks(&device) {
        Ok(true) => {}
        Ok(false) => {
            return Err(format!(
                "`{name}`: {} is not a valid LUKS container",
                device.display()
            ))
        }
        Err(err) => return Err(format!("`{name}`: LUKS check failed: {err}")),
    }

    let uuid = luks
        .luks_uuid(&device)
        .map_err(|err| format!("`{name}`: reading LUKS UUID failed: {err}"))?;
    if !uuid.eq_ignore_ascii_case(&request.uuid) {
        return Err(format!(
            "`{name}`: LUKS header on {} carries UUID {uuid}, expected {}",
            device.display(),
            request.uuid
        ));
    }

    Ok(DeviceBinding {
        request: request.clone(),
        device,
        uuid,
    })
}
