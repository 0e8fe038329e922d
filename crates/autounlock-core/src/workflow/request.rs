use super::VolumeRequest;
use crate::config::AutounlockConfig;
use crate::error::{AutounlockError, AutounlockResult};
use std::collections::HashSet;

const VOLUME_PREFIX: &str = "luks-";

/// Turn the `-v` values into ordered volume requests.
///
/// Empty input, empty names, and repeated names are usage errors. The name is
/// not otherwise validated; a name without the `luks-` prefix is used as the
/// UUID verbatim.
pub fn collect_volumes(
    names: &[String],
    config: &AutounlockConfig,
) -> AutounlockResult<Vec<VolumeRequest>> {
    if names.is_empty() {
        return Err(AutounlockError::Usage(
            "at least one volume name is required".into(),
        ));
    }

    let mut seen = HashSet::new();
    let mut requests = Vec::with_capacity(names.len());
    for raw in names {
        let name = raw.trim();
        if name.is_empty() {
            return Err(AutounlockError::Usage("volume name cannot be empty".into()));
        }
        if !seen.insert(name) {
            return Err(AutounlockError::Usage(format!(
                "volume `{name}` was given more than once"
            )));
        }

        let uuid = name.strip_prefix(VOLUME_PREFIX).unwrap_or(name);
        requests.push(VolumeRequest {
            name: name.to_string(),
            uuid: uuid.to_string(),
            key_file: config.key_file_path(name),
        });
    }
    Ok(requests)
}
