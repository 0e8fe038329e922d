//! Dracut drop-in rendering and initramfs listing audit.

use std::path::{Path, PathBuf};

/// Mode for a freshly created drop-in; dracut reads these as any other config.
pub const DROPIN_MODE: u32 = 0o644;

/// Dracut module that unlocks LUKS devices from crypttab in early boot.
pub const UNLOCK_MODULE: &str = "crypt";

/// Render the complete drop-in: the unlock module plus every key file.
pub fn render_dropin(keyfiles: &[PathBuf]) -> String {
    let items = keyfiles
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(" ");
    format!("add_dracutmodules+=\" {UNLOCK_MODULE} \"\ninstall_items+=\" {items} \"\n")
}

/// Base names of `keyfiles` that do not show up in an `lsinitrd` listing.
pub fn missing_from_listing(listing: &str, keyfiles: &[PathBuf]) -> Vec<String> {
    keyfiles
        .iter()
        .filter_map(|path| base_name(path))
        .filter(|name| !listing_contains(listing, name))
        .collect()
}

fn base_name(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

fn listing_contains(listing: &str, name: &str) -> bool {
    let suffix = format!("/{name}");
    listing.lines().any(|line| {
        line.split_whitespace()
            .any(|token| token == name || token.ends_with(&suffix))
    })
}
